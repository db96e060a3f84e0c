//! deadlock_guard - transfer contention driver
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌─────────────────┐    ┌──────────┐
//! │  Config  │───▶│   Workload   │───▶│ LockCoordinator │───▶│  Report  │
//! │  (YAML)  │    │ (tokio tasks)│    │ (table + graph) │    │  (JSON)  │
//! └──────────┘    └──────────────┘    └─────────────────┘    └──────────┘
//! ```
//!
//! Usage: `deadlock_guard [--env dev]`

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use deadlock_guard::config::AppConfig;
use deadlock_guard::ledger::InMemoryLedger;
use deadlock_guard::lock::LockCoordinator;
use deadlock_guard::risk::LogisticRiskAdvisor;
use deadlock_guard::workload::run_workload;

// ============================================================
// CLI
// ============================================================

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn ensure_parent_dir(path: &str) -> anyhow::Result<()> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = deadlock_guard::logging::init_logging(&app_config);

    tracing::info!("Starting deadlock_guard in {} mode", env);

    if let Some(path) = &app_config.lock.journal_path {
        ensure_parent_dir(path)?;
    }

    let ledger = Arc::new(InMemoryLedger::new());
    let lm = Arc::new(
        LockCoordinator::with_config(ledger.clone(), &app_config.lock)
            .context("Failed to build lock coordinator")?,
    );

    println!("=== deadlock_guard: transfer contention run ===");
    println!(
        "accounts={} workers={} transfers/worker={} reorder_threshold={}",
        app_config.workload.accounts,
        app_config.workload.workers,
        app_config.workload.transfers_per_worker,
        lm.reorder_threshold()
    );

    let start = Instant::now();
    let report = run_workload(
        &app_config.workload,
        lm.clone(),
        ledger,
        Arc::new(LogisticRiskAdvisor::default()),
    )
    .await
    .with_context(|| "Workload failed")?;
    let elapsed = start.elapsed();

    println!("\n=== Report ({:.2?}) ===", elapsed);
    println!("{}", serde_json::to_string_pretty(&report)?);

    let events = lm.deadlock_events();
    if let Some(last) = events.last() {
        println!(
            "\nLast deadlock: #{} victim={} cycle={:?}",
            last.id, last.victim, last.cycle
        );
    }

    if let Err(e) = lm.check_invariants() {
        anyhow::bail!("Lock invariants violated after run [{}]: {}", e.code(), e);
    }
    if !report.is_conserved() {
        anyhow::bail!(
            "Balance total changed: {} -> {}",
            report.total_before,
            report.total_after
        );
    }

    println!("\n✅ {} transfers, money conserved, no locks left", report.transfers());
    Ok(())
}
