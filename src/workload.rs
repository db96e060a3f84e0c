//! Transfer workload driver
//!
//! The caller side of the lock manager: moves money between in-memory
//! accounts the way the transfer workflow does, from many concurrent tokio
//! tasks, to put the coordinator under real contention.
//!
//! # Transfer flow
//!
//! ```text
//! begin tx → score risk → plan order → acquire_ordered ──complete──▶ check funds → commit → release
//!                                          │
//!                               denied: aborted? ──yes──▶ release → DEADLOCK_ABORTED
//!                                          │ no
//!                               backoff, retry (max_attempts) ──▶ release → PENDING (gave up)
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::WorkloadConfig;
use crate::core_types::{ResourceKey, TxId};
use crate::ledger::{AbortReason, InMemoryLedger, LedgerCounts, LedgerError, TransactionLedger, TxStatus};
use crate::lock::{LockCoordinator, LockStats};
use crate::metrics::LockMetricsSnapshot;
use crate::risk::{RiskAdvisor, RiskFeatures};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("Source and target account cannot be the same")]
    SameAccount,

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Account not found: {0}")]
    UnknownAccount(String),

    #[error("Invalid workload config: {0}")]
    InvalidConfig(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl WorkloadError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkloadError::SameAccount => "SAME_ACCOUNT",
            WorkloadError::InvalidAmount => "INVALID_AMOUNT",
            WorkloadError::UnknownAccount(_) => "UNKNOWN_ACCOUNT",
            WorkloadError::InvalidConfig(_) => "INVALID_CONFIG",
            WorkloadError::Ledger(e) => e.code(),
        }
    }
}

/// Account balances, mutated only while both transfer locks are held
#[derive(Default)]
pub struct AccountBook {
    balances: DashMap<String, Decimal>,
}

impl AccountBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts "1".."=count", all starting at `initial`
    pub fn seeded(count: usize, initial: Decimal) -> Self {
        let book = Self::new();
        for id in 1..=count {
            book.open(id.to_string(), initial);
        }
        book
    }

    pub fn open(&self, id: impl Into<String>, balance: Decimal) {
        self.balances.insert(id.into(), balance);
    }

    pub fn balance(&self, id: &str) -> Option<Decimal> {
        self.balances.get(id).map(|b| *b)
    }

    pub fn total(&self) -> Decimal {
        self.balances.iter().map(|e| *e.value()).sum()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.balances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Caller must hold the locks on both accounts
    fn apply_transfer(&self, from: &str, to: &str, amount: Decimal) {
        if let Some(mut balance) = self.balances.get_mut(from) {
            *balance -= amount;
        }
        if let Some(mut balance) = self.balances.get_mut(to) {
            *balance += amount;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Committed,
    DeadlockAborted,
    InsufficientFunds,
    /// Still contended after `max_attempts`
    Pending,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Committed => "ok",
            TransferStatus::DeadlockAborted => "deadlock_aborted",
            TransferStatus::InsufficientFunds => "insufficient_funds",
            TransferStatus::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    pub tx: TxId,
    pub status: TransferStatus,
    pub attempts: usize,
    pub risk: f64,
    pub mitigation: Option<&'static str>,
}

pub struct TransferService {
    lm: Arc<LockCoordinator>,
    ledger: Arc<InMemoryLedger>,
    advisor: Arc<dyn RiskAdvisor>,
    accounts: Arc<AccountBook>,
    config: WorkloadConfig,
}

impl TransferService {
    pub fn new(
        lm: Arc<LockCoordinator>,
        ledger: Arc<InMemoryLedger>,
        advisor: Arc<dyn RiskAdvisor>,
        accounts: Arc<AccountBook>,
        config: WorkloadConfig,
    ) -> Self {
        Self {
            lm,
            ledger,
            advisor,
            accounts,
            config,
        }
    }

    /// Move `amount` from `from` to `to` under exclusive locks on both
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt, WorkloadError> {
        if from == to {
            return Err(WorkloadError::SameAccount);
        }
        if amount <= Decimal::ZERO {
            return Err(WorkloadError::InvalidAmount);
        }
        let source_balance = self
            .accounts
            .balance(from)
            .ok_or_else(|| WorkloadError::UnknownAccount(from.to_string()))?;
        if self.accounts.balance(to).is_none() {
            return Err(WorkloadError::UnknownAccount(to.to_string()));
        }

        let tx = self.ledger.begin();
        let keys = [ResourceKey::account(from), ResourceKey::account(to)];
        let features = RiskFeatures::for_transfer(
            self.config.system_load,
            self.lm.contention_depth(&keys, tx),
            amount.to_f64().unwrap_or(f64::MAX),
            source_balance.to_f64().unwrap_or(0.0),
        );
        let plan = self
            .lm
            .plan_acquisition(keys, self.advisor.as_ref(), &features);

        let receipt = |status: TransferStatus, attempts: usize| TransferReceipt {
            tx,
            status,
            attempts,
            risk: plan.risk,
            mitigation: plan.mitigation(),
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            if self.lm.acquire_ordered(&plan.order, tx).is_complete() {
                break;
            }

            if self.ledger.status(tx) == Some(TxStatus::Aborted) {
                self.lm.release_all(tx);
                debug!(tx = %tx, attempts, "Transfer aborted as deadlock victim");
                return Ok(receipt(TransferStatus::DeadlockAborted, attempts));
            }

            if attempts >= max_attempts {
                self.lm.release_all(tx);
                self.ledger.mark_aborted(tx, AbortReason::GaveUp)?;
                debug!(tx = %tx, attempts, "Transfer gave up under contention");
                return Ok(receipt(TransferStatus::Pending, attempts));
            }

            tokio::time::sleep(Duration::from_millis(self.config.backoff_ms)).await;
        }

        // Both locks held from here on
        let balance = self.accounts.balance(from).unwrap_or(Decimal::ZERO);
        if balance < amount {
            self.lm.release_all(tx);
            self.ledger.mark_aborted(tx, AbortReason::InsufficientFunds)?;
            return Ok(receipt(TransferStatus::InsufficientFunds, attempts));
        }

        if let Err(e) = self.ledger.commit(tx) {
            self.lm.release_all(tx);
            warn!(tx = %tx, code = e.code(), error = %e, "Commit refused after full grant");
            return Ok(receipt(TransferStatus::DeadlockAborted, attempts));
        }
        self.accounts.apply_transfer(from, to, amount);
        self.lm.release_all(tx);

        Ok(receipt(TransferStatus::Committed, attempts))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkloadReport {
    pub committed: usize,
    pub deadlock_aborted: usize,
    pub insufficient_funds: usize,
    pub gave_up: usize,
    pub reordered: usize,
    pub total_before: Decimal,
    pub total_after: Decimal,
    pub lock_stats: LockStats,
    pub metrics: LockMetricsSnapshot,
    pub ledger: LedgerCounts,
}

impl WorkloadReport {
    pub fn transfers(&self) -> usize {
        self.committed + self.deadlock_aborted + self.insufficient_funds + self.gave_up
    }

    /// Money is neither created nor destroyed
    pub fn is_conserved(&self) -> bool {
        self.total_before == self.total_after
    }

    fn absorb(&mut self, receipt: &TransferReceipt) {
        match receipt.status {
            TransferStatus::Committed => self.committed += 1,
            TransferStatus::DeadlockAborted => self.deadlock_aborted += 1,
            TransferStatus::InsufficientFunds => self.insufficient_funds += 1,
            TransferStatus::Pending => self.gave_up += 1,
        }
        if receipt.mitigation.is_some() {
            self.reordered += 1;
        }
    }
}

/// Run `config.workers` concurrent tasks, each issuing
/// `config.transfers_per_worker` random transfers
pub async fn run_workload(
    config: &WorkloadConfig,
    lm: Arc<LockCoordinator>,
    ledger: Arc<InMemoryLedger>,
    advisor: Arc<dyn RiskAdvisor>,
) -> Result<WorkloadReport, WorkloadError> {
    if config.accounts < 2 {
        return Err(WorkloadError::InvalidConfig(
            "at least two accounts required".to_string(),
        ));
    }
    let initial = Decimal::from_f64(config.initial_balance).ok_or_else(|| {
        WorkloadError::InvalidConfig(format!("initial_balance {}", config.initial_balance))
    })?;
    let max_cents = (config.max_amount * 100.0).max(1.0) as i64;

    let accounts = Arc::new(AccountBook::seeded(config.accounts, initial));
    let service = Arc::new(TransferService::new(
        lm.clone(),
        ledger.clone(),
        advisor,
        accounts.clone(),
        config.clone(),
    ));
    let total_before = accounts.total();

    info!(
        accounts = config.accounts,
        workers = config.workers,
        transfers_per_worker = config.transfers_per_worker,
        "Starting transfer workload"
    );

    let mut handles = Vec::with_capacity(config.workers);
    for worker in 0..config.workers {
        let service = service.clone();
        let ids = accounts.ids();
        let transfers = config.transfers_per_worker;
        let seed = config.seed.wrapping_add(worker as u64);

        handles.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut receipts = Vec::with_capacity(transfers);
            for _ in 0..transfers {
                let from = rng.gen_range(0..ids.len());
                let mut to = rng.gen_range(0..ids.len() - 1);
                if to >= from {
                    to += 1;
                }
                let amount = Decimal::new(rng.gen_range(1..=max_cents), 2);
                receipts.push(service.transfer(&ids[from], &ids[to], amount).await);
            }
            receipts
        }));
    }

    let mut report = WorkloadReport {
        total_before,
        ..WorkloadReport::default()
    };
    for handle in handles {
        let receipts = handle
            .await
            .map_err(|e| WorkloadError::InvalidConfig(format!("worker panicked: {}", e)))?;
        for receipt in receipts {
            report.absorb(&receipt?);
        }
    }

    report.total_after = accounts.total();
    report.lock_stats = lm.stats();
    report.metrics = lm.metrics();
    report.ledger = ledger.counts();

    info!(
        committed = report.committed,
        deadlock_aborted = report.deadlock_aborted,
        insufficient_funds = report.insufficient_funds,
        gave_up = report.gave_up,
        deadlocks = report.lock_stats.deadlocks,
        "Workload finished"
    );
    if !report.is_conserved() {
        warn!(
            before = %report.total_before,
            after = %report.total_after,
            "Balance total changed during workload"
        );
    }

    Ok(report)
}
