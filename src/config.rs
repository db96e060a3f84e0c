use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::risk::DEFAULT_REORDER_THRESHOLD;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Per-request lock traces (`LOCK` target)
    pub enable_tracing: bool,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LockConfig {
    /// Risk score at or above which acquisition order is reversed
    #[serde(default = "default_reorder_threshold")]
    pub reorder_threshold: f64,
    /// Append deadlock events to this JSON-lines file
    #[serde(default)]
    pub journal_path: Option<String>,
}

fn default_reorder_threshold() -> f64 {
    DEFAULT_REORDER_THRESHOLD
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            reorder_threshold: DEFAULT_REORDER_THRESHOLD,
            journal_path: None,
        }
    }
}

/// Contention driver settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkloadConfig {
    pub accounts: usize,
    pub initial_balance: f64,
    pub workers: usize,
    pub transfers_per_worker: usize,
    pub max_amount: f64,
    /// Acquire attempts before a transfer gives up
    pub max_attempts: usize,
    pub backoff_ms: u64,
    /// Reported to the risk advisor as system load
    pub system_load: f64,
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            accounts: 3,
            initial_balance: 10_000.0,
            workers: 8,
            transfers_per_worker: 200,
            max_amount: 2_000.0,
            max_attempts: 50,
            backoff_ms: 1,
            system_load: 0.6,
            seed: 42,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let threshold = self.lock.reorder_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("lock.reorder_threshold must be in [0, 1], got {}", threshold);
        }
        if self.workload.accounts < 2 {
            anyhow::bail!("workload.accounts must be at least 2");
        }
        Ok(())
    }
}
