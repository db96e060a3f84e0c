//! deadlock_guard - exclusive lock manager with deadlock detection
//!
//! Transactions request exclusive holds on named resources (bank accounts).
//! A request never blocks: it is granted, or denied with the current holder,
//! or denied because it closed a cycle in the wait-for graph. In the last
//! case one transaction of the cycle is aborted and its locks released.
//!
//! # Modules
//!
//! - [`core_types`] - TxId and ResourceKey
//! - [`lock`] - Lock table, wait-for graph, detector, coordinator
//! - [`ledger`] - Transaction status (pending / committed / aborted)
//! - [`risk`] - Contention scoring and acquisition ordering
//! - [`metrics`] - Lock manager counters
//! - [`workload`] - Concurrent transfer driver
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing setup

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod risk;
pub mod workload;

// Convenient re-exports at crate root
pub use core_types::{ACCOUNT_RESOURCE, ResourceKey, TxId};
pub use ledger::{AbortReason, InMemoryLedger, TransactionLedger, TxStatus};
pub use lock::{AcquireOutcome, DeadlockEvent, DenyReason, LockCoordinator, LockError};
pub use risk::{AcquisitionPlan, LogisticRiskAdvisor, RiskAdvisor, RiskFeatures};
pub use workload::{TransferService, TransferStatus, WorkloadReport, run_workload};
