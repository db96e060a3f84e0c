//! Exclusive Lock Manager
//!
//! Serializes access to shared resources (bank accounts) across competing
//! transactions and breaks deadlocks as they form.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────┐
//!  acquire ──────▶│ LockCoordinator  │──── mark_aborted ───▶ TransactionLedger
//!  release_all    └──┬─────┬──────┬──┘
//!                    │     │      │
//!              LockTable   │   DeadlockLog
//!                    WaitForGraph
//!                          │
//!                   DeadlockDetector
//! ```
//!
//! # Invariants
//!
//! 1. **Mutual exclusion**: at most one holder per resource key, enforced by
//!    the table's per-entry guard
//! 2. **No dangling edges**: `release_all` removes locks first, then every
//!    edge touching the transaction
//! 3. **One event per cycle**: detection and victim claim share one graph
//!    write lock. A victim the ledger will not abort keeps its locks; only
//!    its outgoing edges are dropped
//! 4. **Non-blocking**: a conflict is returned as `Denied`, never waited on

pub mod coordinator;
pub mod detector;
pub mod error;
pub mod events;
pub mod table;
pub mod wait_graph;


pub use coordinator::{
    AcquireOutcome, DenyReason, LockCoordinator, LockStats, OrderedAcquire, ReleaseSummary,
};
pub use detector::{Cycle, DeadlockDetector};
pub use error::LockError;
pub use events::{DeadlockEvent, DeadlockLog, EventJournal};
pub use table::{Lock, LockMode, LockTable, TryGrant};
pub use wait_graph::{WaitEdge, WaitForGraph};
