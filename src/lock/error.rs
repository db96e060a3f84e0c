//! Lock Manager Error Types
//!
//! Conflicts and deadlocks are reported as values through
//! [`AcquireOutcome`](super::AcquireOutcome). The variants here are the
//! conditions that must never happen; seeing one means a bug.

use thiserror::Error;

use crate::core_types::{ResourceKey, TxId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Two transactions claim the same resource
    #[error("Resource {key} indexed under {indexed} but held by {holder}")]
    DuplicateHolder {
        key: ResourceKey,
        holder: TxId,
        indexed: TxId,
    },

    /// Index entry for a lock that no longer exists
    #[error("Lock index lists {key} for {tx} but the table has no such lock")]
    OrphanIndexEntry { key: ResourceKey, tx: TxId },

    /// Wait edge still present after its transaction released everything
    #[error("Wait edge {waiting} -> {holding} survives release")]
    DanglingWaitEdge { waiting: TxId, holding: TxId },

    #[error("Deadlock journal error: {0}")]
    Journal(String),
}

impl LockError {
    /// Get the error code for logs and dashboards
    pub fn code(&self) -> &'static str {
        match self {
            LockError::DuplicateHolder { .. } => "DUPLICATE_HOLDER",
            LockError::OrphanIndexEntry { .. } => "ORPHAN_INDEX_ENTRY",
            LockError::DanglingWaitEdge { .. } => "DANGLING_WAIT_EDGE",
            LockError::Journal(_) => "JOURNAL_ERROR",
        }
    }

    /// Whether this error means lock manager state is corrupted
    pub fn is_invariant_violation(&self) -> bool {
        !matches!(self, LockError::Journal(_))
    }
}

impl From<std::io::Error> for LockError {
    fn from(e: std::io::Error) -> Self {
        LockError::Journal(e.to_string())
    }
}

impl From<serde_json::Error> for LockError {
    fn from(e: serde_json::Error) -> Self {
        LockError::Journal(e.to_string())
    }
}
