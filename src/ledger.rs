//! Transaction Ledger
//!
//! Owns transaction status. The lock manager only ever moves a transaction to
//! `Aborted`; commits and balance changes belong to the caller's workflow.
//!
//! Reads go straight to the shared map, so a status read always reflects the
//! latest `mark_aborted` from this process. Callers must not cache status.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::core_types::TxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Committed,
    Aborted,
}

impl TxStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Committed | TxStatus::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Committed => "committed",
            TxStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a transaction was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    DeadlockVictim,
    InsufficientFunds,
    GaveUp,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::DeadlockVictim => "deadlock_victim",
            AbortReason::InsufficientFunds => "insufficient_funds",
            AbortReason::GaveUp => "gave_up",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Transaction not found: {0}")]
    UnknownTransaction(TxId),

    #[error("Invalid status transition for {tx}: {from} -> {to}")]
    InvalidTransition {
        tx: TxId,
        from: TxStatus,
        to: TxStatus,
    },

    #[error("Transaction already registered: {0}")]
    AlreadyRegistered(TxId),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::UnknownTransaction(_) => "UNKNOWN_TRANSACTION",
            LedgerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            LedgerError::AlreadyRegistered(_) => "ALREADY_REGISTERED",
        }
    }
}

/// Status authority consumed by the lock coordinator
pub trait TransactionLedger: Send + Sync {
    /// Current status, or `None` for an unknown transaction
    fn status(&self, tx: TxId) -> Option<TxStatus>;

    /// Move `tx` to `Aborted`.
    ///
    /// Returns `Ok(true)` if this call performed the transition and
    /// `Ok(false)` if `tx` was already aborted.
    fn mark_aborted(&self, tx: TxId, reason: AbortReason) -> Result<bool, LedgerError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TxRecord {
    pub tx: TxId,
    pub status: TxStatus,
    pub abort_reason: Option<AbortReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub pending: usize,
    pub committed: usize,
    pub aborted: usize,
}

/// Ledger kept in process memory
pub struct InMemoryLedger {
    records: DashMap<TxId, TxRecord>,
    next_id: AtomicU64,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a new pending transaction
    pub fn begin(&self) -> TxId {
        let tx = TxId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Utc::now();
        self.records.insert(
            tx,
            TxRecord {
                tx,
                status: TxStatus::Pending,
                abort_reason: None,
                created_at: now,
                updated_at: now,
            },
        );
        tx
    }

    /// Register an externally allocated id as pending
    pub fn register(&self, tx: TxId) -> Result<(), LedgerError> {
        let now = Utc::now();
        match self.records.entry(tx) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(LedgerError::AlreadyRegistered(tx)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(TxRecord {
                    tx,
                    status: TxStatus::Pending,
                    abort_reason: None,
                    created_at: now,
                    updated_at: now,
                });
                self.next_id.fetch_max(tx.0 + 1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Pending -> Committed
    pub fn commit(&self, tx: TxId) -> Result<(), LedgerError> {
        let mut record = self
            .records
            .get_mut(&tx)
            .ok_or(LedgerError::UnknownTransaction(tx))?;

        if record.status != TxStatus::Pending {
            return Err(LedgerError::InvalidTransition {
                tx,
                from: record.status,
                to: TxStatus::Committed,
            });
        }
        record.status = TxStatus::Committed;
        record.updated_at = Utc::now();
        Ok(())
    }

    pub fn get(&self, tx: TxId) -> Option<TxRecord> {
        self.records.get(&tx).map(|r| r.clone())
    }

    pub fn abort_reason(&self, tx: TxId) -> Option<AbortReason> {
        self.records.get(&tx).and_then(|r| r.abort_reason)
    }

    pub fn counts(&self) -> LedgerCounts {
        let mut counts = LedgerCounts::default();
        for record in self.records.iter() {
            match record.status {
                TxStatus::Pending => counts.pending += 1,
                TxStatus::Committed => counts.committed += 1,
                TxStatus::Aborted => counts.aborted += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionLedger for InMemoryLedger {
    fn status(&self, tx: TxId) -> Option<TxStatus> {
        self.records.get(&tx).map(|r| r.status)
    }

    fn mark_aborted(&self, tx: TxId, reason: AbortReason) -> Result<bool, LedgerError> {
        let mut record = self
            .records
            .get_mut(&tx)
            .ok_or(LedgerError::UnknownTransaction(tx))?;

        match record.status {
            TxStatus::Aborted => Ok(false),
            TxStatus::Committed => Err(LedgerError::InvalidTransition {
                tx,
                from: TxStatus::Committed,
                to: TxStatus::Aborted,
            }),
            TxStatus::Pending => {
                record.status = TxStatus::Aborted;
                record.abort_reason = Some(reason);
                record.updated_at = Utc::now();
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_begin_allocates_sequential_ids() {
        let ledger = InMemoryLedger::new();
        let a = ledger.begin();
        let b = ledger.begin();

        assert_eq!(b.0, a.0 + 1);
        assert_eq!(ledger.status(a), Some(TxStatus::Pending));
        assert_eq!(ledger.status(TxId(999)), None);
    }

    #[test]
    fn test_mark_aborted_once() {
        let ledger = InMemoryLedger::new();
        let tx = ledger.begin();

        assert_eq!(ledger.mark_aborted(tx, AbortReason::DeadlockVictim), Ok(true));
        assert_eq!(ledger.mark_aborted(tx, AbortReason::GaveUp), Ok(false));
        assert_eq!(ledger.status(tx), Some(TxStatus::Aborted));
        // First reason sticks
        assert_eq!(ledger.abort_reason(tx), Some(AbortReason::DeadlockVictim));
    }

    #[test]
    fn test_committed_cannot_abort() {
        let ledger = InMemoryLedger::new();
        let tx = ledger.begin();
        ledger.commit(tx).unwrap();

        let err = ledger
            .mark_aborted(tx, AbortReason::DeadlockVictim)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(ledger.status(tx), Some(TxStatus::Committed));
    }

    #[test]
    fn test_aborted_cannot_commit() {
        let ledger = InMemoryLedger::new();
        let tx = ledger.begin();
        ledger.mark_aborted(tx, AbortReason::InsufficientFunds).unwrap();

        assert!(matches!(
            ledger.commit(tx),
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_unknown_transaction() {
        let ledger = InMemoryLedger::new();
        assert_eq!(
            ledger.mark_aborted(TxId(7), AbortReason::DeadlockVictim),
            Err(LedgerError::UnknownTransaction(TxId(7)))
        );
    }

    #[test]
    fn test_register_external_id() {
        let ledger = InMemoryLedger::new();
        ledger.register(TxId(10)).unwrap();
        assert_eq!(
            ledger.register(TxId(10)),
            Err(LedgerError::AlreadyRegistered(TxId(10)))
        );
        // Allocation continues past registered ids
        assert_eq!(ledger.begin(), TxId(11));
    }

    #[test]
    fn test_counts() {
        let ledger = InMemoryLedger::new();
        let a = ledger.begin();
        let b = ledger.begin();
        ledger.begin();
        ledger.commit(a).unwrap();
        ledger.mark_aborted(b, AbortReason::DeadlockVictim).unwrap();

        assert_eq!(
            ledger.counts(),
            LedgerCounts {
                pending: 1,
                committed: 1,
                aborted: 1
            }
        );
    }

    #[test]
    fn test_concurrent_abort_transitions_once() {
        let ledger = Arc::new(InMemoryLedger::new());
        let tx = ledger.begin();
        let transitions = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            let transitions = Arc::clone(&transitions);
            handles.push(thread::spawn(move || {
                if ledger.mark_aborted(tx, AbortReason::DeadlockVictim) == Ok(true) {
                    transitions.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }
}
