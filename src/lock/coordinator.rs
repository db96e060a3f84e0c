//! Lock Coordinator
//!
//! Public entry point of the lock manager. Owns the lock table, the wait-for
//! graph and the deadlock log; every mutation of those goes through here.
//!
//! # Acquire
//!
//! ```text
//! try_grant ──free──▶ Granted
//!     │
//!  conflict: add edge tx → holder (resource entry still locked)
//!     │
//!  detect from tx (graph write lock) ──none──▶ Denied(Conflict)
//!     │
//!  claim victim (detach, mark aborted), record event, release ──▶ Denied(Deadlock)
//! ```
//!
//! Never blocks waiting for a resource. A denied caller retries, backs off or
//! releases at its own level.
//!
//! Lock order: table shard, then graph, then ledger. Releasing the victim's
//! locks runs with no lock held.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::detector::{Cycle, DeadlockDetector};
use super::error::LockError;
use super::events::{DeadlockEvent, DeadlockLog, EventJournal};
use super::table::{Lock, LockTable, TryGrant};
use super::wait_graph::{WaitEdge, WaitForGraph};
use crate::config::LockConfig;
use crate::core_types::{ResourceKey, TxId};
use crate::ledger::{AbortReason, TransactionLedger, TxStatus};
use crate::metrics::{LockMetrics, LockMetricsSnapshot};
use crate::risk::{AcquisitionPlan, RiskAdvisor, RiskFeatures};

/// Why a request was not granted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    /// Held by another transaction, no cycle. Retry later.
    Conflict { holder: TxId },
    /// The request exposed a deadlock, resolved by aborting `event.victim`
    Deadlock { event: DeadlockEvent },
    /// The requester itself has been aborted
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum AcquireOutcome {
    Granted,
    Denied(DenyReason),
}

impl AcquireOutcome {
    #[inline]
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted)
    }

    pub fn deny_reason(&self) -> Option<&DenyReason> {
        match self {
            AcquireOutcome::Granted => None,
            AcquireOutcome::Denied(reason) => Some(reason),
        }
    }

    /// Deadlock event this request triggered, if any
    pub fn deadlock(&self) -> Option<&DeadlockEvent> {
        match self {
            AcquireOutcome::Denied(DenyReason::Deadlock { event }) => Some(event),
            _ => None,
        }
    }
}

/// Result of acquiring a sequence of resources in order.
///
/// Not atomic: everything in `granted` stays held by the transaction even when
/// a later resource was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderedAcquire {
    pub granted: Vec<ResourceKey>,
    pub denied: Option<(ResourceKey, DenyReason)>,
}

impl OrderedAcquire {
    pub fn is_complete(&self) -> bool {
        self.denied.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseSummary {
    pub locks: usize,
    pub edges: usize,
}

/// Dashboard counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    pub locks: usize,
    pub waits: usize,
    pub deadlocks: usize,
}

enum Detection {
    Clear,
    RequesterAborted,
    Cycle(Cycle),
}

pub struct LockCoordinator {
    table: LockTable,
    graph: RwLock<WaitForGraph>,
    events: DeadlockLog,
    ledger: Arc<dyn TransactionLedger>,
    metrics: LockMetrics,
    reorder_threshold: f64,
}

impl LockCoordinator {
    /// Coordinator with default settings and no journal
    pub fn new(ledger: Arc<dyn TransactionLedger>) -> Self {
        Self::build(ledger, DeadlockLog::new(), LockConfig::default().reorder_threshold)
    }

    /// Coordinator configured from `config`; opens the journal if one is set
    pub fn with_config(
        ledger: Arc<dyn TransactionLedger>,
        config: &LockConfig,
    ) -> Result<Self, LockError> {
        let events = match &config.journal_path {
            Some(path) => DeadlockLog::with_journal(EventJournal::open(path)?),
            None => DeadlockLog::new(),
        };
        Ok(Self::build(ledger, events, config.reorder_threshold))
    }

    fn build(ledger: Arc<dyn TransactionLedger>, events: DeadlockLog, threshold: f64) -> Self {
        Self {
            table: LockTable::new(),
            graph: RwLock::new(WaitForGraph::new()),
            events,
            ledger,
            metrics: LockMetrics::new(),
            reorder_threshold: threshold,
        }
    }

    // ========================================================================
    // Acquire / Release
    // ========================================================================

    /// Request an exclusive hold on `(resource_type, resource_id)` for `tx`
    pub fn acquire_exclusive(
        &self,
        resource_type: &str,
        resource_id: &str,
        tx: TxId,
    ) -> AcquireOutcome {
        self.acquire(&ResourceKey::new(resource_type, resource_id), tx)
    }

    /// Request an exclusive hold on `key` for `tx`
    pub fn acquire(&self, key: &ResourceKey, tx: TxId) -> AcquireOutcome {
        if self.is_aborted(tx) {
            self.metrics.record_aborted_request();
            debug!(target: "LOCK", tx = %tx, key = %key, "Request from aborted transaction");
            return AcquireOutcome::Denied(DenyReason::Aborted);
        }

        let grant = self.table.try_grant_with(key, tx, |holder| {
            // Recorded before the holder can release `key`, so its release
            // is guaranteed to clean this edge up. Victims are marked under
            // the graph lock; once marked they never gain a new edge.
            let mut graph = self.write_graph();
            if !self.is_aborted(tx) {
                graph.add_edge(tx, holder);
            }
        });

        match grant {
            TryGrant::Granted => {
                // A concurrent abort may have released everything just before
                // this grant landed.
                if self.is_aborted(tx) {
                    self.release_all(tx);
                    self.metrics.record_aborted_request();
                    return AcquireOutcome::Denied(DenyReason::Aborted);
                }
                self.metrics.record_grant();
                debug!(target: "LOCK", tx = %tx, key = %key, "Lock granted");
                AcquireOutcome::Granted
            }
            TryGrant::AlreadyHeld => {
                self.metrics.record_reentrant_grant();
                AcquireOutcome::Granted
            }
            TryGrant::Conflict(holder) => {
                self.metrics.record_conflict();
                debug!(target: "LOCK", tx = %tx, holder = %holder, key = %key, "Lock conflict");

                match self.detect_and_claim(tx) {
                    Detection::Clear => AcquireOutcome::Denied(DenyReason::Conflict { holder }),
                    Detection::RequesterAborted => {
                        self.metrics.record_aborted_request();
                        AcquireOutcome::Denied(DenyReason::Aborted)
                    }
                    Detection::Cycle(cycle) => {
                        let event = self.resolve_deadlock(&cycle, tx);
                        AcquireOutcome::Denied(DenyReason::Deadlock { event })
                    }
                }
            }
        }
    }

    /// Acquire `keys` one by one in the given order, stopping at the first
    /// denial. Earlier grants are kept.
    pub fn acquire_ordered(&self, keys: &[ResourceKey], tx: TxId) -> OrderedAcquire {
        let mut granted = Vec::with_capacity(keys.len());
        for key in keys {
            match self.acquire(key, tx) {
                AcquireOutcome::Granted => granted.push(key.clone()),
                AcquireOutcome::Denied(reason) => {
                    return OrderedAcquire {
                        granted,
                        denied: Some((key.clone(), reason)),
                    };
                }
            }
        }
        OrderedAcquire {
            granted,
            denied: None,
        }
    }

    /// Drop every lock and wait edge of `tx`. Idempotent.
    ///
    /// Call on commit and on abort.
    pub fn release_all(&self, tx: TxId) -> ReleaseSummary {
        // Table first: once the locks are gone no new edge can point at `tx`,
        // so the graph pass below leaves nothing behind.
        let locks = self.table.release_all(tx).len();

        let involved = self.read_graph().involves(tx);
        let edges = if involved {
            self.write_graph().remove_all_involving(tx)
        } else {
            0
        };

        self.metrics.record_release();
        if locks > 0 || edges > 0 {
            debug!(target: "LOCK", tx = %tx, locks, edges, "Released");
        }
        ReleaseSummary { locks, edges }
    }

    // ========================================================================
    // Deadlock handling
    // ========================================================================

    /// Run detection from `tx` and, on a cycle, claim the victim under the
    /// same graph write lock: mark it aborted and detach its edges. A cycle
    /// is therefore resolved by exactly one detection pass.
    ///
    /// A victim the ledger refuses to abort (already committed) keeps its
    /// locks. Only its outgoing edges are dropped, since a committed
    /// transaction no longer waits on anything, and detection runs again.
    ///
    /// Ledger calls happen under the graph lock; the ledger must not call
    /// back into the coordinator.
    fn detect_and_claim(&self, tx: TxId) -> Detection {
        let mut graph = self.write_graph();

        // Claimed as a victim after this request started
        if self.is_aborted(tx) {
            return Detection::RequesterAborted;
        }

        loop {
            let snapshot = graph.all_edges();
            let Some(cycle) = DeadlockDetector::detect_cycle_from(tx, &snapshot) else {
                return Detection::Clear;
            };

            let victim = cycle.victim();
            match self.ledger.mark_aborted(victim, AbortReason::DeadlockVictim) {
                // Ok(false): aborted elsewhere but still in the graph
                Ok(_) => {
                    graph.remove_all_involving(victim);
                    self.metrics.record_victim_abort();
                    return Detection::Cycle(cycle);
                }
                Err(e) => {
                    let dropped = graph.remove_outgoing(victim);
                    warn!(
                        victim = %victim,
                        code = e.code(),
                        error = %e,
                        dropped,
                        "Victim cannot be aborted, dropping its wait edges"
                    );
                }
            }
        }
    }

    /// Record the event and free the already-claimed victim
    fn resolve_deadlock(&self, cycle: &Cycle, detected_by: TxId) -> DeadlockEvent {
        let victim = cycle.victim();
        let event = self.events.record(cycle, detected_by);
        self.metrics.record_deadlock();

        warn!(
            event_id = event.id,
            victim = %victim,
            detected_by = %detected_by,
            cycle = ?cycle.path(),
            "Deadlock detected"
        );

        let released = self.release_all(victim);
        info!(
            victim = %victim,
            locks = released.locks,
            edges = released.edges,
            "Deadlock victim aborted"
        );

        event
    }

    fn is_aborted(&self, tx: TxId) -> bool {
        self.ledger.status(tx) == Some(TxStatus::Aborted)
    }

    // ========================================================================
    // Acquisition ordering
    // ========================================================================

    /// Plan the order for `keys` using `advisor`'s score
    pub fn plan_acquisition(
        &self,
        keys: impl IntoIterator<Item = ResourceKey>,
        advisor: &dyn RiskAdvisor,
        features: &RiskFeatures,
    ) -> AcquisitionPlan {
        AcquisitionPlan::advise(keys, advisor, features, self.reorder_threshold)
    }

    pub fn reorder_threshold(&self) -> f64 {
        self.reorder_threshold
    }

    /// Number of transactions `tx` currently waits on
    pub fn estimated_wait_depth(&self, tx: TxId) -> usize {
        self.read_graph().out_degree(tx)
    }

    /// Waits a request from `tx` for `keys` would join right now: one per key
    /// held by another transaction, plus the waits that holder is stuck on
    pub fn contention_depth(&self, keys: &[ResourceKey], tx: TxId) -> usize {
        let holders: Vec<TxId> = keys
            .iter()
            .filter_map(|key| self.table.holder(key))
            .filter(|holder| *holder != tx)
            .collect();
        if holders.is_empty() {
            return 0;
        }

        let graph = self.read_graph();
        holders.iter().map(|holder| 1 + graph.out_degree(*holder)).sum()
    }

    // ========================================================================
    // Observability
    // ========================================================================

    pub fn stats(&self) -> LockStats {
        LockStats {
            locks: self.table.len(),
            waits: self.read_graph().len(),
            deadlocks: self.events.len(),
        }
    }

    pub fn metrics(&self) -> LockMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn deadlock_events(&self) -> Vec<DeadlockEvent> {
        self.events.events()
    }

    pub fn holder(&self, key: &ResourceKey) -> Option<TxId> {
        self.table.holder(key)
    }

    pub fn locks_held_by(&self, tx: TxId) -> Vec<ResourceKey> {
        self.table.locks_held_by(tx)
    }

    pub fn locks(&self) -> Vec<Lock> {
        self.table.snapshot()
    }

    pub fn edges_involving(&self, tx: TxId) -> Vec<WaitEdge> {
        self.read_graph().edges_involving(tx)
    }

    pub fn wait_edges(&self) -> Vec<(TxId, TxId)> {
        self.read_graph().all_edges()
    }

    /// Verify table/index agreement and that every wait edge points at a
    /// transaction that still holds something.
    ///
    /// Only meaningful while no request is in flight.
    pub fn check_invariants(&self) -> Result<(), LockError> {
        let result = self.table.check_invariants().and_then(|()| {
            for (waiting, holding) in self.read_graph().all_edges() {
                if self.table.locks_held_by(holding).is_empty() {
                    return Err(LockError::DanglingWaitEdge { waiting, holding });
                }
            }
            Ok(())
        });

        if let Err(e) = &result {
            error!(code = e.code(), error = %e, "Lock manager invariant violated");
        }
        result
    }

    fn read_graph(&self) -> RwLockReadGuard<'_, WaitForGraph> {
        self.graph.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_graph(&self) -> RwLockWriteGuard<'_, WaitForGraph> {
        self.graph.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::risk::FixedRiskAdvisor;

    fn setup() -> (Arc<InMemoryLedger>, LockCoordinator) {
        let ledger = Arc::new(InMemoryLedger::new());
        let coordinator = LockCoordinator::new(ledger.clone());
        (ledger, coordinator)
    }

    #[test]
    fn test_uncontended_grant() {
        let (ledger, lm) = setup();
        let tx = ledger.begin();

        assert!(lm.acquire_exclusive("account", "1", tx).is_granted());
        assert_eq!(lm.holder(&ResourceKey::account("1")), Some(tx));
        assert_eq!(lm.stats().locks, 1);
    }

    #[test]
    fn test_reacquire_own_lock() {
        let (ledger, lm) = setup();
        let tx = ledger.begin();

        lm.acquire_exclusive("account", "1", tx);
        assert!(lm.acquire_exclusive("account", "1", tx).is_granted());
        assert_eq!(lm.stats().locks, 1);
        assert_eq!(lm.stats().waits, 0);
        assert_eq!(lm.metrics().reentrant_grants, 1);
    }

    #[test]
    fn test_conflict_records_wait_edge() {
        let (ledger, lm) = setup();
        let t1 = ledger.begin();
        let t2 = ledger.begin();

        lm.acquire_exclusive("account", "1", t1);
        let outcome = lm.acquire_exclusive("account", "1", t2);

        assert_eq!(
            outcome,
            AcquireOutcome::Denied(DenyReason::Conflict { holder: t1 })
        );
        assert_eq!(lm.wait_edges(), vec![(t2, t1)]);
        assert_eq!(lm.estimated_wait_depth(t2), 1);
        assert!(lm.deadlock_events().is_empty());
    }

    #[test]
    fn test_release_clears_waiters_edges() {
        let (ledger, lm) = setup();
        let t1 = ledger.begin();
        let t2 = ledger.begin();

        lm.acquire_exclusive("account", "1", t1);
        lm.acquire_exclusive("account", "1", t2);

        let summary = lm.release_all(t1);
        assert_eq!(summary, ReleaseSummary { locks: 1, edges: 1 });
        assert_eq!(lm.stats(), LockStats::default());

        assert!(lm.acquire_exclusive("account", "1", t2).is_granted());
    }

    #[test]
    fn test_release_twice_is_noop() {
        let (ledger, lm) = setup();
        let tx = ledger.begin();
        lm.acquire_exclusive("account", "1", tx);

        lm.release_all(tx);
        assert_eq!(lm.release_all(tx), ReleaseSummary::default());
        assert!(lm.locks_held_by(tx).is_empty());
        assert!(lm.edges_involving(tx).is_empty());
    }

    #[test]
    fn test_aborted_transaction_is_refused() {
        let (ledger, lm) = setup();
        let tx = ledger.begin();
        ledger.mark_aborted(tx, AbortReason::GaveUp).unwrap();

        assert_eq!(
            lm.acquire_exclusive("account", "1", tx),
            AcquireOutcome::Denied(DenyReason::Aborted)
        );
        assert_eq!(lm.stats().locks, 0);
    }

    #[test]
    fn test_deadlock_aborts_closing_node() {
        let (ledger, lm) = setup();
        let t1 = ledger.begin();
        let t2 = ledger.begin();

        assert!(lm.acquire_exclusive("account", "1", t1).is_granted());
        assert!(lm.acquire_exclusive("account", "2", t2).is_granted());
        assert!(!lm.acquire_exclusive("account", "2", t1).is_granted());

        let outcome = lm.acquire_exclusive("account", "1", t2);
        let event = outcome.deadlock().expect("deadlock").clone();

        // Detection started at t2: path t2 -> t1 -> t2, closing node t2
        assert_eq!(event.victim, t2);
        assert_eq!(event.cycle, vec![t2, t1, t2]);
        assert_eq!(event.detected_by, t2);

        assert_eq!(ledger.status(t2), Some(TxStatus::Aborted));
        assert_eq!(ledger.status(t1), Some(TxStatus::Pending));
        assert!(lm.locks_held_by(t2).is_empty());
        assert!(lm.edges_involving(t2).is_empty());
        assert_eq!(lm.deadlock_events().len(), 1);
        assert!(lm.check_invariants().is_ok());

        // Survivor proceeds
        assert!(lm.acquire_exclusive("account", "2", t1).is_granted());
    }

    #[test]
    fn test_committed_victim_keeps_its_locks() {
        let (ledger, lm) = setup();
        let t1 = ledger.begin();
        let t2 = ledger.begin();

        assert!(lm.acquire_exclusive("account", "1", t1).is_granted());
        assert!(lm.acquire_exclusive("account", "2", t2).is_granted());
        assert!(!lm.acquire_exclusive("account", "2", t1).is_granted());

        // Committed but not yet released; the ledger refuses to abort it
        ledger.commit(t2).unwrap();
        let outcome = lm.acquire_exclusive("account", "1", t2);

        assert_eq!(
            outcome,
            AcquireOutcome::Denied(DenyReason::Conflict { holder: t1 })
        );
        assert_eq!(ledger.status(t2), Some(TxStatus::Committed));
        assert_eq!(lm.locks_held_by(t2), vec![ResourceKey::account("2")]);
        assert_eq!(lm.wait_edges(), vec![(t1, t2)]);
        assert!(lm.deadlock_events().is_empty());

        let metrics = lm.metrics();
        assert_eq!(metrics.deadlocks, 0);
        assert_eq!(metrics.victim_aborts, 0);

        // Account "2" stays with t2 until it releases
        assert_eq!(
            lm.acquire_exclusive("account", "2", t1),
            AcquireOutcome::Denied(DenyReason::Conflict { holder: t2 })
        );
        assert!(lm.check_invariants().is_ok());

        lm.release_all(t2);
        assert!(lm.acquire_exclusive("account", "2", t1).is_granted());
        assert_eq!(lm.stats().waits, 0);
    }

    #[test]
    fn test_contention_depth_counts_holders_and_their_waits() {
        let (ledger, lm) = setup();
        let t1 = ledger.begin();
        let t2 = ledger.begin();
        let t3 = ledger.begin();
        let keys = [ResourceKey::account("1"), ResourceKey::account("2")];

        assert_eq!(lm.contention_depth(&keys, t3), 0);

        lm.acquire_exclusive("account", "1", t1);
        lm.acquire_exclusive("account", "2", t2);
        assert_eq!(lm.contention_depth(&keys, t3), 2);

        // t1 now also waits on t2
        lm.acquire_exclusive("account", "2", t1);
        assert_eq!(lm.contention_depth(&keys, t3), 3);

        // Own locks do not count
        assert_eq!(lm.contention_depth(&keys, t2), 2);
        assert_eq!(lm.estimated_wait_depth(t3), 0);
    }

    #[test]
    fn test_acquire_ordered_keeps_partial_grants() {
        let (ledger, lm) = setup();
        let t1 = ledger.begin();
        let t2 = ledger.begin();
        lm.acquire_exclusive("account", "2", t2);

        let keys = [ResourceKey::account("1"), ResourceKey::account("2")];
        let result = lm.acquire_ordered(&keys, t1);

        assert!(!result.is_complete());
        assert_eq!(result.granted, vec![ResourceKey::account("1")]);
        assert_eq!(
            result.denied,
            Some((
                ResourceKey::account("2"),
                DenyReason::Conflict { holder: t2 }
            ))
        );
        assert_eq!(lm.locks_held_by(t1), vec![ResourceKey::account("1")]);
    }

    #[test]
    fn test_plan_uses_configured_threshold() {
        let ledger = Arc::new(InMemoryLedger::new());
        let config = LockConfig {
            reorder_threshold: 0.5,
            journal_path: None,
        };
        let lm = LockCoordinator::with_config(ledger, &config).unwrap();
        let features = RiskFeatures::new(0.6, 0, 100.0, false);
        let keys = vec![ResourceKey::account("1"), ResourceKey::account("2")];

        let plan = lm.plan_acquisition(keys.clone(), &FixedRiskAdvisor(0.6), &features);
        assert!(plan.reordered);

        let plan = lm.plan_acquisition(keys, &FixedRiskAdvisor(0.4), &features);
        assert!(!plan.reordered);
    }

    #[test]
    fn test_dangling_edge_detected() {
        let (ledger, lm) = setup();
        let t1 = ledger.begin();
        let t2 = ledger.begin();

        // Bypass the coordinator to fabricate the corruption
        lm.write_graph().add_edge(t1, t2);

        let err = lm.check_invariants().unwrap_err();
        assert_eq!(
            err,
            LockError::DanglingWaitEdge {
                waiting: t1,
                holding: t2
            }
        );
    }
}
