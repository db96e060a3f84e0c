//! Lock Metrics - counters for grant/deny traffic
//!
//! Relaxed atomics; the snapshot is not a consistent cut across counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct LockMetrics {
    grants: AtomicU64,
    reentrant_grants: AtomicU64,
    conflicts: AtomicU64,
    deadlocks: AtomicU64,
    victim_aborts: AtomicU64,
    aborted_requests: AtomicU64,
    releases: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockMetricsSnapshot {
    pub grants: u64,
    pub reentrant_grants: u64,
    pub conflicts: u64,
    pub deadlocks: u64,
    pub victim_aborts: u64,
    pub aborted_requests: u64,
    pub releases: u64,
}

impl LockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_grant(&self) {
        self.grants.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reentrant_grant(&self) {
        self.reentrant_grants.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_deadlock(&self) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_victim_abort(&self) {
        self.victim_aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Request refused because the requester was already aborted
    #[inline]
    pub fn record_aborted_request(&self) {
        self.aborted_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            grants: self.grants.load(Ordering::Relaxed),
            reentrant_grants: self.reentrant_grants.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            victim_aborts: self.victim_aborts.load(Ordering::Relaxed),
            aborted_requests: self.aborted_requests.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}

impl LockMetricsSnapshot {
    /// Share of first-time grant attempts that hit a conflict
    pub fn conflict_ratio(&self) -> f64 {
        let attempts = self.grants + self.conflicts;
        if attempts == 0 {
            return 0.0;
        }
        self.conflicts as f64 / attempts as f64
    }
}
