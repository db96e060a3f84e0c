//! Lock Table - resource key to exclusive holder
//!
//! Sharded with `DashMap` so grants and releases on disjoint resources never
//! contend. The per-entry guard makes check-and-insert atomic: two concurrent
//! attempts on the same key cannot both observe "no holder".
//!
//! A secondary index (`tx -> keys`) keeps `release_all` at O(locks held).
//!
//! Lock order when nesting: table shard, then index shard. Nothing takes a
//! table shard while holding an index shard.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rustc_hash::FxHashSet;
use serde::Serialize;

use super::error::LockError;
use crate::core_types::{ResourceKey, TxId};

/// Lock mode. Only exclusive holds exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Exclusive,
}

/// A granted hold on one resource
#[derive(Debug, Clone, Serialize)]
pub struct Lock {
    pub key: ResourceKey,
    pub holder: TxId,
    pub mode: LockMode,
    pub created_at: DateTime<Utc>,
}

/// Result of a single grant attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryGrant {
    /// Resource was free and now belongs to the caller
    Granted,
    /// Caller already held the resource
    AlreadyHeld,
    /// Another transaction holds the resource
    Conflict(TxId),
}

#[derive(Default)]
pub struct LockTable {
    locks: DashMap<ResourceKey, Lock>,
    held: DashMap<TxId, FxHashSet<ResourceKey>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to grant `key` to `tx`.
    pub fn try_grant(&self, key: &ResourceKey, tx: TxId) -> TryGrant {
        self.try_grant_with(key, tx, |_| {})
    }

    /// Attempt to grant `key` to `tx`, running `on_conflict` with the holder
    /// while the resource entry is still locked.
    ///
    /// The holder cannot release `key` until `on_conflict` returns, so anything
    /// recorded there about the holder happens before its release.
    /// `on_conflict` must not touch this table.
    pub fn try_grant_with<F>(&self, key: &ResourceKey, tx: TxId, on_conflict: F) -> TryGrant
    where
        F: FnOnce(TxId),
    {
        match self.locks.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let holder = entry.get().holder;
                if holder == tx {
                    TryGrant::AlreadyHeld
                } else {
                    on_conflict(holder);
                    TryGrant::Conflict(holder)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Lock {
                    key: key.clone(),
                    holder: tx,
                    mode: LockMode::Exclusive,
                    created_at: Utc::now(),
                });
                // Index while the table entry is still locked
                self.held.entry(tx).or_default().insert(key.clone());
                TryGrant::Granted
            }
        }
    }

    /// Remove every lock held by `tx`. Idempotent.
    ///
    /// Returns the released keys.
    pub fn release_all(&self, tx: TxId) -> Vec<ResourceKey> {
        let Some((_, keys)) = self.held.remove(&tx) else {
            return Vec::new();
        };

        let mut released = Vec::with_capacity(keys.len());
        for key in keys {
            if self.locks.remove_if(&key, |_, lock| lock.holder == tx).is_some() {
                released.push(key);
            }
        }
        released
    }

    /// Current holder of `key`
    pub fn holder(&self, key: &ResourceKey) -> Option<TxId> {
        self.locks.get(key).map(|lock| lock.holder)
    }

    /// Keys held by `tx`, sorted
    pub fn locks_held_by(&self, tx: TxId) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self
            .held
            .get(&tx)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of locks currently granted
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Copy of every lock, sorted by key
    pub fn snapshot(&self) -> Vec<Lock> {
        let mut locks: Vec<Lock> = self.locks.iter().map(|e| e.value().clone()).collect();
        locks.sort_by(|a, b| a.key.cmp(&b.key));
        locks
    }

    /// Cross-check the table against its index.
    ///
    /// Only meaningful while no grant or release is in flight.
    pub fn check_invariants(&self) -> Result<(), LockError> {
        // Copy the index first; reading the table under an index guard would
        // invert the lock order.
        let indexed: Vec<(TxId, Vec<ResourceKey>)> = self
            .held
            .iter()
            .map(|e| (*e.key(), e.value().iter().cloned().collect()))
            .collect();

        for (tx, keys) in indexed {
            for key in &keys {
                match self.locks.get(key) {
                    None => {
                        return Err(LockError::OrphanIndexEntry {
                            key: key.clone(),
                            tx,
                        });
                    }
                    Some(lock) if lock.holder != tx => {
                        return Err(LockError::DuplicateHolder {
                            key: key.clone(),
                            holder: lock.holder,
                            indexed: tx,
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}
