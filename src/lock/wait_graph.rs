//! Wait-For Graph
//!
//! Directed "waiting_tx is blocked on holding_tx" edges recorded on every
//! conflicting grant attempt. Plain data structure; the coordinator owns the
//! guard around it.
//!
//! Repeated conflicts between the same pair collapse into one edge. Cycle
//! detection only needs reachability, so the duplicate edges the source
//! system kept add nothing.

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::core_types::TxId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitEdge {
    pub waiting: TxId,
    pub holding: TxId,
    pub created_at: DateTime<Utc>,
    /// Insertion sequence; keeps `all_edges` order stable for detection
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Default)]
pub struct WaitForGraph {
    /// waiting -> edges, in insertion order
    outgoing: FxHashMap<TxId, Vec<WaitEdge>>,
    /// holding -> waiting transactions
    incoming: FxHashMap<TxId, FxHashSet<TxId>>,
    edge_count: usize,
    next_seq: u64,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `waiting` is blocked on `holding`.
    ///
    /// Returns `false` if the edge already existed. Self-edges are ignored.
    pub fn add_edge(&mut self, waiting: TxId, holding: TxId) -> bool {
        if waiting == holding {
            return false;
        }

        let edges = self.outgoing.entry(waiting).or_default();
        if edges.iter().any(|e| e.holding == holding) {
            return false;
        }

        edges.push(WaitEdge {
            waiting,
            holding,
            created_at: Utc::now(),
            seq: self.next_seq,
        });
        self.next_seq += 1;
        self.incoming.entry(holding).or_default().insert(waiting);
        self.edge_count += 1;
        true
    }

    /// Every edge as `(waiting, holding)`, oldest first
    pub fn all_edges(&self) -> Vec<(TxId, TxId)> {
        let mut edges: Vec<&WaitEdge> = self.outgoing.values().flatten().collect();
        edges.sort_unstable_by_key(|e| e.seq);
        edges.iter().map(|e| (e.waiting, e.holding)).collect()
    }

    /// Remove the edges where `tx` is the waiting side
    pub fn remove_outgoing(&mut self, tx: TxId) -> usize {
        let Some(edges) = self.outgoing.remove(&tx) else {
            return 0;
        };
        for edge in &edges {
            if let Some(waiters) = self.incoming.get_mut(&edge.holding) {
                waiters.remove(&tx);
                if waiters.is_empty() {
                    self.incoming.remove(&edge.holding);
                }
            }
        }
        self.edge_count -= edges.len();
        edges.len()
    }

    /// Remove every edge where `tx` is either side. Returns how many went.
    pub fn remove_all_involving(&mut self, tx: TxId) -> usize {
        let outgoing = self.remove_outgoing(tx);
        let mut removed = 0;

        if let Some(waiters) = self.incoming.remove(&tx) {
            for waiter in waiters {
                if let Some(edges) = self.outgoing.get_mut(&waiter) {
                    let before = edges.len();
                    edges.retain(|e| e.holding != tx);
                    removed += before - edges.len();
                    if edges.is_empty() {
                        self.outgoing.remove(&waiter);
                    }
                }
            }
        }

        self.edge_count -= removed;
        outgoing + removed
    }

    /// Edges where `tx` is either side, oldest first
    pub fn edges_involving(&self, tx: TxId) -> Vec<WaitEdge> {
        let mut edges: Vec<WaitEdge> = self
            .outgoing
            .get(&tx)
            .map(|edges| edges.to_vec())
            .unwrap_or_default();

        if let Some(waiters) = self.incoming.get(&tx) {
            for waiter in waiters {
                if let Some(out) = self.outgoing.get(waiter) {
                    edges.extend(out.iter().filter(|e| e.holding == tx).cloned());
                }
            }
        }

        edges.sort_unstable_by_key(|e| e.seq);
        edges
    }

    pub fn involves(&self, tx: TxId) -> bool {
        self.outgoing.contains_key(&tx) || self.incoming.contains_key(&tx)
    }

    /// Number of transactions `tx` is currently waiting on
    pub fn out_degree(&self, tx: TxId) -> usize {
        self.outgoing.get(&tx).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.edge_count
    }

    pub fn is_empty(&self) -> bool {
        self.edge_count == 0
    }
}
