//! Deadlock Detector
//!
//! Depth-first search over a wait-for snapshot, starting from the transaction
//! whose wait edge was just inserted. The traversal keeps an explicit path
//! stack instead of recursing, so the reported cycle is literally a slice of
//! that stack.
//!
//! # Victim policy
//!
//! The victim is the closing node: the node already on the path when the
//! traversal reached it again. Deterministic for a given edge order, not
//! cost-based. Only the first cycle found is reported.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::core_types::TxId;

/// A closed wait cycle: first and last elements are the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cycle {
    nodes: Vec<TxId>,
}

impl Cycle {
    fn closed(nodes: Vec<TxId>) -> Self {
        debug_assert!(nodes.len() >= 2 && nodes.first() == nodes.last());
        Self { nodes }
    }

    /// The transaction to abort
    pub fn victim(&self) -> TxId {
        // Non-empty by construction
        self.nodes[self.nodes.len() - 1]
    }

    /// The loop including the repeated closing node, e.g. `[a, b, a]`
    pub fn path(&self) -> &[TxId] {
        &self.nodes
    }

    /// Distinct members, in wait order
    pub fn members(&self) -> &[TxId] {
        &self.nodes[..self.nodes.len() - 1]
    }

    pub fn contains(&self, tx: TxId) -> bool {
        self.members().contains(&tx)
    }

    /// Number of distinct transactions in the loop
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_path(self) -> Vec<TxId> {
        self.nodes
    }
}

pub struct DeadlockDetector;

impl DeadlockDetector {
    /// Search for a cycle reachable from `start` in the graph formed by
    /// `edges` (`(waiting, holding)` pairs).
    ///
    /// Neighbors are visited in edge order.
    pub fn detect_cycle_from(start: TxId, edges: &[(TxId, TxId)]) -> Option<Cycle> {
        let graph = Self::build_graph(edges);
        if !graph.contains_key(&start) {
            return None;
        }

        let mut visited: FxHashSet<TxId> = FxHashSet::default();
        // Current DFS path and each node's position in it
        let mut path: Vec<TxId> = Vec::new();
        let mut on_path: FxHashMap<TxId, usize> = FxHashMap::default();
        // Next neighbor index to try, parallel to `path`
        let mut cursor: Vec<usize> = Vec::new();

        visited.insert(start);
        on_path.insert(start, 0);
        path.push(start);
        cursor.push(0);

        while let (Some(&node), Some(&idx)) = (path.last(), cursor.last()) {
            let neighbors = graph.get(&node).map(Vec::as_slice).unwrap_or(&[]);

            if idx >= neighbors.len() {
                path.pop();
                cursor.pop();
                on_path.remove(&node);
                continue;
            }

            if let Some(top) = cursor.last_mut() {
                *top += 1;
            }

            let next = neighbors[idx];
            if visited.insert(next) {
                on_path.insert(next, path.len());
                path.push(next);
                cursor.push(0);
            } else if let Some(&pos) = on_path.get(&next) {
                let mut nodes = path[pos..].to_vec();
                nodes.push(next);
                return Some(Cycle::closed(nodes));
            }
        }

        None
    }

    /// Adjacency lists keyed by waiting transaction
    fn build_graph(edges: &[(TxId, TxId)]) -> FxHashMap<TxId, Vec<TxId>> {
        let mut graph: FxHashMap<TxId, Vec<TxId>> = FxHashMap::default();
        for &(waiting, holding) in edges {
            graph.entry(waiting).or_default().push(holding);
        }
        graph
    }
}
