//! Core types used throughout the system
//!
//! Transaction identifiers and lockable resource keys. Both are opaque to the
//! lock manager: it only compares and hashes them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction ID - allocated by the ledger, never reused.
///
/// # Usage:
/// - Holder of a lock in the lock table
/// - Node in the wait-for graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl TxId {
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

impl From<u64> for TxId {
    fn from(id: u64) -> Self {
        TxId(id)
    }
}

/// Resource type used for bank accounts
pub const ACCOUNT_RESOURCE: &str = "account";

/// Identifies a lockable entity: `(resource_type, resource_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub resource_id: String,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Shorthand for an account resource
    pub fn account(resource_id: impl Into<String>) -> Self {
        Self::new(ACCOUNT_RESOURCE, resource_id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}
