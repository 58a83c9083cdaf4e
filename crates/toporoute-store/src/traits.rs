//! Coordination store trait and value types

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use toporoute_common::Result;

/// Lease identifier issued by the store
pub type LeaseId = i64;

/// A stored key with its value and attached lease
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
    pub mod_revision: u64,
}

/// A granted lease
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// Renewal acknowledgement delivered on a keepalive stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// One put inside an all-or-nothing transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutOp {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
}

impl PutOp {
    pub fn new(key: impl Into<String>, value: impl Into<String>, lease: Option<LeaseId>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            lease,
        }
    }
}

/// Stream of full value sets under a watched prefix.
///
/// The first message is the current snapshot; every later message is the complete
/// set of keys under the prefix after a change.
pub type WatchStream = mpsc::UnboundedReceiver<Vec<KeyValue>>;

/// Stream of keepalive acknowledgements. Closes when the lease is gone.
pub type KeepAliveStream = mpsc::Receiver<KeepAliveResponse>;

/// Linearizable key/value store with leases and prefix watches
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Put a key, optionally attached to a lease
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Get a single key
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Get every key under a prefix, ordered by key
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Delete a single key, returning the number of deleted keys
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Delete every key under a prefix, returning the number of deleted keys
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Apply all puts atomically or none of them
    async fn txn_put(&self, ops: Vec<PutOp>) -> Result<()>;

    /// Grant a new lease
    async fn grant(&self, ttl: Duration) -> Result<Lease>;

    /// Revoke a lease, deleting every key it backs
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Keep a lease alive; renewals happen roughly every TTL/3 until the stream is dropped
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Watch a prefix
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;
}
