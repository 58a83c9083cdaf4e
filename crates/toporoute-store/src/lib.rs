//! Toporoute Store - Coordination store abstraction
//!
//! The coordinator delegates strong consistency to an external store that offers
//! linearizable put/get/delete, prefix watches and TTL leases. This crate provides:
//! - `CoordinationStore`: the async trait the coordinator is written against
//! - `MemoryStore`: an in-process implementation with lease expiry and keepalive streams

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, KeyValue, Lease, LeaseId, PutOp,
    WatchStream,
};
