//! Toporoute Common - Shared types, errors, and constants
//!
//! This crate provides the foundational types used across all Toporoute components:
//! - The service descriptor advertised by every instance
//! - Error taxonomy shared by the store, gossip and coordinator layers
//! - Wire-format separators and protocol defaults
//! - Metric names shared by every crate that records them

pub mod error;
pub mod metrics;
pub mod model;

// Re-exports for convenience
pub use error::{Result, ToporouteError};
pub use model::{GossipConf, ServiceDescriptor, canonical_services};

/// Separator between topics in an aggregated assignment value
pub const TOPICS_SEP: &str = ";";

/// Separator between the owners of a single topic
pub const TOPIC_SERVICE_SEP: &str = "|";

/// Separator between a topic and its owner list
pub const TOPIC_DATA_SEP: char = ':';

/// Default namespace path segment
pub const DEFAULT_NS: &str = "ns";

/// Default application path segment
pub const DEFAULT_AS: &str = "as";

/// Key suffix used when the whole assignment is stored under one key
pub const ALL_TOPICS_KEY: &str = "all";

/// Default assignment lease TTL in seconds
pub const DEFAULT_LEASE_TTL_SECS: u64 = 20;

/// Virtual replicas used for a service that does not advertise a positive weight
pub const DEFAULT_REPLICAS: usize = 100;
