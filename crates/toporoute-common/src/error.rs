//! Error types for Toporoute
//!
//! `ToporouteError` covers every failure class the coordinator can observe:
//! - construction-time configuration problems (fatal)
//! - coordination store and gossip transport failures (recovered on the next trigger)
//! - malformed payloads (the offending entry is skipped)
//! - leader election ambiguity (previous state is kept)

/// Application-specific error types
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ToporouteError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("no peers available for leader election")]
    NoPeers,

    #[error("conflicting leader claims from services: {}", .0.join(", "))]
    ConflictingLeaders(Vec<String>),

    #[error("gossip join error: {0}")]
    GossipJoin(String),

    #[error("lease {0} not found")]
    LeaseNotFound(i64),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("{0} is shut down")]
    Shutdown(String),
}

impl ToporouteError {
    /// Whether the error comes from the election step and leaves leadership undecided
    pub fn is_leadership_ambiguity(&self) -> bool {
        matches!(
            self,
            ToporouteError::NoPeers | ToporouteError::ConflictingLeaders(_)
        )
    }

    /// Whether the error is expected to clear on the next membership change
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToporouteError::Store(_)
                | ToporouteError::GossipJoin(_)
                | ToporouteError::LeaseNotFound(_)
                | ToporouteError::TransactionFailed(_)
        )
    }
}

impl From<serde_json::Error> for ToporouteError {
    fn from(value: serde_json::Error) -> Self {
        ToporouteError::Serialization(value.to_string())
    }
}

/// Result alias used throughout the workspace
pub type Result<T> = std::result::Result<T, ToporouteError>;
