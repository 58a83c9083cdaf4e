//! Toporoute server: configuration loading, logging, metrics and the node runtime.

pub mod cli;
pub mod metrics;
pub mod runtime;
pub mod startup;
