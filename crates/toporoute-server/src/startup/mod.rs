//! Process startup: logging and shutdown signal handling.

mod logging;
mod shutdown;

pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{ShutdownSignal, spawn_signal_listener};
