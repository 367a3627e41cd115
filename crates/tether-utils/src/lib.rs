//! # Tether Utilities
//!
//! Shared helpers for the Tether workspace.
//!
//! For now this is the logging setup every binary runs at startup.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
