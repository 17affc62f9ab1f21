//! # debugport Utilities
//!
//! Shared helpers for the debugport workspace: logging setup built on
//! `tracing`, plus re-exported `tracing` macros.

pub mod logging;

pub use logging::{
    init_logging, init_logging_with, init_logging_with_level, LogConfig, LogFormat, LogLevel, LoggingError, LoggingGuard,
};
pub use tracing::{debug, error, info, trace, warn};
