// Path: crates/telemetry/src/lib.rs
//! # Herd Telemetry
//!
//! Structured logging for the daemons and the CLI.

mod init;

pub use init::init_tracing;

/// The environment variable selecting the log level.
pub const LOG_LEVEL_ENV: &str = "HERD_LOG_LEVEL";
