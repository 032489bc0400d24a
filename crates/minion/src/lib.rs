// Path: crates/minion/src/lib.rs
//! # Herd Minion
//!
//! The agent on every managed host. Authenticates against the first
//! responsive master of its configured list, subscribes to the publish
//! channel, evaluates every publication's target locally, executes the
//! named function on a bounded worker pool, and submits the return over
//! the request channel.
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]

pub mod auth;
pub mod engine;
pub mod functions;
pub mod grains;
pub mod transports;
pub mod workers;

pub use engine::Minion;
pub use functions::{ExecContext, FunctionRegistry};

#[cfg(test)]
mod tests;
