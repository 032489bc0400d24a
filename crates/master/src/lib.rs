// Path: crates/master/src/lib.rs
//! # Herd Master
//!
//! The coordinating daemon: accepts minion keys, dispatches jobs to the
//! publish channel, collects returns on the request channel, keeps the job
//! cache, and exposes the loopback control channel the CLI talks to.
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
pub mod control;
pub mod dispatcher;
pub mod files;
pub mod inventory;
pub mod jobs;
pub mod master;
pub mod request;
pub mod runners;

pub use dispatcher::{Dispatcher, PublishCommand};
pub use master::Master;
