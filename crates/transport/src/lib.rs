// Path: crates/transport/src/lib.rs
//! # Herd Transport
//!
//! The two channels every deployment runs on:
//!
//! 1. **Publish channel**: one-way fan-out from the master to every
//!    subscribed minion. Best effort per connection, no retention.
//! 2. **Request channel**: minion-initiated request/reply, strictly one
//!    response per request, in order per connection.
//!
//! Both sit behind trait pairs (`traits.rs`) so adapters are pluggable.
//! Built in: framed TCP with optional TLS (`tcp.rs`, `tls.rs`) and an
//! in-process broker (`mem.rs`) for single-process deployments and tests.
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

pub mod backoff;
pub mod frame;
pub mod mem;
pub mod tcp;
pub mod tls;
pub mod traits;

pub use traits::{
    PeerInfo, PublishClient, PublishServer, RequestClient, RequestHandler, RequestServer, Response,
    SubEvent,
};
