// Path: crates/types/src/lib.rs
#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! # Herd Types
//!
//! This crate is the foundational library for the herd workspace, containing
//! all core data structures, error types, and configuration objects.
//!
//! ## Architectural Role
//!
//! As the base crate, `herd-types` has minimal dependencies and is itself a
//! dependency for almost every other crate in the workspace. This structure
//! prevents circular dependencies and provides a stable, canonical definition
//! for shared types like `Envelope`, `Job`, `Return`, and the error taxonomy
//! used across the transport and dispatch layers.

/// The default maximum size in bytes for a single wire frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024; // 256 MiB

/// A top-level, crate-wide `Result` type alias with a default error type.
pub type Result<T, E = crate::error::CoreError> = std::result::Result<T, E>;

/// The canonical, self-describing binary codec used on the wire.
pub mod codec;
/// Shared configuration structures for the master, minion, and syndic daemons.
pub mod config;
/// The two-key message envelope and its encryption discriminator.
pub mod envelope;
/// A unified set of all error types used across the workspace.
pub mod error;
/// Tag-routed event records carried on the in-process bus.
pub mod event;
/// Minion identity newtype.
pub mod ident;
/// Jobs, job ids, and return records.
pub mod job;
/// Target expressions and matcher kinds.
pub mod target;
/// Typed payloads for the request, publish, and control channels.
pub mod wire;

pub use ident::MinionId;
pub use job::JobId;
