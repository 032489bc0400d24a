// Path: crates/crypto/src/lib.rs
//! # Herd Crypto Crate Lints
//!
//! This crate enforces a strict set of lints to ensure high-quality,
//! panic-free code. Panics are disallowed in non-test code to promote
//! robust error handling.
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )
)]
//! # Herd Cryptography
//!
//! RSA identity key management, the rotatable session key with its
//! authenticated-encryption handle, and the signed session-key grant
//! exchanged during the auth handshake.
//!
//! Ownership rule: the raw session-key bytes never leave this crate. Every
//! other component holds an [`session::AeadHandle`], and the only export of
//! the raw key is RSA-OAEP-wrapped inside a [`grant`] payload.

pub mod grant;
pub mod keys;
pub mod session;

pub use keys::RsaKeypair;
pub use session::{AeadHandle, SessionKeyring};
