// Path: crates/types/src/error/mod.rs
//! Core error types for the herd workspace.
//!
//! Each error family below corresponds to one recovery policy: transport
//! errors are retried with backoff, crypto errors trigger a re-handshake,
//! auth errors are surfaced to the operator, dispatch and user errors go
//! back to the caller, and internal errors are logged while the system
//! keeps running.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
///
/// The codes are part of the logging contract: they never change once
/// shipped, so operators can alert on them.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors arising from the publish and request channels.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is gone and reconnection has not yet succeeded.
    #[error("Transport disconnected")]
    Disconnected,
    /// A request missed its deadline.
    #[error("Request timed out")]
    Timeout,
    /// A reconnect cancelled all outstanding requests on the connection.
    #[error("Transport reset")]
    Reset,
    /// A frame announced a length above the configured maximum.
    #[error("Frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// The announced frame length.
        size: usize,
        /// The configured maximum.
        max: usize,
    },
    /// The peer sent bytes that do not decode as the expected protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::Disconnected => "TRANSPORT_DISCONNECTED",
            Self::Timeout => "TRANSPORT_TIMEOUT",
            Self::Reset => "TRANSPORT_RESET",
            Self::FrameTooLarge { .. } => "TRANSPORT_FRAME_TOO_LARGE",
            Self::ProtocolViolation(_) => "TRANSPORT_PROTOCOL_VIOLATION",
        }
    }
}

/// Errors arising from key handling, signing, and authenticated encryption.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// An RSA signature did not verify.
    #[error("Bad signature")]
    BadSignature,
    /// An authenticated-encryption tag did not verify.
    #[error("Message failed authentication")]
    BadHmac,
    /// Ciphertext could not be decrypted even though its tag verified,
    /// or key unwrapping failed.
    #[error("Undecryptable payload: {0}")]
    Undecryptable(String),
    /// An authenticated message arrived from an identity that is not accepted.
    #[error("Unknown or unaccepted sender: {0}")]
    UnknownSender(String),
    /// Key generation, loading, or persistence failed.
    #[error("Key handling failed: {0}")]
    Keys(String),
}

impl ErrorCode for CryptoError {
    fn code(&self) -> &'static str {
        match self {
            Self::BadSignature => "CRYPTO_BAD_SIGNATURE",
            Self::BadHmac => "CRYPTO_BAD_HMAC",
            Self::Undecryptable(_) => "CRYPTO_UNDECRYPTABLE",
            Self::UnknownSender(_) => "CRYPTO_UNKNOWN_SENDER",
            Self::Keys(_) => "CRYPTO_KEYS",
        }
    }
}

/// Errors arising from the key-acceptance handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The key is enrolled but not yet accepted; the minion retries.
    #[error("Key is pending acceptance")]
    Pending,
    /// The key has been rejected by the operator; fatal.
    #[error("Key has been rejected")]
    Rejected,
    /// The submitted key does not match the stored key for this id; fatal.
    #[error("Key denied: does not match the stored key for this id")]
    Denied,
    /// The master's key does not match the pinned key or the preseeded
    /// fingerprint; fatal unless trust-on-first-use applies.
    #[error("Master key is not trusted")]
    MasterNotTrusted,
}

impl ErrorCode for AuthError {
    fn code(&self) -> &'static str {
        match self {
            Self::Pending => "AUTH_PENDING",
            Self::Rejected => "AUTH_REJECTED",
            Self::Denied => "AUTH_DENIED",
            Self::MasterNotTrusted => "AUTH_MASTER_NOT_TRUSTED",
        }
    }
}

/// Errors arising from job dispatch and collection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The named function is not registered on the minion.
    #[error("No such function: {0}")]
    NoSuchFunction(String),
    /// The function rejected its arguments.
    #[error("Bad arguments: {0}")]
    BadArguments(String),
    /// The jid is unknown or its retention has expired.
    #[error("Job not found: {0}")]
    JobNotFound(String),
    /// A freshly allocated jid already exists in the cache; retried with a
    /// new suffix.
    #[error("Jid collision")]
    JidCollision,
}

impl ErrorCode for DispatchError {
    fn code(&self) -> &'static str {
        match self {
            Self::NoSuchFunction(_) => "DISPATCH_NO_SUCH_FUNCTION",
            Self::BadArguments(_) => "DISPATCH_BAD_ARGUMENTS",
            Self::JobNotFound(_) => "DISPATCH_JOB_NOT_FOUND",
            Self::JidCollision => "DISPATCH_JID_COLLISION",
        }
    }
}

/// Errors surfaced directly to the caller and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UserError {
    /// The requester is not authorised for the operation.
    #[error("Not authorized")]
    NotAuthorized,
    /// The target expression does not parse or names an unknown construct.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),
}

impl ErrorCode for UserError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotAuthorized => "USER_NOT_AUTHORIZED",
            Self::InvalidTarget(_) => "USER_INVALID_TARGET",
        }
    }
}

/// Internal conditions that are logged while the system continues running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InternalError {
    /// The job cache refused a new entry.
    #[error("Cache full")]
    CacheFull,
    /// A bounded queue overflowed and dropped work.
    #[error("Queue overflow")]
    QueueOverflow,
    /// The component is shutting down.
    #[error("Shutting down")]
    Shutdown,
    /// An I/O operation against local state failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl ErrorCode for InternalError {
    fn code(&self) -> &'static str {
        match self {
            Self::CacheFull => "INTERNAL_CACHE_FULL",
            Self::QueueOverflow => "INTERNAL_QUEUE_OVERFLOW",
            Self::Shutdown => "INTERNAL_SHUTDOWN",
            Self::Io(_) => "INTERNAL_IO",
        }
    }
}

/// The unified error type crossing crate boundaries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// See [`CryptoError`].
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// See [`AuthError`].
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// See [`DispatchError`].
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// See [`UserError`].
    #[error(transparent)]
    User(#[from] UserError),
    /// See [`InternalError`].
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl ErrorCode for CoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::Transport(e) => e.code(),
            Self::Crypto(e) => e.code(),
            Self::Auth(e) => e.code(),
            Self::Dispatch(e) => e.code(),
            Self::User(e) => e.code(),
            Self::Internal(e) => e.code(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(InternalError::Io(e.to_string()))
    }
}
