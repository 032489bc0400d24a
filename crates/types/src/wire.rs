// Path: crates/types/src/wire.rs

//! Typed payloads for the request, publish, and control channels.
//!
//! The envelope (`envelope.rs`) says how a load is protected; the types
//! here say what it means once opened. Demultiplexing is always on a
//! string `cmd`/`ret` discriminator inside the decoded map, so adding an
//! operation never changes the framing.

use crate::ident::MinionId;
use crate::job::{JobId, JobState, Return};
use crate::target::{MatcherKind, TargetSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The reserved function name that cancels a running job instead of
/// executing anything. Published like any other function with the jid to
/// kill as its single argument.
pub const KILL_FUNCTION: &str = "job.kill";

// --- Publish channel -------------------------------------------------------

/// The subscription announcement a minion sends once after connecting to
/// the publish channel, in the clear. It carries no authority: it only
/// tells the gateway which hint tag this connection answers to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscribeAnnounce {
    /// The subscribing minion.
    pub id: MinionId,
}

/// The decrypted body of a job publication.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishLoad {
    /// The job id.
    pub jid: JobId,
    /// The raw target expression; every minion re-evaluates it locally.
    pub tgt: String,
    /// How to interpret `tgt`.
    pub tgt_type: MatcherKind,
    /// The function to invoke, keyed `module.fun`.
    pub fun: String,
    /// Positional arguments.
    pub arg: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwarg: Map<String, Value>,
    /// Optional persistent returner name, forwarded to the minion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<String>,
    /// The requesting user.
    pub user: String,
}

impl PublishLoad {
    /// The target spec this publication was resolved against.
    pub fn target(&self) -> TargetSpec {
        TargetSpec::new(self.tgt.clone(), self.tgt_type)
    }
}

// --- Request channel: minion-initiated -------------------------------------

/// The clear-envelope request opening the auth handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthRequest {
    /// The minion's claimed identity.
    pub id: MinionId,
    /// The minion's RSA public key, PEM.
    #[serde(rename = "pub")]
    pub pub_pem: String,
    /// Random bytes binding the signed grant to this request.
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

/// Clear-envelope replies to an auth request that do not grant a session.
///
/// A successful handshake is answered with a `pub` envelope carrying a
/// [`SessionGrant`] instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ret", rename_all = "snake_case")]
pub enum AuthRefusal {
    /// Enrolled, waiting for operator acceptance; retry with backoff.
    Pending,
    /// The key is rejected; fatal.
    Full,
    /// The submitted key does not match the stored key; fatal, needs an
    /// operator.
    Denied,
}

/// The session-key delivery payload, sent in a `pub` envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionGrant {
    /// The master's RSA public key, PEM, pinned by the minion.
    #[serde(rename = "pub_key")]
    pub master_pub_pem: String,
    /// The session key, RSA-OAEP-encrypted to the minion's public key.
    #[serde(with = "serde_bytes")]
    pub key_ct: Vec<u8>,
    /// Master signature over SHA-256(key_ct ‖ token).
    #[serde(with = "serde_bytes")]
    pub sig: Vec<u8>,
    /// The token echoed from the [`AuthRequest`].
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

/// The decrypted body of an `aes` request-channel message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum RequestLoad {
    /// A job return.
    Return(Return),
    /// A liveness beat, also refreshing the master's grain cache.
    Heartbeat {
        /// The beating minion.
        id: MinionId,
        /// Current grain data.
        #[serde(default)]
        grains: Map<String, Value>,
    },
    /// A file request served through the master's file backend.
    FileFetch {
        /// The requesting minion.
        id: MinionId,
        /// Path relative to the configured file root.
        path: String,
    },
}

/// The decrypted body of an `aes` request-channel reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ret", rename_all = "snake_case")]
pub enum RequestReply {
    /// The request was processed (including returns that were discarded
    /// as unknown or expired; those are not the minion's problem).
    Ok,
    /// File contents.
    File {
        /// The raw bytes.
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// The request was understood and refused.
    Error {
        /// Stable error code, see `herd_types::error`.
        code: String,
        /// Human-readable detail.
        message: String,
    },
}

// --- Control channel: operator-initiated -----------------------------------

/// A request on the loopback control channel (CLI → master).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Publish a job.
    Publish {
        /// Target expression and matcher.
        target: TargetSpec,
        /// Function to invoke.
        fun: String,
        /// Positional arguments.
        #[serde(default)]
        arg: Vec<Value>,
        /// Keyword arguments.
        #[serde(default)]
        kwarg: Map<String, Value>,
        /// Optional persistent returner.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ret: Option<String>,
        /// Requesting user, for the audit trail.
        user: String,
        /// Gather timeout override in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// Fetch the current state of a job; polled by the CLI to stream
    /// returns as they arrive.
    JobStatus {
        /// The job to inspect.
        jid: JobId,
    },
    /// Invoke a master-side runner function.
    Runner {
        /// Runner name, keyed `module.fun`.
        fun: String,
        /// Positional arguments.
        #[serde(default)]
        arg: Vec<Value>,
    },
}

/// One collected return inside a [`JobStatusView`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReturnEntry {
    /// The return record.
    pub ret: Return,
    /// Whether it arrived after the job closed.
    pub late: bool,
}

/// A snapshot of one job's collection state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatusView {
    /// The job id.
    pub jid: JobId,
    /// Collecting or closed.
    pub state: JobState,
    /// The minions the publication was addressed to.
    pub expected: Vec<MinionId>,
    /// Returns collected so far, in arrival order.
    pub returns: Vec<ReturnEntry>,
    /// Targets that never returned; populated when the job closes.
    pub missing: Vec<MinionId>,
}

/// A reply on the loopback control channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "ret", rename_all = "snake_case")]
pub enum ControlReply {
    /// The job was published.
    Published {
        /// The allocated jid.
        jid: JobId,
        /// The pre-filtered target set (empty when the resolution
        /// degraded to broadcast).
        minions: Vec<MinionId>,
    },
    /// Job state snapshot.
    Job(JobStatusView),
    /// Runner result.
    Runner {
        /// The runner's return value.
        value: Value,
    },
    /// The request failed.
    Error {
        /// Stable error code, see `herd_types::error`.
        code: String,
        /// Human-readable detail.
        message: String,
    },
}
