// Path: crates/transport/src/traits.rs
//! Trait definitions for the publish and request channels.

use async_trait::async_trait;
use herd_types::envelope::Envelope;
use herd_types::error::TransportError;
use herd_types::MinionId;

/// Identity of the remote end of one request-channel connection.
///
/// The `conn_id` is unique for the lifetime of the process and is what the
/// master's consecutive-failure accounting keys on; the `remote` string is
/// for logs only.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    /// Process-unique connection identifier.
    pub conn_id: u64,
    /// Remote address in display form.
    pub remote: String,
}

/// What a publish-channel subscriber observes.
#[derive(Clone, Debug, PartialEq)]
pub enum SubEvent {
    /// A publication arrived.
    Publication(Envelope),
    /// The subscription (re)connected. Nothing published while the
    /// connection was down is recovered, and the minion must re-auth
    /// before trusting anything further.
    Connected,
}

/// The master-side fan-out half of the publish channel.
#[async_trait]
pub trait PublishServer: Send + Sync {
    /// Emits one envelope to every connected subscriber the routing hint
    /// admits. Best effort: a slow or dead subscriber drops the message.
    async fn publish(&self, env: Envelope) -> Result<(), TransportError>;

    /// Ids of currently connected subscribers.
    fn connected(&self) -> Vec<MinionId>;

    /// Drops a subscriber's connection, if present. Used by the
    /// quarantine path.
    fn disconnect(&self, id: &MinionId);

    /// Stops accepting and closes every subscriber connection.
    async fn shutdown(&self);
}

/// The minion-side half of the publish channel.
#[async_trait]
pub trait PublishClient: Send {
    /// Waits for the next subscription event, transparently reconnecting
    /// with backoff. The first event after any (re)establishment is
    /// [`SubEvent::Connected`].
    async fn next(&mut self) -> Result<SubEvent, TransportError>;
}

/// A handler's reply, optionally terminating the connection after it is
/// written (the quarantine path uses this).
#[derive(Clone, Debug)]
pub struct Response {
    /// The reply envelope.
    pub envelope: Envelope,
    /// Close the connection once the reply is on the wire.
    pub close: bool,
}

impl From<Envelope> for Response {
    fn from(envelope: Envelope) -> Self {
        Self {
            envelope,
            close: false,
        }
    }
}

impl Response {
    /// A reply that also terminates the connection.
    pub fn closing(envelope: Envelope) -> Self {
        Self {
            envelope,
            close: true,
        }
    }
}

/// Server-side request dispatcher plugged into a [`RequestServer`].
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handles one request envelope and produces the reply.
    /// Errors are expressed inside the reply; the transport never
    /// interprets payloads.
    async fn handle(&self, peer: &PeerInfo, env: Envelope) -> Response;

    /// Notification that a connection closed; lets the dispatcher drop
    /// per-connection failure accounting.
    async fn connection_closed(&self, peer: &PeerInfo) {
        let _ = peer;
    }
}

/// The listening half of the request channel.
#[async_trait]
pub trait RequestServer: Send + Sync {
    /// Stops accepting and drains per-connection tasks.
    async fn shutdown(&self);
}

/// The connecting half of the request channel.
///
/// Implementations enforce the one-in-flight discipline: a request is not
/// written until the previous reply has been read off the same logical
/// stream.
#[async_trait]
pub trait RequestClient: Send + Sync {
    /// Sends one request and waits for its reply, up to the configured
    /// deadline. A deadline miss closes the logical stream (the late
    /// reply would desynchronise correlation) and surfaces `Timeout`.
    async fn request(&self, env: Envelope) -> Result<Envelope, TransportError>;
}
