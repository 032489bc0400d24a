// Path: crates/types/src/envelope.rs

//! The wire envelope.
//!
//! Every message on every channel is one MessagePack map with an `enc`
//! discriminator and an opaque `load`. Publications additionally carry an
//! unencrypted routing `hint` so a gateway can drop traffic for
//! disconnected minions without decrypting anything.

use crate::codec;
use crate::error::TransportError;
use crate::ident::MinionId;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// How the `load` bytes are protected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncKind {
    /// Unencrypted serialised load. Only the auth handshake and the
    /// loopback control channel use this.
    Clear,
    /// Load containing material encrypted under an RSA public key; used
    /// solely for the session-key grant.
    Pub,
    /// Load encrypted under the session key with authenticated encryption.
    Aes,
}

/// The routing hint attached to publish-channel envelopes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishHint {
    /// Deliver to every subscriber.
    Broadcast,
    /// Deliver only to the named minions.
    Targets(Vec<MinionId>),
}

impl PublishHint {
    /// Whether a subscriber with the given id should receive the message.
    pub fn includes(&self, id: &MinionId) -> bool {
        match self {
            Self::Broadcast => true,
            Self::Targets(ids) => ids.contains(id),
        }
    }
}

/// One framed wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Load protection discriminator.
    pub enc: EncKind,
    /// The serialised (and possibly encrypted) payload.
    #[serde(with = "serde_bytes")]
    pub load: Vec<u8>,
    /// Routing hint; present on publish-channel envelopes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<PublishHint>,
}

impl Envelope {
    /// Wraps a serialisable value in a clear envelope.
    pub fn clear<T: Serialize>(load: &T) -> Result<Self, TransportError> {
        Ok(Self {
            enc: EncKind::Clear,
            load: codec::to_bytes(load)?,
            hint: None,
        })
    }

    /// Wraps already-encrypted bytes in an `aes` envelope.
    pub fn aes(load: Vec<u8>) -> Self {
        Self {
            enc: EncKind::Aes,
            load,
            hint: None,
        }
    }

    /// Wraps a session-key grant in a `pub` envelope.
    pub fn rsa(load: Vec<u8>) -> Self {
        Self {
            enc: EncKind::Pub,
            load,
            hint: None,
        }
    }

    /// Attaches a routing hint, consuming and returning the envelope.
    pub fn with_hint(mut self, hint: PublishHint) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Decodes the load of a clear envelope.
    ///
    /// Fails with a protocol violation if the envelope is encrypted; the
    /// caller decides whether that means "re-auth" or "drop".
    pub fn open_clear<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        if self.enc != EncKind::Clear {
            return Err(TransportError::ProtocolViolation(format!(
                "expected clear envelope, got {:?}",
                self.enc
            )));
        }
        codec::from_bytes(&self.load)
    }

    /// Serialises the envelope for framing.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        codec::to_bytes(self)
    }

    /// Deserialises an envelope from one frame.
    pub fn from_bytes(b: &[u8]) -> Result<Self, TransportError> {
        codec::from_bytes(b)
    }
}
