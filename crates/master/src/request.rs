// Path: crates/master/src/request.rs
//! The master's request-channel handler.
//!
//! Demultiplexes on the envelope: `clear` carries the auth handshake,
//! `aes` carries returns, heartbeats, and file fetches from authenticated
//! minions. AEAD failures are counted per connection; three inside the
//! window terminate the connection and quarantine the bound minion.

use crate::auth::AuthHandler;
use crate::dispatcher::Dispatcher;
use crate::files::FileBackend;
use crate::inventory::MasterInventory;
use async_trait::async_trait;
use herd_bus::EventBus;
use herd_crypto::SessionKeyring;
use herd_pki::{KeyState, KeyStore};
use herd_transport::{PeerInfo, PublishServer, RequestHandler, Response};
use herd_types::codec;
use herd_types::envelope::{EncKind, Envelope};
use herd_types::error::{CryptoError, ErrorCode, TransportError, UserError};
use herd_types::wire::{AuthRequest, RequestLoad, RequestReply};
use herd_types::MinionId;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const STRIKE_WINDOW: Duration = Duration::from_secs(60);
const STRIKE_LIMIT: usize = 3;
const QUARANTINE: Duration = Duration::from_secs(300);

#[derive(Default)]
struct ConnState {
    strikes: HashMap<u64, Vec<Instant>>,
    bindings: HashMap<u64, MinionId>,
    quarantined: HashMap<MinionId, Instant>,
}

/// Handles everything minions send on the request channel.
pub struct MasterRequestHandler {
    auth: AuthHandler,
    dispatcher: Arc<Dispatcher>,
    keyring: Arc<SessionKeyring>,
    keystore: Arc<KeyStore>,
    inventory: Arc<MasterInventory>,
    files: Arc<dyn FileBackend>,
    pub_server: Arc<dyn PublishServer>,
    bus: EventBus,
    state: Mutex<ConnState>,
}

impl MasterRequestHandler {
    /// Wires the handler.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: AuthHandler,
        dispatcher: Arc<Dispatcher>,
        keyring: Arc<SessionKeyring>,
        keystore: Arc<KeyStore>,
        inventory: Arc<MasterInventory>,
        files: Arc<dyn FileBackend>,
        pub_server: Arc<dyn PublishServer>,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            auth,
            dispatcher,
            keyring,
            keystore,
            inventory,
            files,
            pub_server,
            bus,
            state: Mutex::new(ConnState::default()),
        })
    }

    /// Counts an AEAD failure; true means the connection is out of
    /// strikes and must be terminated.
    fn strike(&self, peer: &PeerInfo) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let strikes = state.strikes.entry(peer.conn_id).or_default();
        strikes.retain(|t| now.duration_since(*t) < STRIKE_WINDOW);
        strikes.push(now);
        let exhausted = strikes.len() >= STRIKE_LIMIT;
        if exhausted {
            state.strikes.remove(&peer.conn_id);
            if let Some(id) = state.bindings.get(&peer.conn_id).cloned() {
                state.quarantined.insert(id.clone(), now + QUARANTINE);
                drop(state);
                tracing::warn!(id = %id, remote = %peer.remote, "minion quarantined after repeated auth failures");
                self.pub_server.disconnect(&id);
                self.inventory.forget(&id);
            }
        }
        exhausted
    }

    /// Binds the connection to a minion identity and verifies the sender
    /// is accepted and not quarantined.
    fn check_identity(&self, peer: &PeerInfo, id: &MinionId) -> Result<(), RequestReply> {
        {
            let mut state = self.state.lock();
            if let Some(until) = state.quarantined.get(id) {
                if Instant::now() < *until {
                    return Err(error_reply(&UserError::NotAuthorized, "quarantined"));
                }
                state.quarantined.remove(id);
            }
            match state.bindings.get(&peer.conn_id) {
                None => {
                    state.bindings.insert(peer.conn_id, id.clone());
                }
                Some(bound) if bound == id => {}
                Some(bound) => {
                    tracing::warn!(
                        remote = %peer.remote,
                        bound = %bound,
                        claimed = %id,
                        "connection changed identity mid-stream"
                    );
                    return Err(error_reply(
                        &CryptoError::UnknownSender(id.to_string()),
                        "identity does not match this connection",
                    ));
                }
            }
        }

        match self.keystore.lookup(id) {
            Ok(Some(rec)) if rec.state == KeyState::Accepted => Ok(()),
            _ => Err(error_reply(
                &CryptoError::UnknownSender(id.to_string()),
                "sender key is not accepted",
            )),
        }
    }

    async fn handle_aes(&self, peer: &PeerInfo, load: RequestLoad) -> RequestReply {
        match load {
            RequestLoad::Return(ret) => {
                if let Err(reply) = self.check_identity(peer, &ret.id) {
                    return reply;
                }
                self.dispatcher.handle_return(ret)
            }
            RequestLoad::Heartbeat { id, grains } => {
                if let Err(reply) = self.check_identity(peer, &id) {
                    return reply;
                }
                let addr = peer_addr(&peer.remote);
                self.inventory.observe_heartbeat(&id, grains, addr);
                RequestReply::Ok
            }
            RequestLoad::FileFetch { id, path } => {
                if let Err(reply) = self.check_identity(peer, &id) {
                    return reply;
                }
                match self.files.fetch(&path).await {
                    Ok(data) => RequestReply::File { data },
                    Err(e) => error_reply(&e, &format!("fetch {}", path)),
                }
            }
        }
    }

    fn seal_reply(&self, reply: &RequestReply) -> Envelope {
        let sealed = codec::to_bytes(reply)
            .map_err(herd_types::error::CoreError::from)
            .and_then(|bytes| Ok(self.keyring.handle().seal(&bytes)?));
        match sealed {
            Ok(load) => Envelope::aes(load),
            Err(e) => {
                tracing::error!(error = %e, "failed to seal reply");
                clear_error_envelope(&e, "internal error")
            }
        }
    }
}

#[async_trait]
impl RequestHandler for MasterRequestHandler {
    async fn handle(&self, peer: &PeerInfo, env: Envelope) -> Response {
        match env.enc {
            EncKind::Clear => match env.open_clear::<AuthRequest>() {
                Ok(req) => {
                    self.state.lock().strikes.remove(&peer.conn_id);
                    self.auth.handle(&req).into()
                }
                Err(e) => {
                    tracing::warn!(remote = %peer.remote, error = %e, "undecodable clear request");
                    Response::closing(clear_error_envelope(&e, "bad request"))
                }
            },
            EncKind::Aes => {
                let opened = self.keyring.handle().open(&env.load);
                match opened {
                    Err(e) => {
                        self.bus.fire_single(
                            "herd/auth/drop",
                            "remote",
                            json!(peer.remote.clone()),
                        );
                        tracing::warn!(remote = %peer.remote, code = e.code(), "dropping unauthenticated message");
                        let envelope =
                            clear_error_envelope(&e, "message failed authentication, re-auth required");
                        if self.strike(peer) {
                            Response::closing(envelope)
                        } else {
                            envelope.into()
                        }
                    }
                    Ok(bytes) => match codec::from_bytes::<RequestLoad>(&bytes) {
                        Ok(load) => {
                            let reply = self.handle_aes(peer, load).await;
                            self.seal_reply(&reply).into()
                        }
                        Err(e) => {
                            tracing::warn!(remote = %peer.remote, error = %e, "undecodable request load");
                            Response::closing(clear_error_envelope(&e, "bad request load"))
                        }
                    },
                }
            }
            EncKind::Pub => {
                let e = TransportError::ProtocolViolation(
                    "pub envelopes are master-to-minion only".into(),
                );
                Response::closing(clear_error_envelope(&e, "unexpected envelope"))
            }
        }
    }

    async fn connection_closed(&self, peer: &PeerInfo) {
        let mut state = self.state.lock();
        state.strikes.remove(&peer.conn_id);
        state.bindings.remove(&peer.conn_id);
    }
}

fn error_reply(code: &dyn ErrorCode, message: &str) -> RequestReply {
    RequestReply::Error {
        code: code.code().to_string(),
        message: message.to_string(),
    }
}

fn clear_error_envelope(code: &dyn ErrorCode, message: &str) -> Envelope {
    let reply = error_reply(code, message);
    Envelope::clear(&reply).unwrap_or_else(|_| Envelope {
        enc: EncKind::Clear,
        load: Vec::new(),
        hint: None,
    })
}

fn peer_addr(remote: &str) -> Option<IpAddr> {
    remote
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(remote)
        .trim_matches(['[', ']'])
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_addr_parsing() {
        assert_eq!(peer_addr("10.0.0.1:40512"), "10.0.0.1".parse().ok());
        assert_eq!(peer_addr("[::1]:40512"), "::1".parse().ok());
        assert_eq!(peer_addr("mem"), None);
    }
}
