// Path: crates/master/src/auth.rs
//! The server side of the key-acceptance handshake.
//!
//! First contact enrols the key as pending; the minion retries with
//! backoff until the operator accepts. A submission whose key does not
//! match the stored key for its id is denied without any state
//! transition, and the denied copy is kept as evidence.

use herd_bus::EventBus;
use herd_crypto::{grant, RsaKeypair, SessionKeyring};
use herd_pki::{KeyState, KeyStore};
use herd_types::codec;
use herd_types::envelope::Envelope;
use herd_types::wire::{AuthRefusal, AuthRequest};
use serde_json::json;
use std::sync::Arc;

/// Handles `_auth` requests.
pub struct AuthHandler {
    keystore: Arc<KeyStore>,
    master_keys: Arc<RsaKeypair>,
    keyring: Arc<SessionKeyring>,
    bus: EventBus,
    auto_accept: bool,
}

impl AuthHandler {
    /// Builds the handler.
    pub fn new(
        keystore: Arc<KeyStore>,
        master_keys: Arc<RsaKeypair>,
        keyring: Arc<SessionKeyring>,
        bus: EventBus,
        auto_accept: bool,
    ) -> Self {
        Self {
            keystore,
            master_keys,
            keyring,
            bus,
            auto_accept,
        }
    }

    /// Runs the state machine for one auth request and produces the reply
    /// envelope.
    pub fn handle(&self, req: &AuthRequest) -> Envelope {
        match self.decide(req) {
            Ok(env) => env,
            Err(e) => {
                tracing::error!(id = %req.id, error = %e, "auth handling failed");
                refusal(AuthRefusal::Denied)
            }
        }
    }

    fn decide(&self, req: &AuthRequest) -> Result<Envelope, herd_types::error::CoreError> {
        let record = self.keystore.lookup(&req.id)?;
        let reply = match record {
            None => {
                if !req.id.is_path_safe() {
                    tracing::warn!(id = %req.id, "refusing unusable minion id");
                    return Ok(refusal(AuthRefusal::Denied));
                }
                self.keystore.enroll_pending(&req.id, &req.pub_pem)?;
                if self.auto_accept {
                    self.keystore.accept(&req.id)?;
                    self.fire("accept", &req.id);
                    return self.grant(req, &req.pub_pem);
                }
                self.fire("pending", &req.id);
                refusal(AuthRefusal::Pending)
            }
            Some(rec) if rec.state == KeyState::Pending => {
                if keys_match(&rec.pub_pem, &req.pub_pem) {
                    self.fire("pending", &req.id);
                    refusal(AuthRefusal::Pending)
                } else {
                    self.deny(req)?
                }
            }
            Some(rec) if rec.state == KeyState::Accepted => {
                if keys_match(&rec.pub_pem, &req.pub_pem) {
                    self.fire("accept", &req.id);
                    return self.grant(req, &rec.pub_pem);
                }
                self.deny(req)?
            }
            Some(rec) if rec.state == KeyState::Rejected => {
                self.fire("rejected", &req.id);
                refusal(AuthRefusal::Full)
            }
            Some(_) => {
                // Only a denied record remains for this id.
                self.fire("denied", &req.id);
                refusal(AuthRefusal::Denied)
            }
        };
        Ok(reply)
    }

    fn deny(&self, req: &AuthRequest) -> Result<Envelope, herd_types::error::CoreError> {
        tracing::warn!(id = %req.id, "key mismatch, denying");
        self.keystore.record_denied(&req.id, &req.pub_pem)?;
        self.fire("denied", &req.id);
        Ok(refusal(AuthRefusal::Denied))
    }

    fn grant(
        &self,
        req: &AuthRequest,
        stored_pem: &str,
    ) -> Result<Envelope, herd_types::error::CoreError> {
        let grant = grant::seal(&self.master_keys, &self.keyring, stored_pem, &req.token)?;
        tracing::info!(id = %req.id, "session key granted");
        Ok(Envelope::rsa(codec::to_bytes(&grant)?))
    }

    fn fire(&self, kind: &str, id: &herd_types::MinionId) {
        self.bus
            .fire_single(format!("herd/auth/{}/{}", kind, id), "id", json!(id.as_str()));
    }
}

fn keys_match(stored: &str, submitted: &str) -> bool {
    stored.trim() == submitted.trim()
}

fn refusal(refusal: AuthRefusal) -> Envelope {
    // The refusal variants are unit-like and always encode.
    Envelope::clear(&refusal).unwrap_or_else(|_| Envelope {
        enc: herd_types::envelope::EncKind::Clear,
        load: Vec::new(),
        hint: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_types::MinionId;

    fn rig(auto_accept: bool) -> (tempfile::TempDir, AuthHandler, Arc<KeyStore>, Arc<SessionKeyring>) {
        let dir = tempfile::tempdir().unwrap();
        let keystore = Arc::new(KeyStore::open(dir.path()).unwrap());
        let master_keys = Arc::new(RsaKeypair::generate(2048).unwrap());
        let keyring = Arc::new(SessionKeyring::new().unwrap());
        let bus = EventBus::new(1024);
        let handler = AuthHandler::new(
            keystore.clone(),
            master_keys,
            keyring.clone(),
            bus,
            auto_accept,
        );
        (dir, handler, keystore, keyring)
    }

    fn auth_req(id: &str, keys: &RsaKeypair) -> AuthRequest {
        AuthRequest {
            id: MinionId::new(id),
            pub_pem: keys.public_pem().unwrap(),
            token: b"sixteen_byte_tok".to_vec(),
        }
    }

    #[test]
    fn test_first_contact_is_pending_then_granted() {
        let (_dir, handler, keystore, _) = rig(false);
        let minion_keys = RsaKeypair::generate(2048).unwrap();
        let req = auth_req("m1", &minion_keys);

        let reply = handler.handle(&req);
        assert_eq!(reply.open_clear::<AuthRefusal>().unwrap(), AuthRefusal::Pending);

        // Still pending on retry.
        let reply = handler.handle(&req);
        assert_eq!(reply.open_clear::<AuthRefusal>().unwrap(), AuthRefusal::Pending);

        keystore.accept(&MinionId::new("m1")).unwrap();
        let reply = handler.handle(&req);
        assert_eq!(reply.enc, herd_types::envelope::EncKind::Pub);

        // The grant opens with the minion's key.
        let grant: herd_types::wire::SessionGrant = codec::from_bytes(&reply.load).unwrap();
        let opened = grant::open(&minion_keys, &grant, &req.token, None).unwrap();
        assert!(!opened.master_pub_pem.is_empty());
    }

    #[test]
    fn test_imposter_key_denied_without_transition() {
        let (_dir, handler, keystore, _) = rig(false);
        let real_keys = RsaKeypair::generate(2048).unwrap();
        let imposter_keys = RsaKeypair::generate(2048).unwrap();

        handler.handle(&auth_req("m1", &real_keys));
        keystore.accept(&MinionId::new("m1")).unwrap();

        let reply = handler.handle(&auth_req("m1", &imposter_keys));
        assert_eq!(reply.open_clear::<AuthRefusal>().unwrap(), AuthRefusal::Denied);

        // The real key is still accepted and still works.
        let rec = keystore.lookup(&MinionId::new("m1")).unwrap().unwrap();
        assert_eq!(rec.state, KeyState::Accepted);
        let reply = handler.handle(&auth_req("m1", &real_keys));
        assert_eq!(reply.enc, herd_types::envelope::EncKind::Pub);
    }

    #[test]
    fn test_rejected_key_gets_full() {
        let (_dir, handler, keystore, _) = rig(false);
        let keys = RsaKeypair::generate(2048).unwrap();
        handler.handle(&auth_req("m1", &keys));
        keystore.reject(&MinionId::new("m1")).unwrap();

        let reply = handler.handle(&auth_req("m1", &keys));
        assert_eq!(reply.open_clear::<AuthRefusal>().unwrap(), AuthRefusal::Full);
    }

    #[test]
    fn test_auto_accept_grants_on_first_contact() {
        let (_dir, handler, keystore, _) = rig(true);
        let keys = RsaKeypair::generate(2048).unwrap();
        let reply = handler.handle(&auth_req("m1", &keys));
        assert_eq!(reply.enc, herd_types::envelope::EncKind::Pub);
        assert_eq!(
            keystore.lookup(&MinionId::new("m1")).unwrap().unwrap().state,
            KeyState::Accepted
        );
    }
}
