// Path: crates/minion/src/auth.rs
//! The minion side of the key-acceptance handshake.
//!
//! Sends the clear `_auth` request, interprets the refusal states, and on
//! a grant verifies the master signature before installing the session
//! handle. The master key is pinned on first success; a preseeded
//! fingerprint (`master_finger`) is checked before pinning, and with
//! trust-on-first-use disabled an unpinned master is fatal.

use herd_crypto::{grant, AeadHandle, RsaKeypair};
use herd_transport::RequestClient;
use herd_types::codec;
use herd_types::envelope::{EncKind, Envelope};
use herd_types::error::{AuthError, CoreError, CryptoError};
use herd_types::wire::{AuthRefusal, AuthRequest, SessionGrant};
use herd_types::MinionId;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;

/// The file the pinned master key lives in, under the minion's pki dir.
const PINNED_MASTER_KEY: &str = "minion_master.pub";

/// Performs the handshake against one master.
pub struct AuthClient {
    id: MinionId,
    keys: Arc<RsaKeypair>,
    pki_dir: PathBuf,
    master_finger: Option<String>,
    trust_on_first_use: bool,
}

impl AuthClient {
    /// Builds the client.
    pub fn new(
        id: MinionId,
        keys: Arc<RsaKeypair>,
        pki_dir: PathBuf,
        master_finger: Option<String>,
        trust_on_first_use: bool,
    ) -> Self {
        Self {
            id,
            keys,
            pki_dir,
            master_finger,
            trust_on_first_use,
        }
    }

    fn pinned_path(&self) -> PathBuf {
        self.pki_dir.join(PINNED_MASTER_KEY)
    }

    fn pinned(&self) -> Option<String> {
        std::fs::read_to_string(self.pinned_path()).ok()
    }

    /// Runs one auth round trip. `Pending` means retry with backoff;
    /// `Rejected`, `Denied`, and `MasterNotTrusted` are fatal.
    pub async fn authenticate(
        &self,
        req_client: &dyn RequestClient,
    ) -> Result<AeadHandle, CoreError> {
        let mut token = vec![0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut token);
        let request = AuthRequest {
            id: self.id.clone(),
            pub_pem: self.keys.public_pem()?,
            token: token.clone(),
        };

        let reply = req_client.request(Envelope::clear(&request)?).await?;
        match reply.enc {
            EncKind::Clear => {
                let refusal: AuthRefusal = reply.open_clear()?;
                Err(match refusal {
                    AuthRefusal::Pending => AuthError::Pending.into(),
                    AuthRefusal::Full => AuthError::Rejected.into(),
                    AuthRefusal::Denied => AuthError::Denied.into(),
                })
            }
            EncKind::Pub => {
                let grant: SessionGrant = codec::from_bytes(&reply.load)?;
                self.install(&grant, &token)
            }
            EncKind::Aes => Err(CryptoError::Undecryptable(
                "aes envelope before a session was established".into(),
            )
            .into()),
        }
    }

    fn install(&self, grant: &SessionGrant, token: &[u8]) -> Result<AeadHandle, CoreError> {
        let pinned = self.pinned();

        if pinned.is_none() {
            match &self.master_finger {
                Some(expected) => {
                    let got = herd_crypto::keys::fingerprint(&grant.master_pub_pem)?;
                    if &got != expected {
                        tracing::error!(expected, got, "master fingerprint mismatch");
                        return Err(AuthError::MasterNotTrusted.into());
                    }
                }
                None if !self.trust_on_first_use => {
                    return Err(AuthError::MasterNotTrusted.into());
                }
                None => {}
            }
        }

        let opened = grant::open(&self.keys, grant, token, pinned.as_deref()).map_err(|e| {
            if pinned.is_some() && e == CryptoError::BadSignature {
                // The signature chain broke against our pinned copy.
                CoreError::from(AuthError::MasterNotTrusted)
            } else {
                e.into()
            }
        })?;

        if pinned.is_none() {
            std::fs::create_dir_all(&self.pki_dir)
                .and_then(|_| std::fs::write(self.pinned_path(), &opened.master_pub_pem))
                .map_err(|e| CryptoError::Keys(format!("pin master key: {}", e)))?;
            tracing::info!(path = %self.pinned_path().display(), "master key pinned");
        }

        Ok(opened.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use herd_crypto::SessionKeyring;
    use herd_types::error::TransportError;
    use parking_lot::Mutex;

    /// A fake master answering auth requests directly.
    struct FakeMaster {
        keys: RsaKeypair,
        keyring: SessionKeyring,
        replies: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl RequestClient for FakeMaster {
        async fn request(&self, env: Envelope) -> Result<Envelope, TransportError> {
            let req: AuthRequest = env.open_clear()?;
            let mode = self.replies.lock().pop().unwrap_or("grant");
            Ok(match mode {
                "pending" => Envelope::clear(&AuthRefusal::Pending)?,
                "denied" => Envelope::clear(&AuthRefusal::Denied)?,
                "full" => Envelope::clear(&AuthRefusal::Full)?,
                _ => {
                    let grant =
                        grant::seal(&self.keys, &self.keyring, &req.pub_pem, &req.token).unwrap();
                    Envelope::rsa(codec::to_bytes(&grant)?)
                }
            })
        }
    }

    fn fake_master() -> FakeMaster {
        FakeMaster {
            keys: RsaKeypair::generate(2048).unwrap(),
            keyring: SessionKeyring::new().unwrap(),
            replies: Mutex::new(Vec::new()),
        }
    }

    fn client(dir: &std::path::Path, finger: Option<String>, tofu: bool) -> AuthClient {
        AuthClient::new(
            MinionId::new("m1"),
            Arc::new(RsaKeypair::generate(2048).unwrap()),
            dir.to_path_buf(),
            finger,
            tofu,
        )
    }

    #[tokio::test]
    async fn test_grant_installs_and_pins() {
        let dir = tempfile::tempdir().unwrap();
        let master = fake_master();
        let client = client(dir.path(), None, true);

        let handle = client.authenticate(&master).await.unwrap();
        // The handle speaks the master's session.
        let sealed = master.keyring.handle().seal(b"x").unwrap();
        assert_eq!(handle.open(&sealed).unwrap(), b"x");
        assert!(dir.path().join(PINNED_MASTER_KEY).exists());
    }

    #[tokio::test]
    async fn test_pending_and_fatal_refusals() {
        let dir = tempfile::tempdir().unwrap();
        let master = fake_master();
        let client = client(dir.path(), None, true);

        *master.replies.lock() = vec!["pending"];
        assert!(matches!(
            client.authenticate(&master).await,
            Err(CoreError::Auth(AuthError::Pending))
        ));
        *master.replies.lock() = vec!["full"];
        assert!(matches!(
            client.authenticate(&master).await,
            Err(CoreError::Auth(AuthError::Rejected))
        ));
        *master.replies.lock() = vec!["denied"];
        assert!(matches!(
            client.authenticate(&master).await,
            Err(CoreError::Auth(AuthError::Denied))
        ));
    }

    #[tokio::test]
    async fn test_imposter_refused_after_pinning() {
        let dir = tempfile::tempdir().unwrap();
        let real = fake_master();
        let client = client(dir.path(), None, true);
        client.authenticate(&real).await.unwrap();

        // A different master (different identity key) now answers.
        let imposter = fake_master();
        assert!(matches!(
            client.authenticate(&imposter).await,
            Err(CoreError::Auth(AuthError::MasterNotTrusted))
        ));
    }

    #[tokio::test]
    async fn test_preseeded_fingerprint_checked() {
        let dir = tempfile::tempdir().unwrap();
        let master = fake_master();
        let right = herd_crypto::keys::fingerprint(&master.keys.public_pem().unwrap()).unwrap();

        let client_ok = client(dir.path(), Some(right), true);
        client_ok.authenticate(&master).await.unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let client_bad = client(dir2.path(), Some("00".repeat(32)), true);
        assert!(matches!(
            client_bad.authenticate(&master).await,
            Err(CoreError::Auth(AuthError::MasterNotTrusted))
        ));
    }

    #[tokio::test]
    async fn test_tofu_disabled_is_fatal_without_pin() {
        let dir = tempfile::tempdir().unwrap();
        let master = fake_master();
        let client = client(dir.path(), None, false);
        assert!(matches!(
            client.authenticate(&master).await,
            Err(CoreError::Auth(AuthError::MasterNotTrusted))
        ));
    }
}
