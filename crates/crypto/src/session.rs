// Path: crates/crypto/src/session.rs
//! The rotatable session key and its authenticated-encryption handle.
//!
//! The master holds one 32-byte session key per process lifetime,
//! regenerated on start and rotatable on demand. Bulk traffic is encrypted
//! with AES-256-GCM under a key derived from the session key with
//! HKDF-SHA256; the wire form of a sealed message is `nonce ‖ ciphertext`.
//! A failed tag is reported as `BadHmac`, which is the signal minions use
//! to detect rotation and re-auth.

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use herd_types::error::CryptoError;
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::RsaPublicKey;
use sha2::Sha256;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SESSION_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HKDF_INFO: &[u8] = b"herd session aead v1";

/// The raw session key. Zeroized on drop; never exposed outside this crate.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub(crate) fn random() -> Self {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SESSION_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::Undecryptable("session key has wrong length".into()))?;
        Ok(Self(arr))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A sealing/opening handle over the current session key.
///
/// Cheap to clone through an `Arc`; components keep the handle they were
/// given and naturally age out on rotation when decryption starts failing.
pub struct AeadHandle {
    cipher: Aes256Gcm,
}

impl AeadHandle {
    pub(crate) fn derive(key: &SessionKey) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, key.as_bytes());
        let mut okm = [0u8; SESSION_KEY_LEN];
        hk.expand(HKDF_INFO, &mut okm)
            .map_err(|e| CryptoError::Undecryptable(format!("hkdf: {}", e)))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&okm));
        okm.zeroize();
        Ok(Self { cipher })
    }

    /// Seals a payload: random 96-bit nonce, AES-256-GCM, `nonce ‖ ct`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
        let ct = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Undecryptable("encrypt failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Opens a sealed payload; any tag mismatch is `BadHmac`.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::BadHmac);
        }
        let (nonce, ct) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| CryptoError::BadHmac)
    }
}

/// The master-side session-key holder.
///
/// Read-mostly: every dispatch clones the current `Arc<AeadHandle>` out of
/// the lock; rotation swaps in a fresh key and handle, and the old key is
/// not retained anywhere.
pub struct SessionKeyring {
    current: RwLock<Inner>,
}

struct Inner {
    key: SessionKey,
    handle: Arc<AeadHandle>,
}

impl SessionKeyring {
    /// Creates a keyring with a fresh random session key.
    pub fn new() -> Result<Self, CryptoError> {
        let key = SessionKey::random();
        let handle = Arc::new(AeadHandle::derive(&key)?);
        Ok(Self {
            current: RwLock::new(Inner { key, handle }),
        })
    }

    /// The current sealing/opening handle.
    pub fn handle(&self) -> Arc<AeadHandle> {
        self.current.read().handle.clone()
    }

    /// Replaces the session key. In-flight handles keep sealing under the
    /// old key but nothing new will open what they produce, which is
    /// exactly the signal that drives re-auth.
    pub fn rotate(&self) -> Result<(), CryptoError> {
        let key = SessionKey::random();
        let handle = Arc::new(AeadHandle::derive(&key)?);
        let mut guard = self.current.write();
        *guard = Inner { key, handle };
        tracing::info!("session key rotated");
        Ok(())
    }

    /// Wraps the raw session key for one minion: RSA-OAEP under the
    /// minion's public key. This is the only path the raw bytes take out
    /// of the crate, and they leave encrypted.
    pub fn wrap_for(&self, minion_pub: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
        let guard = self.current.read();
        crate::keys::encrypt_oaep(minion_pub, guard.key.as_bytes())
    }
}

/// Builds the minion-side handle from an unwrapped session key.
pub fn handle_from_unwrapped(raw: &[u8]) -> Result<AeadHandle, CryptoError> {
    let key = SessionKey::from_bytes(raw)?;
    AeadHandle::derive(&key)
    // `key` zeroizes on drop here.
}
