// Path: crates/crypto/src/keys.rs
//! RSA identity keypairs: generation, PEM persistence, signing.
//!
//! Every daemon identity is one RSA keypair on disk: `<name>.pem` (PKCS#8
//! private key, mode 0600) and `<name>.pub` (SPKI public key). Keys are
//! generated on first start if absent.

use herd_types::error::CryptoError;
use rand::rngs::OsRng;
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::Path;

fn keys_err(ctx: &str, e: impl std::fmt::Display) -> CryptoError {
    CryptoError::Keys(format!("{}: {}", ctx, e))
}

/// An RSA identity keypair.
pub struct RsaKeypair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeypair {
    /// Generates a fresh keypair. `bits` is 2048 or 4096.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        if bits != 2048 && bits != 4096 {
            return Err(CryptoError::Keys(format!(
                "unsupported RSA modulus size: {}",
                bits
            )));
        }
        let private =
            RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| keys_err("generate", e))?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Loads `<dir>/<name>.pem`, generating and persisting a new keypair
    /// if the file does not exist.
    pub fn load_or_generate(dir: &Path, name: &str, bits: usize) -> Result<Self, CryptoError> {
        let pem_path = dir.join(format!("{}.pem", name));
        if pem_path.exists() {
            let raw = std::fs::read_to_string(&pem_path)
                .map_err(|e| keys_err("read private key", e))?;
            let private = RsaPrivateKey::from_pkcs8_pem(&raw)
                .map_err(|e| keys_err("parse private key", e))?;
            let public = private.to_public_key();
            return Ok(Self { private, public });
        }

        let pair = Self::generate(bits)?;
        std::fs::create_dir_all(dir).map_err(|e| keys_err("create pki dir", e))?;

        let pem = pair
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| keys_err("encode private key", e))?;
        std::fs::write(&pem_path, pem.as_bytes()).map_err(|e| keys_err("write private key", e))?;
        restrict_permissions(&pem_path)?;

        let pub_path = dir.join(format!("{}.pub", name));
        std::fs::write(&pub_path, pair.public_pem()?)
            .map_err(|e| keys_err("write public key", e))?;

        tracing::info!(path = %pem_path.display(), bits, "generated new RSA keypair");
        Ok(pair)
    }

    /// The public half, PEM-encoded.
    pub fn public_pem(&self) -> Result<String, CryptoError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| keys_err("encode public key", e))
    }

    /// Signs `data` with PKCS#1 v1.5 over SHA-256.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha256::digest(data);
        self.private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| keys_err("sign", e))
    }

    /// Decrypts an RSA-OAEP-SHA256 ciphertext addressed to this keypair.
    pub fn decrypt_oaep(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| CryptoError::Undecryptable(format!("oaep: {}", e)))
    }

    /// Borrows the public key.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }
}

/// Parses a PEM public key.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| keys_err("parse public key", e))
}

/// Encrypts `data` to `to` with RSA-OAEP-SHA256.
pub fn encrypt_oaep(to: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    to.encrypt(&mut OsRng, Oaep::new::<Sha256>(), data)
        .map_err(|e| keys_err("oaep encrypt", e))
}

/// Verifies a PKCS#1 v1.5 SHA-256 signature.
pub fn verify(key: &RsaPublicKey, data: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    let digest = Sha256::digest(data);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, sig)
        .map_err(|_| CryptoError::BadSignature)
}

/// The SHA-256 fingerprint of a PEM public key, lowercase hex.
pub fn fingerprint(pem: &str) -> Result<String, CryptoError> {
    let key = public_key_from_pem(pem)?;
    let der = key
        .to_public_key_der()
        .map_err(|e| keys_err("encode public key", e))?;
    Ok(hex::encode(Sha256::digest(der.as_bytes())))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| keys_err("chmod private key", e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), CryptoError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2048 bits keeps key generation fast enough for the test suite.
    const TEST_BITS: usize = 2048;

    #[test]
    fn test_sign_verify_roundtrip() {
        let pair = RsaKeypair::generate(TEST_BITS).unwrap();
        let sig = pair.sign(b"payload").unwrap();
        verify(pair.public_key(), b"payload", &sig).unwrap();
        assert_eq!(
            verify(pair.public_key(), b"tampered", &sig),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn test_oaep_roundtrip() {
        let pair = RsaKeypair::generate(TEST_BITS).unwrap();
        let ct = encrypt_oaep(pair.public_key(), b"session-key-bytes").unwrap();
        assert_eq!(pair.decrypt_oaep(&ct).unwrap(), b"session-key-bytes");
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = RsaKeypair::load_or_generate(dir.path(), "master", TEST_BITS).unwrap();
        let second = RsaKeypair::load_or_generate(dir.path(), "master", TEST_BITS).unwrap();
        assert_eq!(first.public_pem().unwrap(), second.public_pem().unwrap());
        assert!(dir.path().join("master.pem").exists());
        assert!(dir.path().join("master.pub").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        RsaKeypair::load_or_generate(dir.path(), "minion", TEST_BITS).unwrap();
        let mode = std::fs::metadata(dir.path().join("minion.pem"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let pair = RsaKeypair::generate(TEST_BITS).unwrap();
        let pem = pair.public_pem().unwrap();
        let a = fingerprint(&pem).unwrap();
        let b = fingerprint(&pem).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_rejects_odd_modulus() {
        assert!(RsaKeypair::generate(1024).is_err());
    }
}
