// Path: crates/crypto/src/grant.rs
//! Sealing and opening of the session-key grant.
//!
//! The grant is the `pub`-envelope payload finishing a successful auth
//! handshake: the session key wrapped to the minion's RSA key, signed by
//! the master, bound to the request token. The minion side verifies the
//! signature against its pinned master key *before* touching the
//! ciphertext; on first contact the embedded key is used and handed back
//! to the caller for pinning.

use crate::keys::{self, RsaKeypair};
use crate::session::{self, AeadHandle, SessionKeyring};
use herd_types::error::CryptoError;
use herd_types::wire::SessionGrant;
use rsa::RsaPublicKey;

fn signed_material(key_ct: &[u8], token: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key_ct.len() + token.len());
    buf.extend_from_slice(key_ct);
    buf.extend_from_slice(token);
    buf
}

/// Master side: wraps the current session key for `minion_pub_pem` and
/// signs it, echoing the auth-request `token`.
pub fn seal(
    master: &RsaKeypair,
    keyring: &SessionKeyring,
    minion_pub_pem: &str,
    token: &[u8],
) -> Result<SessionGrant, CryptoError> {
    let minion_pub = keys::public_key_from_pem(minion_pub_pem)?;
    let key_ct = keyring.wrap_for(&minion_pub)?;
    let sig = master.sign(&signed_material(&key_ct, token))?;
    Ok(SessionGrant {
        master_pub_pem: master.public_pem()?,
        key_ct,
        sig,
        token: token.to_vec(),
    })
}

/// What a successfully opened grant yields.
pub struct OpenedGrant {
    /// The installed session handle.
    pub handle: AeadHandle,
    /// The master public key the signature verified against, PEM. The
    /// caller pins this on first contact.
    pub master_pub_pem: String,
}

/// Minion side: verifies and opens a grant.
///
/// `pinned_pem` is the previously pinned master key, if any; when present
/// the embedded key must match it and the signature is checked against the
/// pinned copy, never the embedded one.
pub fn open(
    minion: &RsaKeypair,
    grant: &SessionGrant,
    expected_token: &[u8],
    pinned_pem: Option<&str>,
) -> Result<OpenedGrant, CryptoError> {
    if grant.token != expected_token {
        return Err(CryptoError::BadSignature);
    }

    let verify_pem = match pinned_pem {
        Some(pinned) => {
            if keys::fingerprint(pinned)? != keys::fingerprint(&grant.master_pub_pem)? {
                return Err(CryptoError::BadSignature);
            }
            pinned
        }
        None => grant.master_pub_pem.as_str(),
    };
    let verify_key: RsaPublicKey = keys::public_key_from_pem(verify_pem)?;
    keys::verify(
        &verify_key,
        &signed_material(&grant.key_ct, &grant.token),
        &grant.sig,
    )?;

    let raw = minion.decrypt_oaep(&grant.key_ct)?;
    let handle = session::handle_from_unwrapped(&raw)?;
    Ok(OpenedGrant {
        handle,
        master_pub_pem: grant.master_pub_pem.clone(),
    })
}
