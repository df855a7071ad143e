//! Symmetric encryption layer using AES-256-GCM with HKDF key derivation
//!
//! Every envelope payload in the protocol is sealed with AES-256-GCM under a
//! key derived per message: a fresh 32-byte salt is drawn from the OS RNG and
//! HKDF-SHA256 stretches the caller's shared secret with that salt. The salt
//! and the 12-byte nonce travel with the ciphertext so the counterparty can
//! re-derive the key.

use hkdf::Hkdf;
use rand::TryRngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::error::{CourierError, Result};

/// HKDF salt size (32 bytes)
pub const SALT_SIZE: usize = 32;

/// Nonce size for AES-256-GCM (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag appended to the ciphertext (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Derived AEAD key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// An AEAD-sealed payload together with the key-derivation salt and nonce.
///
/// # Wire format
///
/// `payload` carries `ciphertext + auth_tag (16 bytes)`. The AEAD key is
/// never stored; it is re-derived as `HKDF-SHA256(secret, hkdf_salt)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    /// Salt fed to HKDF alongside the shared secret (32 bytes)
    pub hkdf_salt: Vec<u8>,
    /// AES-GCM nonce (12 bytes)
    pub gcm_nonce: Vec<u8>,
    /// Ciphertext with the authentication tag appended
    pub payload: Vec<u8>,
}

/// Fill a fixed-size buffer from the OS RNG.
///
/// # Errors
///
/// Returns [`CourierError::Randomness`] if the OS cannot supply entropy.
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    rand::rngs::OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CourierError::Randomness(e.to_string()))?;
    Ok(buf)
}

/// Derive a 32-byte AEAD key from a shared secret and salt via HKDF-SHA256.
pub fn hkdf(secret: &[u8], salt: &[u8]) -> Result<[u8; KEY_SIZE]> {
    hkdf_expand(secret, salt, &[])
}

/// HKDF-SHA256 with an explicit info string, expanded to 32 bytes.
///
/// Used for labeled derivations: deterministic invitation topics and key
/// material, and the private preferences topic identifier.
pub fn hkdf_expand(secret: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(info, &mut okm)
        .map_err(|e| CourierError::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Encrypt `plaintext` under a key derived from `secret` and a fresh salt.
///
/// A new 32-byte salt and 12-byte nonce are drawn from the OS RNG for every
/// call, so the same secret and plaintext never produce the same ciphertext.
/// `aad` is authenticated but not encrypted; pass `None` if unused.
///
/// # Errors
///
/// Returns [`CourierError::Randomness`] if the RNG cannot supply bytes, or
/// [`CourierError::Crypto`] if the AEAD seal fails.
pub fn encrypt(secret: &[u8], plaintext: &[u8], aad: Option<&[u8]>) -> Result<Ciphertext> {
    use aes_gcm::aead::{Aead, KeyInit, Payload};
    use aes_gcm::{Aes256Gcm, Key, Nonce};

    let hkdf_salt = random_bytes::<SALT_SIZE>()?;
    let gcm_nonce = random_bytes::<NONCE_SIZE>()?;
    let key = hkdf(secret, &hkdf_salt)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let payload = Payload {
        msg: plaintext,
        aad: aad.unwrap_or(&[]),
    };
    let sealed = cipher
        .encrypt(Nonce::from_slice(&gcm_nonce), payload)
        .map_err(|_| CourierError::Crypto("AEAD seal failed".to_string()))?;

    Ok(Ciphertext {
        hkdf_salt: hkdf_salt.to_vec(),
        gcm_nonce: gcm_nonce.to_vec(),
        payload: sealed,
    })
}

/// Decrypt a [`Ciphertext`] by re-deriving the key from the embedded salt.
///
/// # Errors
///
/// Returns [`CourierError::DecryptionFailed`] if the tag does not verify
/// (wrong secret, tampered payload, or mismatched `aad`), and
/// [`CourierError::Crypto`] if the salt or nonce have the wrong length.
pub fn decrypt(secret: &[u8], ciphertext: &Ciphertext, aad: Option<&[u8]>) -> Result<Vec<u8>> {
    use aes_gcm::aead::{Aead, KeyInit, Payload};
    use aes_gcm::{Aes256Gcm, Key, Nonce};

    if ciphertext.hkdf_salt.len() != SALT_SIZE {
        return Err(CourierError::Crypto(format!(
            "bad HKDF salt length: {}",
            ciphertext.hkdf_salt.len()
        )));
    }
    if ciphertext.gcm_nonce.len() != NONCE_SIZE {
        return Err(CourierError::Crypto(format!(
            "bad nonce length: {}",
            ciphertext.gcm_nonce.len()
        )));
    }
    if ciphertext.payload.len() < TAG_SIZE {
        return Err(CourierError::Crypto(
            "payload too short to contain auth tag".to_string(),
        ));
    }

    let key = hkdf(secret, &ciphertext.hkdf_salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let payload = Payload {
        msg: &ciphertext.payload,
        aad: aad.unwrap_or(&[]),
    };
    cipher
        .decrypt(Nonce::from_slice(&ciphertext.gcm_nonce), payload)
        .map_err(|_| CourierError::DecryptionFailed("AEAD open failed".to_string()))
}

/// SHA-256 digest.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(bytes);
    digest.into()
}

/// Keccak-256 digest (wallet address derivation and personal-sign digests).
pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let digest = Keccak256::digest(bytes);
    digest.into()
}
