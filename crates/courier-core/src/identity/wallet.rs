//! Wallet keys, personal-sign signatures, and checksummed addresses

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};

use crate::crypto::{keccak256, random_bytes};
use crate::error::{CourierError, Result};

/// A 64-byte ECDSA signature plus the recovery id, allowing the signer's
/// public key (and hence wallet address) to be recovered from the digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverableSignature {
    /// Compact `r || s` encoding (64 bytes)
    pub bytes: Vec<u8>,
    /// Recovery id (0 or 1)
    pub recovery_id: u8,
}

impl RecoverableSignature {
    /// Recover the signer's public key from a 32-byte digest.
    ///
    /// # Errors
    ///
    /// Returns [`CourierError::InvalidSignature`] if the signature bytes or
    /// recovery id are malformed, or no key can be recovered.
    pub fn recover_key(&self, digest: &[u8; 32]) -> Result<VerifyingKey> {
        let signature = Signature::from_slice(&self.bytes)
            .map_err(|e| CourierError::InvalidSignature(format!("malformed signature: {}", e)))?;
        let recovery_id = RecoveryId::try_from(self.recovery_id)
            .map_err(|e| CourierError::InvalidSignature(format!("bad recovery id: {}", e)))?;
        VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
            .map_err(|e| CourierError::InvalidSignature(format!("recovery failed: {}", e)))
    }

    /// Recover the wallet address that personal-signed `message`.
    pub fn recover_address(&self, message: &str) -> Result<String> {
        let digest = personal_sign_digest(message.as_bytes());
        let key = self.recover_key(&digest)?;
        Ok(address_of(&key))
    }
}

/// Seam for external signers (hardware wallets, remote signing services).
/// The library only needs an address and personal-sign capability.
pub trait WalletSigner: Send + Sync {
    /// The EIP-55 checksummed address of this wallet
    fn address(&self) -> String;

    /// Sign `message` under the Ethereum personal-sign scheme
    fn sign_personal(&self, message: &str) -> Result<RecoverableSignature>;
}

/// An in-process wallet backed by a raw secp256k1 key. Used by the tests and
/// the CLI; production callers may supply their own [`WalletSigner`].
pub struct LocalWallet {
    signing_key: SigningKey,
}

impl LocalWallet {
    /// Generate a wallet with a fresh random key.
    pub fn generate() -> Result<Self> {
        // Rejection-sample until the bytes land inside the curve order.
        // One iteration succeeds with overwhelming probability.
        for _ in 0..8 {
            let bytes = random_bytes::<32>()?;
            if let Ok(signing_key) = SigningKey::from_slice(&bytes) {
                return Ok(Self { signing_key });
            }
        }
        Err(CourierError::Crypto(
            "could not sample a valid secp256k1 scalar".to_string(),
        ))
    }

    /// Construct a wallet from 32 raw private key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| CourierError::Crypto(format!("invalid wallet key: {}", e)))?;
        Ok(Self { signing_key })
    }

    /// The raw private key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<RecoverableSignature> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(digest)
            .map_err(|e| CourierError::Crypto(format!("signing failed: {}", e)))?;
        Ok(RecoverableSignature {
            bytes: signature.to_bytes().to_vec(),
            recovery_id: recovery_id.to_byte(),
        })
    }
}

impl WalletSigner for LocalWallet {
    fn address(&self) -> String {
        address_of(self.signing_key.verifying_key())
    }

    fn sign_personal(&self, message: &str) -> Result<RecoverableSignature> {
        let digest = personal_sign_digest(message.as_bytes());
        self.sign_digest(&digest)
    }
}

/// Keccak digest of a message under the `personal_sign` envelope:
/// `"\x19Ethereum Signed Message:\n" + len(message) + message`.
pub fn personal_sign_digest(message: &[u8]) -> [u8; 32] {
    let mut preimage =
        Vec::with_capacity(26 + message.len().to_string().len() + message.len());
    preimage.extend_from_slice(b"\x19Ethereum Signed Message:\n");
    preimage.extend_from_slice(message.len().to_string().as_bytes());
    preimage.extend_from_slice(message);
    keccak256(&preimage)
}

/// EIP-55 checksummed address of a public key: keccak256 of the uncompressed
/// point (sans the 0x04 prefix), last 20 bytes, mixed-case hex.
pub fn address_of(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut raw = [0u8; 20];
    raw.copy_from_slice(&digest[12..]);
    checksum_address(&raw)
}

fn checksum_address(raw: &[u8; 20]) -> String {
    let lower = hex::encode(raw);
    let hash = keccak256(lower.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> if i % 2 == 0 { 4 } else { 0 }) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_from_known_key() {
        // Private key 0x...01 maps to a well-known address
        let mut key = [0u8; 32];
        key[31] = 1;
        let wallet = LocalWallet::from_bytes(&key).unwrap();
        assert_eq!(
            wallet.address(),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
        );
    }

    #[test]
    fn test_checksum_casing() {
        // EIP-55 reference vectors
        let mut raw = [0u8; 20];
        raw.copy_from_slice(&hex::decode("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").unwrap());
        assert_eq!(
            checksum_address(&raw),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );

        raw.copy_from_slice(&hex::decode("fb6916095ca1df60bb79ce92ce3ea74c37c5d359").unwrap());
        assert_eq!(
            checksum_address(&raw),
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359"
        );
    }

    #[test]
    fn test_personal_sign_recovers_address() {
        let wallet = LocalWallet::generate().unwrap();
        let signature = wallet.sign_personal("courier identity test").unwrap();
        let recovered = signature.recover_address("courier identity test").unwrap();
        assert_eq!(recovered, wallet.address());
    }

    #[test]
    fn test_wrong_message_recovers_wrong_address() {
        let wallet = LocalWallet::generate().unwrap();
        let signature = wallet.sign_personal("original").unwrap();
        let recovered = signature.recover_address("tampered").unwrap();
        assert_ne!(recovered, wallet.address());
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let signature = RecoverableSignature {
            bytes: vec![0u8; 10],
            recovery_id: 0,
        };
        let result = signature.recover_key(&[0u8; 32]);
        assert!(matches!(result, Err(CourierError::InvalidSignature(_))));
    }

    #[test]
    fn test_wallet_roundtrips_bytes() {
        let wallet = LocalWallet::generate().unwrap();
        let restored = LocalWallet::from_bytes(&wallet.to_bytes()).unwrap();
        assert_eq!(wallet.address(), restored.address());
    }
}
