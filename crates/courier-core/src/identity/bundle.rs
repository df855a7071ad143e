//! Signed key bundles and the shared-secret derivations built on them
//!
//! A bundle chains three keys: the wallet signs the identity key over a
//! human-readable creation text, and the identity key signs the pre-key over
//! its digest. Validation walks the chain in reverse and yields the wallet
//! address, which doubles as the user's network identity.

use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use crate::crypto::{random_bytes, sha256};
use crate::error::{CourierError, Result};
use crate::identity::wallet::{RecoverableSignature, WalletSigner};
use crate::time::now_ns;

const IDENTITY_TEXT_PREFIX: &str = "XMTP : Create Identity\n";
const STORAGE_TEXT_PREFIX: &str = "XMTP : Enable Identity\n";
const TEXT_SUFFIX: &str = "\n\nFor more info: https://xmtp.org/signatures/";

/// A public key with its creation timestamp, before any signature is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedPublicKey {
    /// Creation time in nanoseconds since the Unix epoch
    pub created_ns: u64,
    /// SEC1 uncompressed point (65 bytes, 0x04 prefix)
    pub secp256k1_uncompressed: Vec<u8>,
}

impl UnsignedPublicKey {
    pub fn new(key: &VerifyingKey, created_ns: u64) -> Self {
        Self {
            created_ns,
            secp256k1_uncompressed: key.to_encoded_point(false).as_bytes().to_vec(),
        }
    }

    /// Serialized form used as the signing payload for this key.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_sec1_bytes(&self.secp256k1_uncompressed)
            .map_err(|e| CourierError::Crypto(format!("invalid public key point: {}", e)))
    }
}

/// A public key plus the signature that endorses it. Identity keys carry a
/// wallet personal-sign signature; pre-keys carry an identity-key signature
/// over the sha256 of the serialized key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPublicKey {
    /// Postcard-serialized [`UnsignedPublicKey`], kept as the exact bytes
    /// that were signed
    pub key_bytes: Vec<u8>,
    pub signature: RecoverableSignature,
}

impl SignedPublicKey {
    pub fn unsigned(&self) -> Result<UnsignedPublicKey> {
        Ok(postcard::from_bytes(&self.key_bytes)?)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        self.unsigned()?.verifying_key()
    }
}

/// The publishable half of an identity: signed identity key and pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    pub identity_key: SignedPublicKey,
    pub pre_key: Option<SignedPublicKey>,
}

impl PublicKeyBundle {
    /// Validate both signatures and return the wallet address that created
    /// this bundle.
    ///
    /// # Errors
    ///
    /// - [`CourierError::UnsignedPreKey`] if the pre-key is absent
    /// - [`CourierError::InvalidSignature`] if the pre-key signature does not
    ///   recover the identity key, or either signature is malformed
    pub fn validate(&self) -> Result<String> {
        let address = self.wallet_address()?;

        let pre_key = self.pre_key.as_ref().ok_or(CourierError::UnsignedPreKey)?;
        let digest = sha256(&pre_key.key_bytes);
        let recovered = pre_key.signature.recover_key(&digest)?;
        if recovered != self.identity_key.verifying_key()? {
            return Err(CourierError::InvalidSignature(
                "pre-key is not signed by the bundle's identity key".to_string(),
            ));
        }
        Ok(address)
    }

    /// Recover the wallet address from the identity key's creation signature.
    pub fn wallet_address(&self) -> Result<String> {
        let text = identity_creation_text(&self.identity_key.key_bytes);
        self.identity_key.signature.recover_address(&text)
    }

    /// The pre-key's verifying key, failing if the bundle carries none.
    pub fn pre_key(&self) -> Result<VerifyingKey> {
        self.pre_key
            .as_ref()
            .ok_or(CourierError::UnsignedPreKey)?
            .verifying_key()
    }
}

/// The human-readable text a wallet signs to endorse an identity key.
fn identity_creation_text(key_bytes: &[u8]) -> String {
    format!(
        "{}{}{}",
        IDENTITY_TEXT_PREFIX,
        hex::encode(key_bytes),
        TEXT_SUFFIX
    )
}

/// The text a wallet signs to derive the key-backup secret. Signing is
/// deterministic (RFC 6979), so the same wallet and salt always reproduce
/// the same secret.
fn storage_text(salt: &[u8]) -> String {
    format!("{}{}{}", STORAGE_TEXT_PREFIX, hex::encode(salt), TEXT_SUFFIX)
}

/// A private key bundle sealed for remote backup. The AEAD secret is the
/// wallet's deterministic signature over the salt, so only the wallet holder
/// can reopen it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPrivateKeyBundle {
    pub salt: Vec<u8>,
    pub ciphertext: crate::crypto::Ciphertext,
}

#[derive(Serialize, Deserialize)]
struct StoredPrivateKeyBundle {
    identity_secret: Vec<u8>,
    pre_key_secret: Vec<u8>,
    public_bundle: PublicKeyBundle,
}

/// Transport authentication token: the identity key plus a signed claim over
/// the wallet address and creation time. Opaque to this library; transports
/// attach it to requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub identity_key: SignedPublicKey,
    /// Postcard-serialized [`AuthData`]
    pub auth_data_bytes: Vec<u8>,
    pub auth_data_signature: RecoverableSignature,
}

/// The claim inside an [`AuthToken`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthData {
    pub wallet_address: String,
    pub created_ns: u64,
}

/// The secret half of an identity. Holds the identity and pre-key scalars and
/// the matching public bundle.
pub struct PrivateKeyBundle {
    identity_secret: SecretKey,
    pre_key_secret: SecretKey,
    public_bundle: PublicKeyBundle,
    wallet_address: String,
}

impl PrivateKeyBundle {
    /// Generate a fresh identity endorsed by `wallet`.
    pub fn generate(wallet: &dyn WalletSigner) -> Result<Self> {
        let identity_secret = sample_secret()?;
        let pre_key_secret = sample_secret()?;
        let created_ns = now_ns();

        let identity_signing = SigningKey::from(identity_secret.clone());
        let identity_unsigned =
            UnsignedPublicKey::new(identity_signing.verifying_key(), created_ns);
        let identity_bytes = identity_unsigned.bytes()?;
        let identity_signature = wallet.sign_personal(&identity_creation_text(&identity_bytes))?;
        let identity_key = SignedPublicKey {
            key_bytes: identity_bytes,
            signature: identity_signature,
        };

        let pre_key = sign_pre_key(&identity_signing, &pre_key_secret, created_ns)?;

        Ok(Self {
            identity_secret,
            pre_key_secret,
            public_bundle: PublicKeyBundle {
                identity_key,
                pre_key: Some(pre_key),
            },
            wallet_address: wallet.address(),
        })
    }

    pub fn public_bundle(&self) -> &PublicKeyBundle {
        &self.public_bundle
    }

    /// The wallet address this identity was created under.
    pub fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    /// Raw identity scalar bytes. Feeds the private preferences derivations.
    pub fn identity_secret_bytes(&self) -> [u8; 32] {
        self.identity_secret.to_bytes().into()
    }

    /// The identity public key.
    pub fn identity_public_key(&self) -> VerifyingKey {
        *SigningKey::from(self.identity_secret.clone()).verifying_key()
    }

    /// Triple Diffie-Hellman shared secret against a peer bundle.
    ///
    /// Both parties derive the same 195-byte secret: three uncompressed ECDH
    /// points concatenated, with the first two swapped depending on which
    /// side is the recipient.
    pub fn shared_secret(
        &self,
        peer: &PublicKeyBundle,
        is_recipient: bool,
    ) -> Result<Vec<u8>> {
        let peer_identity = peer.identity_key.verifying_key()?;
        let peer_pre = peer.pre_key()?;

        let (dh1, dh2) = if is_recipient {
            (
                ecdh(&self.pre_key_secret, &peer_identity)?,
                ecdh(&self.identity_secret, &peer_pre)?,
            )
        } else {
            (
                ecdh(&self.identity_secret, &peer_pre)?,
                ecdh(&self.pre_key_secret, &peer_identity)?,
            )
        };
        let dh3 = ecdh(&self.pre_key_secret, &peer_pre)?;

        let mut secret = Vec::with_capacity(dh1.len() + dh2.len() + dh3.len());
        secret.extend_from_slice(&dh1);
        secret.extend_from_slice(&dh2);
        secret.extend_from_slice(&dh3);
        Ok(secret)
    }

    /// Plain pre-key to pre-key ECDH. Seals and unseals invitations.
    pub fn pre_key_ecdh(&self, peer_pre_key: &VerifyingKey) -> Result<Vec<u8>> {
        ecdh(&self.pre_key_secret, peer_pre_key)
    }

    /// ECDH between the identity key and an arbitrary public key. Feeds the
    /// preferences layer's self-encryption.
    pub fn identity_ecdh(&self, peer: &VerifyingKey) -> Result<Vec<u8>> {
        ecdh(&self.identity_secret, peer)
    }

    /// Sign a 32-byte digest with the pre-key. Authenticates message content
    /// inside invitation-established conversations.
    pub fn sign_with_pre_key(&self, digest: &[u8; 32]) -> Result<RecoverableSignature> {
        let signing = SigningKey::from(self.pre_key_secret.clone());
        let (signature, recovery_id) = signing
            .sign_prehash_recoverable(digest)
            .map_err(|e| CourierError::Crypto(format!("signing failed: {}", e)))?;
        Ok(RecoverableSignature {
            bytes: signature.to_bytes().to_vec(),
            recovery_id: recovery_id.to_byte(),
        })
    }

    /// Seal the private bundle for remote backup under a wallet-derived
    /// secret.
    pub fn seal_for_storage(
        &self,
        wallet: &dyn WalletSigner,
    ) -> Result<EncryptedPrivateKeyBundle> {
        let salt = random_bytes::<32>()?;
        let signature = wallet.sign_personal(&storage_text(&salt))?;
        let plaintext = postcard::to_allocvec(&StoredPrivateKeyBundle {
            identity_secret: self.identity_secret.to_bytes().to_vec(),
            pre_key_secret: self.pre_key_secret.to_bytes().to_vec(),
            public_bundle: self.public_bundle.clone(),
        })?;
        let ciphertext = crate::crypto::encrypt(&signature.bytes, &plaintext, None)?;
        Ok(EncryptedPrivateKeyBundle {
            salt: salt.to_vec(),
            ciphertext,
        })
    }

    /// Reopen a backed-up private bundle with the owning wallet.
    ///
    /// # Errors
    ///
    /// [`CourierError::DecryptionFailed`] if `wallet` is not the wallet that
    /// sealed the backup.
    pub fn unseal_from_storage(
        sealed: &EncryptedPrivateKeyBundle,
        wallet: &dyn WalletSigner,
    ) -> Result<Self> {
        let signature = wallet.sign_personal(&storage_text(&sealed.salt))?;
        let plaintext = crate::crypto::decrypt(&signature.bytes, &sealed.ciphertext, None)?;
        let stored: StoredPrivateKeyBundle = postcard::from_bytes(&plaintext)?;
        let identity_secret = SecretKey::from_slice(&stored.identity_secret)
            .map_err(|e| CourierError::Crypto(format!("invalid stored identity key: {}", e)))?;
        let pre_key_secret = SecretKey::from_slice(&stored.pre_key_secret)
            .map_err(|e| CourierError::Crypto(format!("invalid stored pre-key: {}", e)))?;
        let wallet_address = stored.public_bundle.wallet_address()?;
        Ok(Self {
            identity_secret,
            pre_key_secret,
            public_bundle: stored.public_bundle,
            wallet_address,
        })
    }

    /// Build a base64 transport auth token signed by the identity key.
    pub fn auth_token(&self) -> Result<String> {
        use base64::Engine;

        let auth_data = AuthData {
            wallet_address: self.wallet_address.clone(),
            created_ns: now_ns(),
        };
        let auth_data_bytes = postcard::to_allocvec(&auth_data)?;
        let digest = sha256(&auth_data_bytes);

        let signing = SigningKey::from(self.identity_secret.clone());
        let (signature, recovery_id) = signing
            .sign_prehash_recoverable(&digest)
            .map_err(|e| CourierError::Crypto(format!("signing failed: {}", e)))?;

        let token = AuthToken {
            identity_key: self.public_bundle.identity_key.clone(),
            auth_data_bytes,
            auth_data_signature: RecoverableSignature {
                bytes: signature.to_bytes().to_vec(),
                recovery_id: recovery_id.to_byte(),
            },
        };
        Ok(base64::engine::general_purpose::STANDARD.encode(postcard::to_allocvec(&token)?))
    }
}

fn sign_pre_key(
    identity_signing: &SigningKey,
    pre_key_secret: &SecretKey,
    created_ns: u64,
) -> Result<SignedPublicKey> {
    let pre_signing = SigningKey::from(pre_key_secret.clone());
    let pre_unsigned = UnsignedPublicKey::new(pre_signing.verifying_key(), created_ns);
    let pre_bytes = pre_unsigned.bytes()?;
    let digest = sha256(&pre_bytes);
    let (signature, recovery_id) = identity_signing
        .sign_prehash_recoverable(&digest)
        .map_err(|e| CourierError::Crypto(format!("signing failed: {}", e)))?;
    Ok(SignedPublicKey {
        key_bytes: pre_bytes,
        signature: RecoverableSignature {
            bytes: signature.to_bytes().to_vec(),
            recovery_id: recovery_id.to_byte(),
        },
    })
}

pub(crate) fn sample_secret() -> Result<SecretKey> {
    for _ in 0..8 {
        let bytes = random_bytes::<32>()?;
        if let Ok(secret) = SecretKey::from_slice(&bytes) {
            return Ok(secret);
        }
    }
    Err(CourierError::Crypto(
        "could not sample a valid secp256k1 scalar".to_string(),
    ))
}

/// Scalar multiplication yielding the uncompressed shared point (65 bytes).
fn ecdh(secret: &SecretKey, peer: &VerifyingKey) -> Result<Vec<u8>> {
    let peer_point = PublicKey::from_sec1_bytes(peer.to_encoded_point(false).as_bytes())
        .map_err(|e| CourierError::Crypto(format!("invalid peer point: {}", e)))?;
    let shared = ProjectivePoint::from(*peer_point.as_affine()) * *secret.to_nonzero_scalar();
    Ok(shared.to_affine().to_encoded_point(false).as_bytes().to_vec())
}

// Used by the consent layer's self-encryption.
pub(crate) fn ecdh_raw(secret: &SecretKey, peer: &VerifyingKey) -> Result<Vec<u8>> {
    ecdh(secret, peer)
}
