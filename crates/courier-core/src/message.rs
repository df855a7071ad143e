//! Encrypted message formats
//!
//! Two wire formats coexist. [`MessageV1`] is the direct format: the header
//! carries both parties' public bundles in the clear and the body is sealed
//! under their triple-DH secret. [`MessageV2`] is the invitation-established
//! format: the header reveals only a topic and timestamp, the body is sealed
//! under the invitation's key material, and the sender proves authorship
//! with a pre-key signature inside the ciphertext.

use serde::{Deserialize, Serialize};

use crate::codec::EncodedContent;
use crate::crypto::{self, sha256, Ciphertext};
use crate::error::{CourierError, Result};
use crate::identity::bundle::{PrivateKeyBundle, PublicKeyBundle};
use crate::identity::wallet::RecoverableSignature;

/// Content-addressed message id: hex sha256 of the envelope payload.
pub fn message_id(envelope_payload: &[u8]) -> String {
    hex::encode(sha256(envelope_payload))
}

/// Cleartext header of a direct message. Visible to the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaderV1 {
    pub sender: PublicKeyBundle,
    pub recipient: PublicKeyBundle,
    pub timestamp_ns: u64,
}

/// A direct message: cleartext header plus body sealed under the parties'
/// triple-DH secret, with the header bytes as associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageV1 {
    /// Postcard-serialized [`MessageHeaderV1`], kept as the exact bytes
    /// bound into the AEAD
    pub header_bytes: Vec<u8>,
    pub ciphertext: Ciphertext,
}

impl MessageV1 {
    /// Seal `content` from `sender` to `recipient`.
    pub fn encode(
        sender: &PrivateKeyBundle,
        recipient: &PublicKeyBundle,
        content: &EncodedContent,
        timestamp_ns: u64,
    ) -> Result<Self> {
        let header = MessageHeaderV1 {
            sender: sender.public_bundle().clone(),
            recipient: recipient.clone(),
            timestamp_ns,
        };
        let header_bytes = postcard::to_allocvec(&header)?;
        let secret = sender.shared_secret(recipient, false)?;
        let plaintext = postcard::to_allocvec(content)?;
        let ciphertext = crypto::encrypt(&secret, &plaintext, Some(&header_bytes))?;
        Ok(Self {
            header_bytes,
            ciphertext,
        })
    }

    pub fn header(&self) -> Result<MessageHeaderV1> {
        Ok(postcard::from_bytes(&self.header_bytes)?)
    }

    /// Open the message as either party.
    ///
    /// The reader's role is inferred by matching its wallet address against
    /// the header. A message addressed to neither party fails with
    /// [`CourierError::NotAddressed`] before any decryption is attempted, so
    /// misaddressing is never reported as tampering.
    pub fn decrypt(&self, me: &PrivateKeyBundle) -> Result<EncodedContent> {
        let header = self.header()?;
        let sender_address = header.sender.wallet_address()?.to_lowercase();
        let recipient_address = header.recipient.wallet_address()?.to_lowercase();
        let my_address = me.wallet_address().to_lowercase();

        let (peer, is_recipient) = if my_address == recipient_address {
            (&header.sender, true)
        } else if my_address == sender_address {
            (&header.recipient, false)
        } else {
            return Err(CourierError::NotAddressed);
        };

        let secret = me.shared_secret(peer, is_recipient)?;
        let plaintext = crypto::decrypt(&secret, &self.ciphertext, Some(&self.header_bytes))?;
        Ok(postcard::from_bytes(&plaintext)?)
    }
}

/// Cleartext header of an invitation-established message. Reveals nothing
/// about the participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaderV2 {
    pub topic: String,
    pub created_ns: u64,
}

/// Authenticated plaintext of a [`MessageV2`]: the encoded content, the
/// sender's bundle, and a pre-key signature over the header and payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedContent {
    /// Postcard-serialized [`EncodedContent`]
    pub payload: Vec<u8>,
    pub sender: PublicKeyBundle,
    pub signature: RecoverableSignature,
}

impl SignedContent {
    pub fn content(&self) -> Result<EncodedContent> {
        Ok(postcard::from_bytes(&self.payload)?)
    }
}

/// An invitation-established message, sealed under the conversation's key
/// material with the header bytes as associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageV2 {
    /// Postcard-serialized [`MessageHeaderV2`]
    pub header_bytes: Vec<u8>,
    pub ciphertext: Ciphertext,
}

impl MessageV2 {
    /// Seal `content` into the conversation identified by `topic`.
    pub fn encode(
        sender: &PrivateKeyBundle,
        content: &EncodedContent,
        topic: &str,
        key_material: &[u8],
        created_ns: u64,
    ) -> Result<Self> {
        let header_bytes = postcard::to_allocvec(&MessageHeaderV2 {
            topic: topic.to_string(),
            created_ns,
        })?;
        let payload = postcard::to_allocvec(content)?;

        let mut signed_preimage =
            Vec::with_capacity(header_bytes.len() + payload.len());
        signed_preimage.extend_from_slice(&header_bytes);
        signed_preimage.extend_from_slice(&payload);
        let signature = sender.sign_with_pre_key(&sha256(&signed_preimage))?;

        let signed = SignedContent {
            payload,
            sender: sender.public_bundle().clone(),
            signature,
        };
        let plaintext = postcard::to_allocvec(&signed)?;
        let ciphertext = crypto::encrypt(key_material, &plaintext, Some(&header_bytes))?;
        Ok(Self {
            header_bytes,
            ciphertext,
        })
    }

    pub fn header(&self) -> Result<MessageHeaderV2> {
        Ok(postcard::from_bytes(&self.header_bytes)?)
    }

    /// Open the message and verify the sender's pre-key signature.
    ///
    /// # Errors
    ///
    /// [`CourierError::DecryptionFailed`] if the key material is wrong or the
    /// envelope was tampered with; [`CourierError::InvalidSignature`] if the
    /// body opened but its signature does not recover the sender's pre-key.
    pub fn decrypt(&self, key_material: &[u8]) -> Result<SignedContent> {
        let plaintext = crypto::decrypt(key_material, &self.ciphertext, Some(&self.header_bytes))?;
        let signed: SignedContent = postcard::from_bytes(&plaintext)?;

        let mut signed_preimage =
            Vec::with_capacity(self.header_bytes.len() + signed.payload.len());
        signed_preimage.extend_from_slice(&self.header_bytes);
        signed_preimage.extend_from_slice(&signed.payload);
        let recovered = signed.signature.recover_key(&sha256(&signed_preimage))?;
        if recovered != signed.sender.pre_key()? {
            return Err(CourierError::InvalidSignature(
                "content signature does not match the sender's pre-key".to_string(),
            ));
        }
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ContentCodec, TextCodec};
    use crate::identity::wallet::LocalWallet;

    fn identity() -> PrivateKeyBundle {
        let wallet = LocalWallet::generate().unwrap();
        PrivateKeyBundle::generate(&wallet).unwrap()
    }

    fn text(body: &str) -> EncodedContent {
        TextCodec.encode(body.to_string()).unwrap()
    }

    #[test]
    fn test_v1_roundtrip_both_directions() {
        let alice = identity();
        let bob = identity();
        let message =
            MessageV1::encode(&alice, bob.public_bundle(), &text("hello bob"), 42).unwrap();

        // Recipient opens it
        let from_bob = message.decrypt(&bob).unwrap();
        assert_eq!(TextCodec.decode(&from_bob).unwrap(), "hello bob");

        // Sender can reopen their own message
        let from_alice = message.decrypt(&alice).unwrap();
        assert_eq!(TextCodec.decode(&from_alice).unwrap(), "hello bob");
    }

    #[test]
    fn test_v1_third_party_not_addressed() {
        let alice = identity();
        let bob = identity();
        let eve = identity();
        let message = MessageV1::encode(&alice, bob.public_bundle(), &text("secret"), 1).unwrap();
        assert!(matches!(
            message.decrypt(&eve),
            Err(CourierError::NotAddressed)
        ));
    }

    #[test]
    fn test_v1_tampered_header_fails_decryption() {
        let alice = identity();
        let bob = identity();
        let mut message =
            MessageV1::encode(&alice, bob.public_bundle(), &text("hello"), 1).unwrap();
        // Flip a bit inside the serialized timestamp, leaving the bundles
        // parseable so role inference still succeeds.
        let idx = message.header_bytes.len() - 1;
        message.header_bytes[idx] ^= 0x01;
        assert!(message.decrypt(&bob).is_err());
    }

    #[test]
    fn test_v2_roundtrip_and_sender_identity() {
        let alice = identity();
        let key_material = [0x5au8; 32];
        let message =
            MessageV2::encode(&alice, &text("gm"), "/xmtp/0/m-x/proto", &key_material, 7).unwrap();

        let signed = message.decrypt(&key_material).unwrap();
        assert_eq!(TextCodec.decode(&signed.content().unwrap()).unwrap(), "gm");
        assert_eq!(
            signed.sender.wallet_address().unwrap(),
            alice.wallet_address()
        );
        assert_eq!(message.header().unwrap().created_ns, 7);
    }

    #[test]
    fn test_v2_wrong_key_material_fails() {
        let alice = identity();
        let message =
            MessageV2::encode(&alice, &text("gm"), "t", &[0x5au8; 32], 7).unwrap();
        assert!(matches!(
            message.decrypt(&[0xa5u8; 32]),
            Err(CourierError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_v2_foreign_signature_rejected() {
        let alice = identity();
        let mallory = identity();
        let key_material = [0x5au8; 32];

        // Re-sign Alice's content with Mallory's pre-key but keep Alice's
        // bundle as the claimed sender.
        let content = text("gm");
        let header_bytes = postcard::to_allocvec(&MessageHeaderV2 {
            topic: "t".to_string(),
            created_ns: 7,
        })
        .unwrap();
        let payload = postcard::to_allocvec(&content).unwrap();
        let mut preimage = header_bytes.clone();
        preimage.extend_from_slice(&payload);
        let signature = mallory.sign_with_pre_key(&sha256(&preimage)).unwrap();
        let forged = SignedContent {
            payload,
            sender: alice.public_bundle().clone(),
            signature,
        };
        let plaintext = postcard::to_allocvec(&forged).unwrap();
        let ciphertext =
            crypto::encrypt(&key_material, &plaintext, Some(&header_bytes)).unwrap();
        let message = MessageV2 {
            header_bytes,
            ciphertext,
        };

        assert!(matches!(
            message.decrypt(&key_material),
            Err(CourierError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_message_id_is_stable_hex() {
        let id = message_id(b"payload bytes");
        assert_eq!(id.len(), 64);
        assert_eq!(id, message_id(b"payload bytes"));
        assert_ne!(id, message_id(b"other bytes"));
    }
}
