//! Invitations: establishing private conversation topics
//!
//! An invitation carries a fresh topic and 32 bytes of key material. Sealed
//! invitations travel on both parties' invite topics, encrypted under a
//! pre-key ECDH secret so the network learns only who is talking to whom,
//! never on which topic. Deterministic derivation lets both sides compute
//! the same invitation from their bundles alone, which keeps repeated
//! `new_conversation` calls convergent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, random_bytes, Ciphertext};
use crate::error::{CourierError, Result};
use crate::identity::bundle::{PrivateKeyBundle, PublicKeyBundle};
use crate::topic;

/// Application-supplied conversation labeling. The `conversation_id`
/// participates in deterministic topic derivation, so distinct ids between
/// the same two parties yield distinct conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationContext {
    pub conversation_id: String,
    pub metadata: BTreeMap<String, String>,
}

/// The secret payload of an invitation: where to talk and with what key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationV1 {
    pub topic: String,
    pub context: Option<InvitationContext>,
    /// 32-byte AEAD secret for the conversation
    pub key_material: Vec<u8>,
}

impl InvitationV1 {
    /// Invitation with a random topic and key material. Used when the
    /// parties have no shared derivation state.
    pub fn create_random(context: Option<InvitationContext>) -> Result<Self> {
        let topic_id = hex::encode(random_bytes::<32>()?);
        Ok(Self {
            topic: topic::message_v2(&topic_id),
            context,
            key_material: random_bytes::<32>()?.to_vec(),
        })
    }

    /// Invitation derived from the two parties' bundles, so both sides
    /// compute an identical topic and key material without a round-trip.
    ///
    /// The triple-DH role is chosen by address ordering (the
    /// lexicographically greater lowercase address acts as recipient), and
    /// the conversation id plus the sorted address pair feed the HKDF info
    /// so distinct ids produce distinct conversations.
    pub fn create_deterministic(
        me: &PrivateKeyBundle,
        peer: &PublicKeyBundle,
        context: Option<InvitationContext>,
    ) -> Result<Self> {
        let my_address = me.wallet_address().to_lowercase();
        let peer_address = peer.wallet_address()?.to_lowercase();
        let is_recipient = my_address > peer_address;
        let secret = me.shared_secret(peer, is_recipient)?;

        let (low, high) = if my_address <= peer_address {
            (&my_address, &peer_address)
        } else {
            (&peer_address, &my_address)
        };
        let conversation_id = context
            .as_ref()
            .map(|c| c.conversation_id.as_str())
            .unwrap_or("");
        let info = format!("{}|{}|{}", conversation_id, low, high);

        let key_material = crypto::hkdf_expand(&secret, b"invite-key", info.as_bytes())?;
        let topic_bytes = crypto::hkdf_expand(&secret, b"invite-topic", info.as_bytes())?;

        Ok(Self {
            topic: topic::message_v2(&hex::encode(topic_bytes)),
            context,
            key_material: key_material.to_vec(),
        })
    }
}

/// Cleartext header of a sealed invitation. Names both parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedInvitationHeader {
    pub sender: PublicKeyBundle,
    pub recipient: PublicKeyBundle,
    pub created_ns: u64,
}

/// An [`InvitationV1`] sealed under the parties' pre-key ECDH secret, with
/// the header bytes bound as associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedInvitation {
    /// Postcard-serialized [`SealedInvitationHeader`]
    pub header_bytes: Vec<u8>,
    pub ciphertext: Ciphertext,
}

impl SealedInvitation {
    /// Seal `invitation` from `sender` to the holder of `recipient`.
    ///
    /// The recipient bundle is validated before any key agreement, so an
    /// unsigned or forged bundle is rejected up front.
    pub fn seal(
        sender: &PrivateKeyBundle,
        recipient: &PublicKeyBundle,
        invitation: &InvitationV1,
        created_ns: u64,
    ) -> Result<Self> {
        recipient.validate()?;
        let header_bytes = postcard::to_allocvec(&SealedInvitationHeader {
            sender: sender.public_bundle().clone(),
            recipient: recipient.clone(),
            created_ns,
        })?;
        let secret = sender.pre_key_ecdh(&recipient.pre_key()?)?;
        let plaintext = postcard::to_allocvec(invitation)?;
        let ciphertext = crypto::encrypt(&secret, &plaintext, Some(&header_bytes))?;
        Ok(Self {
            header_bytes,
            ciphertext,
        })
    }

    pub fn header(&self) -> Result<SealedInvitationHeader> {
        Ok(postcard::from_bytes(&self.header_bytes)?)
    }

    /// Open the sealed invitation as either party.
    ///
    /// Both bundles in the header are signature-validated before any
    /// decryption. The reader's role is inferred from its wallet address;
    /// an invitation naming neither address fails with
    /// [`CourierError::NotAddressed`].
    pub fn unseal(&self, me: &PrivateKeyBundle) -> Result<InvitationV1> {
        let header = self.header()?;
        let sender_address = header.sender.validate()?.to_lowercase();
        let recipient_address = header.recipient.validate()?.to_lowercase();
        let my_address = me.wallet_address().to_lowercase();

        let peer = if my_address == recipient_address {
            &header.sender
        } else if my_address == sender_address {
            &header.recipient
        } else {
            return Err(CourierError::NotAddressed);
        };

        let secret = me.pre_key_ecdh(&peer.pre_key()?)?;
        let plaintext = crypto::decrypt(&secret, &self.ciphertext, Some(&self.header_bytes))?;
        Ok(postcard::from_bytes(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::wallet::LocalWallet;

    fn identity() -> PrivateKeyBundle {
        let wallet = LocalWallet::generate().unwrap();
        PrivateKeyBundle::generate(&wallet).unwrap()
    }

    fn context(id: &str) -> InvitationContext {
        InvitationContext {
            conversation_id: id.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_seal_unseal_roundtrip() {
        let alice = identity();
        let bob = identity();
        let invitation = InvitationV1::create_random(None).unwrap();

        let sealed =
            SealedInvitation::seal(&alice, bob.public_bundle(), &invitation, 99).unwrap();

        // Both the recipient and the sender can reopen it
        assert_eq!(sealed.unseal(&bob).unwrap(), invitation);
        assert_eq!(sealed.unseal(&alice).unwrap(), invitation);
        assert_eq!(sealed.header().unwrap().created_ns, 99);
    }

    #[test]
    fn test_unseal_third_party_not_addressed() {
        let alice = identity();
        let bob = identity();
        let eve = identity();
        let invitation = InvitationV1::create_random(None).unwrap();
        let sealed =
            SealedInvitation::seal(&alice, bob.public_bundle(), &invitation, 1).unwrap();
        assert!(matches!(
            sealed.unseal(&eve),
            Err(CourierError::NotAddressed)
        ));
    }

    #[test]
    fn test_seal_rejects_unsigned_recipient() {
        let alice = identity();
        let bob = identity();
        let mut stripped = bob.public_bundle().clone();
        stripped.pre_key = None;
        let invitation = InvitationV1::create_random(None).unwrap();
        assert!(matches!(
            SealedInvitation::seal(&alice, &stripped, &invitation, 1),
            Err(CourierError::UnsignedPreKey)
        ));
    }

    #[test]
    fn test_unseal_rejects_forged_header_bundle() {
        let alice = identity();
        let bob = identity();
        let mallory = identity();
        let invitation = InvitationV1::create_random(None).unwrap();
        let sealed =
            SealedInvitation::seal(&alice, bob.public_bundle(), &invitation, 1).unwrap();

        // Replace the sender bundle's pre-key with Mallory's, breaking the
        // identity-key signature chain.
        let mut header = sealed.header().unwrap();
        header.sender.pre_key = mallory.public_bundle().pre_key.clone();
        let forged = SealedInvitation {
            header_bytes: postcard::to_allocvec(&header).unwrap(),
            ciphertext: sealed.ciphertext.clone(),
        };
        assert!(matches!(
            forged.unseal(&bob),
            Err(CourierError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let alice = identity();
        let bob = identity();
        let invitation = InvitationV1::create_random(None).unwrap();
        let mut sealed =
            SealedInvitation::seal(&alice, bob.public_bundle(), &invitation, 1).unwrap();
        let idx = sealed.ciphertext.payload.len() / 2;
        sealed.ciphertext.payload[idx] ^= 0xFF;
        assert!(matches!(
            sealed.unseal(&bob),
            Err(CourierError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_deterministic_matches_from_both_sides() {
        let alice = identity();
        let bob = identity();
        let ctx = Some(context("project-x"));

        let from_alice =
            InvitationV1::create_deterministic(&alice, bob.public_bundle(), ctx.clone()).unwrap();
        let from_bob =
            InvitationV1::create_deterministic(&bob, alice.public_bundle(), ctx).unwrap();

        assert_eq!(from_alice.topic, from_bob.topic);
        assert_eq!(from_alice.key_material, from_bob.key_material);
        assert!(from_alice.topic.starts_with("/xmtp/0/m-"));
    }

    #[test]
    fn test_deterministic_distinct_per_conversation_id() {
        let alice = identity();
        let bob = identity();

        let first = InvitationV1::create_deterministic(
            &alice,
            bob.public_bundle(),
            Some(context("one")),
        )
        .unwrap();
        let second = InvitationV1::create_deterministic(
            &alice,
            bob.public_bundle(),
            Some(context("two")),
        )
        .unwrap();
        assert_ne!(first.topic, second.topic);
        assert_ne!(first.key_material, second.key_material);
    }

    #[test]
    fn test_random_invitations_are_unique() {
        let a = InvitationV1::create_random(None).unwrap();
        let b = InvitationV1::create_random(None).unwrap();
        assert_ne!(a.topic, b.topic);
        assert_ne!(a.key_material, b.key_material);
    }
}
