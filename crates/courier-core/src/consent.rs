//! Private preferences: the consent list
//!
//! Consent entries replicate through the network as self-encrypted actions
//! on a preferences topic whose identifier is derived from the identity key,
//! so neither the topic nor its contents link back to the wallet address.
//! Replaying the action history in arrival order rebuilds the list on any
//! device holding the same identity; the last writer wins per address.

use std::collections::HashMap;

use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::Client;
use crate::crypto::{self, Ciphertext};
use crate::error::{CourierError, Result};
use crate::identity::bundle::{ecdh_raw, sample_secret, PrivateKeyBundle};
use crate::time::now_ns;
use crate::topic;
use crate::transport::{query_all, Envelope, SortDirection};

/// Consent standing for one peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsentState {
    Allowed,
    Denied,
    Unknown,
}

/// One replicated preference update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivatePreferencesAction {
    Allow { addresses: Vec<String> },
    Deny { addresses: Vec<String> },
}

/// A consent entry as returned to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentListEntry {
    /// Lowercased peer address
    pub address: String,
    pub state: ConsentState,
}

/// The in-memory consent list plus its replication watermark.
pub struct ConsentList {
    entries: HashMap<String, ConsentState>,
    last_fetched_ns: Option<u64>,
}

impl ConsentList {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            last_fetched_ns: None,
        }
    }

    pub fn get(&self, address: &str) -> ConsentState {
        self.entries
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(ConsentState::Unknown)
    }

    /// Apply one action; later applications overwrite earlier ones.
    pub fn apply(&mut self, action: &PrivatePreferencesAction) {
        let (addresses, state) = match action {
            PrivatePreferencesAction::Allow { addresses } => (addresses, ConsentState::Allowed),
            PrivatePreferencesAction::Deny { addresses } => (addresses, ConsentState::Denied),
        };
        for address in addresses {
            self.entries.insert(address.to_lowercase(), state);
        }
    }

    pub fn entries(&self) -> Vec<ConsentListEntry> {
        self.entries
            .iter()
            .map(|(address, state)| ConsentListEntry {
                address: address.clone(),
                state: *state,
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.last_fetched_ns = None;
    }
}

impl Default for ConsentList {
    fn default() -> Self {
        Self::new()
    }
}

/// A payload sealed to our own identity key: an ephemeral public key plus
/// the ciphertext under the ephemeral-to-identity ECDH secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SelfSealed {
    /// SEC1 uncompressed ephemeral public key (65 bytes)
    ephemeral_public: Vec<u8>,
    ciphertext: Ciphertext,
}

fn seal_to_self(keys: &PrivateKeyBundle, plaintext: &[u8]) -> Result<SelfSealed> {
    let ephemeral = sample_secret()?;
    let ephemeral_public = ephemeral
        .public_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec();
    let shared = ecdh_raw(&ephemeral, &keys.identity_public_key())?;
    let ciphertext = crypto::encrypt(&shared, plaintext, None)?;
    Ok(SelfSealed {
        ephemeral_public,
        ciphertext,
    })
}

fn open_from_self(keys: &PrivateKeyBundle, sealed: &SelfSealed) -> Result<Vec<u8>> {
    let ephemeral = VerifyingKey::from_sec1_bytes(&sealed.ephemeral_public)
        .map_err(|e| CourierError::Crypto(format!("invalid ephemeral key: {}", e)))?;
    let shared = keys.identity_ecdh(&ephemeral)?;
    crypto::decrypt(&shared, &sealed.ciphertext, None)
}

impl Client {
    /// Unlinkable identifier for this identity's preferences topic.
    fn preferences_identifier(&self) -> Result<String> {
        let okm = crypto::hkdf_expand(
            &self.keys().identity_secret_bytes(),
            &[],
            b"preferences-identifier",
        )?;
        Ok(hex::encode(okm))
    }

    fn preferences_topic(&self) -> Result<String> {
        Ok(topic::user_preferences(&self.preferences_identifier()?))
    }

    /// Pull and replay preference actions published since the last refresh.
    pub async fn refresh_consent_list(&self) -> Result<()> {
        let preferences_topic = self.preferences_topic()?;
        let start_ns = self.inner.consent.lock().last_fetched_ns;
        let envelopes = self
            .timed(query_all(
                self.transport(),
                &preferences_topic,
                start_ns.map(|ns| ns + 1),
                SortDirection::Ascending,
            ))
            .await?;

        let mut consent = self.inner.consent.lock();
        for envelope in &envelopes {
            let action = postcard::from_bytes::<SelfSealed>(&envelope.payload)
                .map_err(CourierError::from)
                .and_then(|sealed| open_from_self(self.keys(), &sealed))
                .and_then(|plaintext| {
                    postcard::from_bytes::<PrivatePreferencesAction>(&plaintext)
                        .map_err(CourierError::from)
                });
            match action {
                Ok(action) => consent.apply(&action),
                Err(e) => {
                    debug!(error = %e, "skipping undecodable preference envelope");
                }
            }
            consent.last_fetched_ns = Some(
                consent
                    .last_fetched_ns
                    .unwrap_or(0)
                    .max(envelope.timestamp_ns),
            );
        }
        Ok(())
    }

    /// Record and replicate an `Allow` for each address.
    pub async fn allow(&self, addresses: Vec<String>) -> Result<()> {
        self.publish_preference(PrivatePreferencesAction::Allow { addresses })
            .await
    }

    /// Record and replicate a `Deny` for each address.
    pub async fn deny(&self, addresses: Vec<String>) -> Result<()> {
        self.publish_preference(PrivatePreferencesAction::Deny { addresses })
            .await
    }

    /// Local consent standing for `address`. Call
    /// [`Client::refresh_consent_list`] first to pick up remote updates.
    pub fn consent_state(&self, address: &str) -> ConsentState {
        self.inner.consent.lock().get(address)
    }

    pub fn is_allowed(&self, address: &str) -> bool {
        self.consent_state(address) == ConsentState::Allowed
    }

    pub fn is_denied(&self, address: &str) -> bool {
        self.consent_state(address) == ConsentState::Denied
    }

    /// Snapshot of all consent entries.
    pub fn consent_entries(&self) -> Vec<ConsentListEntry> {
        self.inner.consent.lock().entries()
    }

    /// Sending to a peer implies consent; record an `Allow` the first time.
    pub(crate) async fn allow_on_send(&self, peer_address: &str) -> Result<()> {
        if self.consent_state(peer_address) == ConsentState::Unknown {
            self.allow(vec![peer_address.to_string()]).await?;
        }
        Ok(())
    }

    async fn publish_preference(&self, action: PrivatePreferencesAction) -> Result<()> {
        // Optimistic local update; the published copy is for other devices.
        self.inner.consent.lock().apply(&action);

        let plaintext = postcard::to_allocvec(&action)?;
        let sealed = seal_to_self(self.keys(), &plaintext)?;
        self.publish(vec![Envelope {
            content_topic: self.preferences_topic()?,
            timestamp_ns: now_ns(),
            payload: postcard::to_allocvec(&sealed)?,
        }])
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::identity::wallet::LocalWallet;
    use crate::transport::memory::InMemoryTransport;
    use crate::transport::Transport;

    async fn new_client(transport: &Arc<InMemoryTransport>) -> Client {
        let wallet = LocalWallet::generate().unwrap();
        Client::create(&wallet, Arc::clone(transport) as Arc<dyn Transport>)
            .await
            .unwrap()
    }

    fn identity() -> PrivateKeyBundle {
        let wallet = LocalWallet::generate().unwrap();
        PrivateKeyBundle::generate(&wallet).unwrap()
    }

    #[test]
    fn test_self_seal_roundtrip() {
        let keys = identity();
        let sealed = seal_to_self(&keys, b"preference bytes").unwrap();
        assert_eq!(open_from_self(&keys, &sealed).unwrap(), b"preference bytes");
    }

    #[test]
    fn test_self_seal_unreadable_by_other_identity() {
        let keys = identity();
        let other = identity();
        let sealed = seal_to_self(&keys, b"preference bytes").unwrap();
        assert!(open_from_self(&other, &sealed).is_err());
    }

    #[test]
    fn test_last_writer_wins() {
        let mut list = ConsentList::new();
        list.apply(&PrivatePreferencesAction::Allow {
            addresses: vec!["0xAbC".to_string()],
        });
        list.apply(&PrivatePreferencesAction::Deny {
            addresses: vec!["0xabc".to_string()],
        });
        assert_eq!(list.get("0xABC"), ConsentState::Denied);
    }

    #[tokio::test]
    async fn test_default_state_is_unknown() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        assert_eq!(alice.consent_state("0xdead"), ConsentState::Unknown);
    }

    #[tokio::test]
    async fn test_allow_then_deny_replays_to_denied() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;

        alice.allow(vec!["0xPeer".to_string()]).await.unwrap();
        alice.deny(vec!["0xPeer".to_string()]).await.unwrap();
        assert!(alice.is_denied("0xpeer"));

        // Drop local state and rebuild purely from the published history
        alice.inner.consent.lock().reset();
        assert_eq!(alice.consent_state("0xpeer"), ConsentState::Unknown);
        alice.refresh_consent_list().await.unwrap();
        assert!(alice.is_denied("0xPEER"));
    }

    #[tokio::test]
    async fn test_refresh_is_incremental() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;

        alice.allow(vec!["0xone".to_string()]).await.unwrap();
        alice.refresh_consent_list().await.unwrap();
        let watermark = alice.inner.consent.lock().last_fetched_ns;
        assert!(watermark.is_some());

        alice.refresh_consent_list().await.unwrap();
        assert_eq!(alice.inner.consent.lock().last_fetched_ns, watermark);
    }

    #[tokio::test]
    async fn test_preferences_topic_hides_address() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let preferences_topic = alice.preferences_topic().unwrap();
        assert!(!preferences_topic
            .to_lowercase()
            .contains(&alice.address().to_lowercase()));
        assert!(preferences_topic.starts_with("/xmtp/0/userpreferences-"));
    }
}
