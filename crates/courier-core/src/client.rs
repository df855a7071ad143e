//! The client handle: identity, transport access, and contact discovery
//!
//! `Client` is a cheap-clone `Arc` wrapper. The conversation directory lives
//! in `conversations.rs` and the consent API in `consent.rs`, both as
//! further `impl Client` blocks; this module owns construction, the contact
//! bundle lifecycle, and the network timeout policy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::consent::ConsentList;
use crate::conversation::Conversation;
use crate::error::{CourierError, Result};
use crate::identity::bundle::{EncryptedPrivateKeyBundle, PrivateKeyBundle, PublicKeyBundle};
use crate::identity::wallet::WalletSigner;
use crate::time::now_ns;
use crate::topic;
use crate::transport::{query_all, Envelope, SortDirection, Transport};

/// Default bound on any single network call.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct ClientInner {
    pub(crate) keys: PrivateKeyBundle,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) network_timeout: Duration,
    /// Conversation cache keyed by topic
    pub(crate) conversations: RwLock<HashMap<String, Conversation>>,
    /// Direct-message topics whose intro copies have already been published
    pub(crate) introduced: Mutex<HashSet<String>>,
    pub(crate) consent: Mutex<ConsentList>,
}

/// A connected protocol client bound to one wallet identity.
///
/// Clones share all state; hand copies to tasks freely.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client for `wallet`, generate its key bundle, and publish
    /// the contact bundle so peers can find it.
    pub async fn create(
        wallet: &dyn WalletSigner,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::create_with_timeout(wallet, transport, DEFAULT_NETWORK_TIMEOUT).await
    }

    pub async fn create_with_timeout(
        wallet: &dyn WalletSigner,
        transport: Arc<dyn Transport>,
        network_timeout: Duration,
    ) -> Result<Self> {
        let keys = PrivateKeyBundle::generate(wallet)?;
        let client = Self::from_keys(keys, transport, network_timeout);
        client.publish_contact_bundle().await?;
        info!(address = %client.address(), "client registered");
        Ok(client)
    }

    /// Create a client reusing the identity backed up on the wallet's
    /// private-store topic, or generate and back up a fresh one if none
    /// exists.
    ///
    /// Backups that fail to parse or unseal are skipped with a log line, so
    /// a corrupt entry never locks the wallet out.
    pub async fn load_or_create(
        wallet: &dyn WalletSigner,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let store_topic = topic::private_store(&wallet.address());
        let probe = Self::from_keys(
            PrivateKeyBundle::generate(wallet)?,
            Arc::clone(&transport),
            DEFAULT_NETWORK_TIMEOUT,
        );
        let envelopes = probe
            .timed(query_all(
                probe.transport(),
                &store_topic,
                None,
                SortDirection::Descending,
            ))
            .await?;

        for envelope in &envelopes {
            let restored = postcard::from_bytes::<EncryptedPrivateKeyBundle>(&envelope.payload)
                .map_err(CourierError::from)
                .and_then(|sealed| PrivateKeyBundle::unseal_from_storage(&sealed, wallet));
            match restored {
                Ok(keys) => {
                    info!(address = %keys.wallet_address(), "restored identity from backup");
                    return Ok(Self::from_keys(keys, transport, DEFAULT_NETWORK_TIMEOUT));
                }
                Err(e) => {
                    warn!(topic = %store_topic, error = %e, "skipping unreadable key backup");
                }
            }
        }

        // No usable backup; keep the freshly generated identity.
        let sealed = probe.keys().seal_for_storage(wallet)?;
        probe
            .publish(vec![Envelope {
                content_topic: store_topic,
                timestamp_ns: now_ns(),
                payload: postcard::to_allocvec(&sealed)?,
            }])
            .await?;
        probe.publish_contact_bundle().await?;
        info!(address = %probe.address(), "client registered with new backup");
        Ok(probe)
    }

    fn from_keys(
        keys: PrivateKeyBundle,
        transport: Arc<dyn Transport>,
        network_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                keys,
                transport,
                network_timeout,
                conversations: RwLock::new(HashMap::new()),
                introduced: Mutex::new(HashSet::new()),
                consent: Mutex::new(ConsentList::new()),
            }),
        }
    }

    /// This client's wallet address (EIP-55 checksummed).
    pub fn address(&self) -> &str {
        self.inner.keys.wallet_address()
    }

    /// This client's publishable key bundle.
    pub fn public_key_bundle(&self) -> &PublicKeyBundle {
        self.inner.keys.public_bundle()
    }

    /// Base64 transport authentication token for this identity.
    pub fn auth_token(&self) -> Result<String> {
        self.inner.keys.auth_token()
    }

    pub(crate) fn keys(&self) -> &PrivateKeyBundle {
        &self.inner.keys
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    /// Run `future` under the client's network timeout.
    pub(crate) async fn timed<T>(
        &self,
        future: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.inner.network_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(CourierError::Timeout(self.inner.network_timeout)),
        }
    }

    /// Publish envelopes under the network timeout.
    pub(crate) async fn publish(&self, envelopes: Vec<Envelope>) -> Result<()> {
        self.timed(self.transport().publish(envelopes)).await
    }

    async fn publish_contact_bundle(&self) -> Result<()> {
        let payload = postcard::to_allocvec(self.public_key_bundle())?;
        self.publish(vec![Envelope {
            content_topic: topic::contact(self.address()),
            timestamp_ns: now_ns(),
            payload,
        }])
        .await
    }

    /// Resolve a peer's validated contact bundle, or `None` if the address
    /// has never registered.
    ///
    /// Invalid or stale bundles on the contact topic are skipped with a log
    /// line; the newest valid one wins.
    pub async fn find_contact(&self, peer_address: &str) -> Result<Option<PublicKeyBundle>> {
        let contact_topic = topic::contact(peer_address);
        let envelopes = self
            .timed(query_all(
                self.transport(),
                &contact_topic,
                None,
                SortDirection::Descending,
            ))
            .await?;

        for envelope in &envelopes {
            let bundle: PublicKeyBundle = match postcard::from_bytes(&envelope.payload) {
                Ok(bundle) => bundle,
                Err(e) => {
                    debug!(topic = %contact_topic, error = %e, "skipping malformed contact bundle");
                    continue;
                }
            };
            match bundle.validate() {
                Ok(address) if address.eq_ignore_ascii_case(peer_address) => {
                    return Ok(Some(bundle));
                }
                Ok(address) => {
                    warn!(
                        topic = %contact_topic,
                        claimed = %peer_address,
                        actual = %address,
                        "contact bundle recovered a different address"
                    );
                }
                Err(e) => {
                    warn!(topic = %contact_topic, error = %e, "skipping invalid contact bundle");
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::wallet::LocalWallet;
    use crate::transport::memory::InMemoryTransport;

    async fn new_client(transport: &Arc<InMemoryTransport>) -> (LocalWallet, Client) {
        let wallet = LocalWallet::generate().unwrap();
        let client = Client::create(&wallet, Arc::clone(transport) as Arc<dyn Transport>)
            .await
            .unwrap();
        (wallet, client)
    }

    #[tokio::test]
    async fn test_create_publishes_contact_bundle() {
        let transport = Arc::new(InMemoryTransport::new());
        let (wallet, client) = new_client(&transport).await;

        assert_eq!(client.address(), wallet.address());
        assert_eq!(transport.stored_count(&topic::contact(client.address())), 1);
    }

    #[tokio::test]
    async fn test_find_contact_roundtrip() {
        let transport = Arc::new(InMemoryTransport::new());
        let (_, alice) = new_client(&transport).await;
        let (_, bob) = new_client(&transport).await;

        let found = alice.find_contact(bob.address()).await.unwrap().unwrap();
        assert_eq!(&found, bob.public_key_bundle());
    }

    #[tokio::test]
    async fn test_find_contact_unregistered_is_none() {
        let transport = Arc::new(InMemoryTransport::new());
        let (_, alice) = new_client(&transport).await;
        let missing = alice
            .find_contact("0x000000000000000000000000000000000000dEaD")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_load_or_create_restores_identity() {
        let transport = Arc::new(InMemoryTransport::new());
        let wallet = LocalWallet::generate().unwrap();

        let first = Client::load_or_create(&wallet, Arc::clone(&transport) as Arc<dyn Transport>)
            .await
            .unwrap();
        let second = Client::load_or_create(&wallet, Arc::clone(&transport) as Arc<dyn Transport>)
            .await
            .unwrap();

        assert_eq!(first.public_key_bundle(), second.public_key_bundle());
        // The second call restored the backup instead of writing a new one
        assert_eq!(
            transport.stored_count(&topic::private_store(&wallet.address())),
            1
        );
    }

    #[tokio::test]
    async fn test_find_contact_skips_garbage_envelopes() {
        let transport = Arc::new(InMemoryTransport::new());
        let (_, alice) = new_client(&transport).await;
        let (_, bob) = new_client(&transport).await;

        // Garbage published after the real bundle scans first (descending)
        transport
            .publish(vec![Envelope {
                content_topic: topic::contact(bob.address()),
                timestamp_ns: now_ns() + 1,
                payload: b"not a bundle".to_vec(),
            }])
            .await
            .unwrap();

        let found = alice.find_contact(bob.address()).await.unwrap().unwrap();
        assert_eq!(&found, bob.public_key_bundle());
    }
}
