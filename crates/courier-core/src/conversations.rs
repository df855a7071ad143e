//! The conversation directory: listing, creating, and streaming
//!
//! All directory state is the topic-keyed cache inside the client. `list`
//! scans the intro and invite topics, each from the newest conversation it
//! has already produced, so repeated calls are incremental; `new_conversation` is
//! idempotent because deterministic invitations make both sides (and
//! repeated calls) converge on the same topic.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::Client;
use crate::conversation::{
    Conversation, ConversationV1, ConversationV2, DecodedMessage, MessageStream,
};
use crate::error::{CourierError, Result};
use crate::invitation::{InvitationContext, InvitationV1, SealedInvitation};
use crate::message::MessageV1;
use crate::time::now_ns;
use crate::topic;
use crate::transport::{
    check_batch_size, query_all, Envelope, Pagination, QueryRequest, SortDirection,
    MAX_PAGE_SIZE, MAX_QUERY_REQUESTS_PER_BATCH,
};

impl Client {
    /// All known conversations, newest first.
    ///
    /// Scans this client's intro and invite topics and merges the results
    /// into the cache. Each topic resumes from the newest conversation that
    /// topic produced, so a fresh invite never hides an older unseen intro
    /// (or the other way round). Envelopes that fail to parse, unseal, or
    /// validate are logged and skipped.
    pub async fn list(&self) -> Result<Vec<Conversation>> {
        let (intro_start_ns, invite_start_ns) = {
            let cache = self.inner.conversations.read();
            let mut intro_start_ns = None;
            let mut invite_start_ns = None;
            for conversation in cache.values() {
                let watermark = match conversation {
                    Conversation::V1(_) => &mut intro_start_ns,
                    Conversation::V2(_) => &mut invite_start_ns,
                };
                *watermark = (*watermark).max(Some(conversation.created_at_ns()));
            }
            (intro_start_ns, invite_start_ns)
        };

        let intro_envelopes = self
            .timed(query_all(
                self.transport(),
                &topic::intro(self.address()),
                intro_start_ns,
                SortDirection::Ascending,
            ))
            .await?;
        for envelope in &intro_envelopes {
            match self.conversation_from_intro(envelope) {
                Ok(conversation) => self.cache_if_absent(conversation),
                Err(e) => {
                    debug!(error = %e, "skipping undecodable intro envelope");
                }
            }
        }

        let invite_envelopes = self
            .timed(query_all(
                self.transport(),
                &topic::invite(self.address()),
                invite_start_ns,
                SortDirection::Ascending,
            ))
            .await?;
        for envelope in &invite_envelopes {
            match self.conversation_from_invite(envelope) {
                Ok(conversation) => self.cache_if_absent(conversation),
                Err(e) => {
                    debug!(error = %e, "skipping undecodable invite envelope");
                }
            }
        }

        let mut conversations: Vec<Conversation> =
            self.inner.conversations.read().values().cloned().collect();
        conversations.sort_by_key(|c| std::cmp::Reverse(c.created_at_ns()));
        Ok(conversations)
    }

    /// Open (or return the existing) conversation with `peer_address`.
    ///
    /// Publishes a sealed deterministic invitation to both parties' invite
    /// topics and records an `Allow` consent entry for the peer.
    ///
    /// # Errors
    ///
    /// [`CourierError::RecipientIsSender`] for our own address and
    /// [`CourierError::RecipientNotOnNetwork`] if the peer has never
    /// published a contact bundle.
    pub async fn new_conversation(
        &self,
        peer_address: &str,
        context: Option<InvitationContext>,
    ) -> Result<Conversation> {
        if peer_address.eq_ignore_ascii_case(self.address()) {
            return Err(CourierError::RecipientIsSender);
        }
        if let Some(existing) = self.find_matching(peer_address, context.as_ref()) {
            return Ok(existing);
        }

        let peer_bundle = self
            .find_contact(peer_address)
            .await?
            .ok_or_else(|| CourierError::RecipientNotOnNetwork(peer_address.to_string()))?;
        let peer_address = peer_bundle.wallet_address()?;

        // The peer may have created the same conversation already; refresh
        // before minting a new invitation.
        self.list().await?;
        if let Some(existing) = self.find_matching(&peer_address, context.as_ref()) {
            return Ok(existing);
        }

        let invitation =
            InvitationV1::create_deterministic(self.keys(), &peer_bundle, context.clone())?;
        let created_ns = now_ns();
        let sealed = SealedInvitation::seal(self.keys(), &peer_bundle, &invitation, created_ns)?;
        let payload = postcard::to_allocvec(&sealed)?;

        self.publish(
            [self.address(), peer_address.as_str()]
                .iter()
                .map(|address| Envelope {
                    content_topic: topic::invite(address),
                    timestamp_ns: created_ns,
                    payload: payload.clone(),
                })
                .collect(),
        )
        .await?;

        let conversation = Conversation::V2(ConversationV2 {
            topic: invitation.topic,
            peer_address: peer_address.clone(),
            created_at_ns: created_ns,
            context,
            key_material: invitation.key_material,
        });
        self.allow(vec![peer_address]).await?;
        self.cache_if_absent(conversation.clone());
        Ok(conversation)
    }

    /// Live feed of conversations as peers start them. Conversations already
    /// cached are not replayed.
    pub async fn stream_conversations(&self) -> Result<ConversationStream> {
        let topics = vec![topic::intro(self.address()), topic::invite(self.address())];
        let mut envelopes = self.timed(self.transport().subscribe(topics)).await?;
        let (sender, receiver) = mpsc::channel(64);
        let client = self.clone();

        let producer = tokio::spawn(async move {
            let invite_topic = topic::invite(client.address());
            while let Some(envelope) = envelopes.next().await {
                let parsed = if envelope.content_topic == invite_topic {
                    client.conversation_from_invite(&envelope)
                } else {
                    client.conversation_from_intro(&envelope)
                };
                match parsed {
                    Ok(conversation) => {
                        if client.cache_if_new(conversation.clone())
                            && sender.send(conversation).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "skipping undecodable conversation envelope");
                    }
                }
            }
        });
        Ok(ConversationStream { receiver, producer })
    }

    /// Live feed of messages across every conversation, present and future.
    ///
    /// The producer subscribes to all known conversation topics plus the
    /// intro and invite topics. When an envelope announces a conversation
    /// not yet subscribed, the producer tears the subscription down and
    /// resubscribes with the enlarged topic set; message ids dedup the
    /// overlap between the old and new subscriptions.
    pub async fn stream_all_messages(&self) -> Result<MessageStream> {
        let (sender, receiver) = mpsc::channel(64);
        let client = self.clone();

        let producer = tokio::spawn(async move {
            let intro_topic = topic::intro(client.address());
            let invite_topic = topic::invite(client.address());
            let mut seen_ids: HashSet<String> = HashSet::new();

            'resubscribe: loop {
                let mut topics = vec![intro_topic.clone(), invite_topic.clone()];
                topics.extend(
                    client
                        .inner
                        .conversations
                        .read()
                        .keys()
                        .cloned()
                        .collect::<Vec<_>>(),
                );
                let mut envelopes = match client.transport().subscribe(topics).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "message stream subscription failed");
                        return;
                    }
                };

                while let Some(envelope) = envelopes.next().await {
                    if envelope.content_topic == invite_topic {
                        match client.conversation_from_invite(&envelope) {
                            Ok(conversation) => {
                                if client.cache_if_new(conversation) {
                                    continue 'resubscribe;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "skipping undecodable invite envelope")
                            }
                        }
                        continue;
                    }

                    if envelope.content_topic == intro_topic {
                        // The intro copy carries the message itself; decode
                        // and emit it, then resubscribe if the conversation
                        // is new.
                        match client.conversation_from_intro(&envelope) {
                            Ok(conversation) => {
                                let is_new = client.cache_if_new(conversation.clone());
                                if let Ok(message) = conversation.decode(&client, &envelope) {
                                    if seen_ids.insert(message.id.clone())
                                        && sender.send(message).await.is_err()
                                    {
                                        return;
                                    }
                                }
                                if is_new {
                                    continue 'resubscribe;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "skipping undecodable intro envelope")
                            }
                        }
                        continue;
                    }

                    let conversation = client
                        .inner
                        .conversations
                        .read()
                        .get(&envelope.content_topic)
                        .cloned();
                    let Some(conversation) = conversation else {
                        debug!(topic = %envelope.content_topic, "envelope on unknown topic");
                        continue;
                    };
                    match conversation.decode(&client, &envelope) {
                        Ok(message) => {
                            if seen_ids.insert(message.id.clone())
                                && sender.send(message).await.is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(
                                topic = %envelope.content_topic,
                                error = %e,
                                "skipping undecodable envelope"
                            );
                        }
                    }
                }
                // Subscription closed by the transport
                return;
            }
        });
        Ok(MessageStream { receiver, producer })
    }

    /// Fetch the newest page of messages for many topics at once, newest
    /// first across all topics.
    ///
    /// Topics are chunked into batches of [`MAX_QUERY_REQUESTS_PER_BATCH`].
    /// Envelopes on topics with no cached conversation are discarded with a
    /// log line.
    pub async fn list_batch_messages(&self, topics: &[String]) -> Result<Vec<DecodedMessage>> {
        let mut messages = Vec::new();
        for chunk in topics.chunks(MAX_QUERY_REQUESTS_PER_BATCH) {
            let requests: Vec<QueryRequest> = chunk
                .iter()
                .map(|content_topic| QueryRequest {
                    content_topic: content_topic.clone(),
                    start_time_ns: None,
                    end_time_ns: None,
                    pagination: Some(Pagination {
                        limit: Some(MAX_PAGE_SIZE),
                        direction: SortDirection::Descending,
                        cursor: None,
                    }),
                })
                .collect();
            check_batch_size(&requests)?;
            let responses = self.timed(self.transport().batch_query(requests)).await?;

            for response in responses {
                for envelope in &response.envelopes {
                    let conversation = self
                        .inner
                        .conversations
                        .read()
                        .get(&envelope.content_topic)
                        .cloned();
                    let Some(conversation) = conversation else {
                        debug!(
                            topic = %envelope.content_topic,
                            "discarding envelope on unknown topic"
                        );
                        continue;
                    };
                    match conversation.decode(self, envelope) {
                        Ok(message) => messages.push(message),
                        Err(e) => {
                            debug!(
                                topic = %envelope.content_topic,
                                error = %e,
                                "skipping undecodable envelope"
                            );
                        }
                    }
                }
            }
        }
        messages.sort_by_key(|m| std::cmp::Reverse(m.sent_at_ns));
        Ok(messages)
    }

    /// Reconstruct the direct conversation an intro envelope announces.
    ///
    /// The message must actually open under our keys and both header bundles
    /// must validate; an intro anyone could have forged announces nothing.
    fn conversation_from_intro(&self, envelope: &Envelope) -> Result<Conversation> {
        let message: MessageV1 = postcard::from_bytes(&envelope.payload)?;
        message.decrypt(self.keys())?;
        let header = message.header()?;
        let sender_address = header.sender.validate()?;
        let recipient_address = header.recipient.validate()?;

        let peer_address = if sender_address.eq_ignore_ascii_case(self.address()) {
            recipient_address
        } else if recipient_address.eq_ignore_ascii_case(self.address()) {
            sender_address
        } else {
            return Err(CourierError::NotAddressed);
        };

        let conversation = ConversationV1::new(
            self.address(),
            peer_address,
            envelope.timestamp_ns,
        );
        // An intro on either side means the introduction already happened.
        self.inner.introduced.lock().insert(conversation.topic.clone());
        Ok(Conversation::V1(conversation))
    }

    /// Unseal an invite envelope into its conversation.
    fn conversation_from_invite(&self, envelope: &Envelope) -> Result<Conversation> {
        let sealed: SealedInvitation = postcard::from_bytes(&envelope.payload)?;
        let header = sealed.header()?;
        let invitation = sealed.unseal(self.keys())?;

        let sender_address = header.sender.wallet_address()?;
        let recipient_address = header.recipient.wallet_address()?;
        let peer_address = if sender_address.eq_ignore_ascii_case(self.address()) {
            recipient_address
        } else {
            sender_address
        };

        Ok(Conversation::V2(ConversationV2 {
            topic: invitation.topic,
            peer_address,
            created_at_ns: header.created_ns,
            context: invitation.context,
            key_material: invitation.key_material,
        }))
    }

    /// Cached conversation matching a peer and conversation id, if any.
    fn find_matching(
        &self,
        peer_address: &str,
        context: Option<&InvitationContext>,
    ) -> Option<Conversation> {
        let wanted_id = context.map(|c| c.conversation_id.as_str()).unwrap_or("");
        self.inner
            .conversations
            .read()
            .values()
            .find(|conversation| {
                matches!(conversation, Conversation::V2(_))
                    && conversation.peer_address().eq_ignore_ascii_case(peer_address)
                    && conversation.conversation_id().unwrap_or("") == wanted_id
            })
            .cloned()
    }

    /// Insert keeping the earliest-seen conversation per topic.
    fn cache_if_absent(&self, conversation: Conversation) {
        self.inner
            .conversations
            .write()
            .entry(conversation.topic().to_string())
            .or_insert(conversation);
    }

    /// Insert and report whether the topic was new.
    fn cache_if_new(&self, conversation: Conversation) -> bool {
        let mut cache = self.inner.conversations.write();
        if cache.contains_key(conversation.topic()) {
            return false;
        }
        cache.insert(conversation.topic().to_string(), conversation);
        true
    }
}

/// Live conversation feed. Dropping it stops the producer task.
pub struct ConversationStream {
    receiver: mpsc::Receiver<Conversation>,
    producer: JoinHandle<()>,
}

impl ConversationStream {
    pub async fn next(&mut self) -> Option<Conversation> {
        self.receiver.recv().await
    }
}

impl futures::Stream for ConversationStream {
    type Item = Conversation;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Conversation>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for ConversationStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::{ContentCodec, TextCodec};
    use crate::crypto;
    use crate::identity::bundle::PrivateKeyBundle;
    use crate::identity::wallet::LocalWallet;
    use crate::message::MessageHeaderV1;
    use crate::transport::memory::InMemoryTransport;
    use crate::transport::Transport;

    async fn new_client(transport: &Arc<InMemoryTransport>) -> Client {
        let wallet = LocalWallet::generate().unwrap();
        Client::create(&wallet, Arc::clone(transport) as Arc<dyn Transport>)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_conversation_rejects_self() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let result = alice
            .new_conversation(&alice.address().to_uppercase(), None)
            .await;
        assert!(matches!(result, Err(CourierError::RecipientIsSender)));
    }

    #[tokio::test]
    async fn test_new_conversation_requires_registered_peer() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let result = alice
            .new_conversation("0x000000000000000000000000000000000000dEaD", None)
            .await;
        assert!(matches!(
            result,
            Err(CourierError::RecipientNotOnNetwork(_))
        ));
    }

    #[tokio::test]
    async fn test_new_conversation_publishes_two_invites() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let bob = new_client(&transport).await;

        alice.new_conversation(bob.address(), None).await.unwrap();

        assert_eq!(transport.stored_count(&topic::invite(alice.address())), 1);
        assert_eq!(transport.stored_count(&topic::invite(bob.address())), 1);
    }

    #[tokio::test]
    async fn test_new_conversation_is_idempotent() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let bob = new_client(&transport).await;

        let first = alice.new_conversation(bob.address(), None).await.unwrap();
        let second = alice.new_conversation(bob.address(), None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.stored_count(&topic::invite(bob.address())), 1);
    }

    #[tokio::test]
    async fn test_both_sides_converge_on_one_topic() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let bob = new_client(&transport).await;

        let from_alice = alice.new_conversation(bob.address(), None).await.unwrap();
        // Bob refreshes before creating, finds Alice's invitation, reuses it
        let from_bob = bob.new_conversation(alice.address(), None).await.unwrap();
        assert_eq!(from_alice.topic(), from_bob.topic());
    }

    #[tokio::test]
    async fn test_distinct_conversation_ids_distinct_topics() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let bob = new_client(&transport).await;

        let ctx = |id: &str| {
            Some(InvitationContext {
                conversation_id: id.to_string(),
                metadata: Default::default(),
            })
        };
        let one = alice
            .new_conversation(bob.address(), ctx("one"))
            .await
            .unwrap();
        let two = alice
            .new_conversation(bob.address(), ctx("two"))
            .await
            .unwrap();
        assert_ne!(one.topic(), two.topic());

        let listed = alice.list().await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn test_list_sees_peer_initiated_conversation() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let bob = new_client(&transport).await;

        let created = alice.new_conversation(bob.address(), None).await.unwrap();

        let listed = bob.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].topic(), created.topic());
        assert_eq!(listed[0].peer_address(), alice.address());
    }

    #[tokio::test]
    async fn test_list_skips_garbage_invites() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let bob = new_client(&transport).await;

        transport
            .publish(vec![Envelope {
                content_topic: topic::invite(bob.address()),
                timestamp_ns: now_ns(),
                payload: b"junk".to_vec(),
            }])
            .await
            .unwrap();
        alice.new_conversation(bob.address(), None).await.unwrap();

        let listed = bob.list().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_list_drops_undecryptable_intro() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let bob = new_client(&transport).await;

        // A well-formed header naming Alice and Bob wrapped around a body
        // sealed under a key neither party holds
        let header = MessageHeaderV1 {
            sender: alice.public_key_bundle().clone(),
            recipient: bob.public_key_bundle().clone(),
            timestamp_ns: now_ns(),
        };
        let header_bytes = postcard::to_allocvec(&header).unwrap();
        let ciphertext = crypto::encrypt(&[0xEE; 32], b"junk", Some(&header_bytes)).unwrap();
        let forged = MessageV1 {
            header_bytes,
            ciphertext,
        };
        transport
            .publish(vec![Envelope {
                content_topic: topic::intro(bob.address()),
                timestamp_ns: now_ns(),
                payload: postcard::to_allocvec(&forged).unwrap(),
            }])
            .await
            .unwrap();

        assert!(bob.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_finds_intro_older_than_cached_invite() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let bob = new_client(&transport).await;

        // Caching the invitation-based conversation first sets the invite
        // watermark at "now"
        alice.new_conversation(bob.address(), None).await.unwrap();

        // A legacy peer's intro with an earlier sender-assigned timestamp
        // surfaces afterwards
        let legacy_wallet = LocalWallet::generate().unwrap();
        let legacy = PrivateKeyBundle::generate(&legacy_wallet).unwrap();
        let old_ts = now_ns() - 60_000_000_000;
        let content = TextCodec.encode("hello from v1".to_string()).unwrap();
        let intro =
            MessageV1::encode(&legacy, alice.public_key_bundle(), &content, old_ts).unwrap();
        transport
            .publish(vec![Envelope {
                content_topic: topic::intro(alice.address()),
                timestamp_ns: old_ts,
                payload: postcard::to_allocvec(&intro).unwrap(),
            }])
            .await
            .unwrap();

        let listed = alice.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed
            .iter()
            .any(|c| c.peer_address() == legacy.wallet_address()));
    }

    #[tokio::test]
    async fn test_stream_conversations_emits_new_only() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let bob = new_client(&transport).await;

        let mut stream = bob.stream_conversations().await.unwrap();
        let created = alice.new_conversation(bob.address(), None).await.unwrap();

        let announced = stream.next().await.unwrap();
        assert_eq!(announced.topic(), created.topic());
    }

    #[tokio::test]
    async fn test_stream_all_messages_spans_new_conversations() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let bob = new_client(&transport).await;

        let mut stream = bob.stream_all_messages().await.unwrap();

        // Conversation did not exist when Bob subscribed
        let conversation = alice.new_conversation(bob.address(), None).await.unwrap();
        // Give the producer a moment to resubscribe with the new topic
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        conversation.send_text(&alice, "first contact").await.unwrap();

        let received = stream.next().await.unwrap();
        assert_eq!(received.text().unwrap(), "first contact");
    }

    #[tokio::test]
    async fn test_list_batch_messages_merges_topics() {
        let transport = Arc::new(InMemoryTransport::new());
        let alice = new_client(&transport).await;
        let bob = new_client(&transport).await;
        let carol = new_client(&transport).await;

        let with_bob = alice.new_conversation(bob.address(), None).await.unwrap();
        let with_carol = alice.new_conversation(carol.address(), None).await.unwrap();
        with_bob.send_text(&alice, "to bob").await.unwrap();
        with_carol.send_text(&alice, "to carol").await.unwrap();

        let topics = vec![
            with_bob.topic().to_string(),
            with_carol.topic().to_string(),
            "/xmtp/0/m-unknown/proto".to_string(),
        ];
        let messages = alice.list_batch_messages(&topics).await.unwrap();
        assert_eq!(messages.len(), 2);
        // Newest first across topics
        assert_eq!(messages[0].text().unwrap(), "to carol");
        assert_eq!(messages[1].text().unwrap(), "to bob");
    }
}
