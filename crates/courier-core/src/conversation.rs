//! Conversations: the two concrete exchange shapes behind one API
//!
//! [`Conversation`] is a closed sum over the direct format (V1, topic derived
//! from the address pair) and the invitation-established format (V2, topic
//! and key material from an [`crate::invitation::InvitationV1`]). Operations
//! take the [`Client`] as an argument rather than holding a handle, so
//! conversations stay plain data and the cache never cycles through `Arc`s.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::Client;
use crate::codec::{ContentCodec, EncodedContent, TextCodec};
use crate::error::{CourierError, Result};
use crate::invitation::InvitationContext;
use crate::message::{message_id, MessageV1, MessageV2};
use crate::time::now_ns;
use crate::topic;
use crate::transport::Envelope;

/// A decrypted, verified message ready for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    /// Content-addressed id: hex sha256 of the envelope payload
    pub id: String,
    pub content: EncodedContent,
    pub sender_address: String,
    pub sent_at_ns: u64,
    pub topic: String,
}

impl DecodedMessage {
    /// Decode the content as text.
    pub fn text(&self) -> Result<String> {
        TextCodec.decode(&self.content)
    }
}

/// A direct conversation on the address-pair topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationV1 {
    pub(crate) peer_address: String,
    pub(crate) created_at_ns: u64,
    pub(crate) topic: String,
}

impl ConversationV1 {
    pub(crate) fn new(my_address: &str, peer_address: String, created_at_ns: u64) -> Self {
        let topic = topic::direct_message(my_address, &peer_address);
        Self {
            peer_address,
            created_at_ns,
            topic,
        }
    }
}

/// An invitation-established conversation with its own key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationV2 {
    pub(crate) topic: String,
    pub(crate) peer_address: String,
    pub(crate) created_at_ns: u64,
    pub(crate) context: Option<InvitationContext>,
    pub(crate) key_material: Vec<u8>,
}

/// Either conversation shape. Equality is by topic.
#[derive(Debug, Clone)]
pub enum Conversation {
    V1(ConversationV1),
    V2(ConversationV2),
}

impl PartialEq for Conversation {
    fn eq(&self, other: &Self) -> bool {
        self.topic() == other.topic()
    }
}

impl Eq for Conversation {}

impl Conversation {
    pub fn topic(&self) -> &str {
        match self {
            Self::V1(c) => &c.topic,
            Self::V2(c) => &c.topic,
        }
    }

    pub fn peer_address(&self) -> &str {
        match self {
            Self::V1(c) => &c.peer_address,
            Self::V2(c) => &c.peer_address,
        }
    }

    pub fn created_at_ns(&self) -> u64 {
        match self {
            Self::V1(c) => c.created_at_ns,
            Self::V2(c) => c.created_at_ns,
        }
    }

    /// The application conversation id, if this conversation carries one.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::V1(_) => None,
            Self::V2(c) => c.context.as_ref().map(|ctx| ctx.conversation_id.as_str()),
        }
    }

    /// Encrypt and publish `content`, returning the message id.
    ///
    /// Sending also records an `Allow` consent entry for the peer if its
    /// state is still unknown, and (for direct conversations) publishes
    /// first-contact copies on both parties' intro topics.
    pub async fn send(&self, client: &Client, content: EncodedContent) -> Result<String> {
        let sent_at_ns = now_ns();
        let mut envelopes = Vec::with_capacity(3);

        match self {
            Self::V1(conversation) => {
                let peer_bundle = client
                    .find_contact(&conversation.peer_address)
                    .await?
                    .ok_or_else(|| {
                        CourierError::RecipientNotOnNetwork(conversation.peer_address.clone())
                    })?;
                let message =
                    MessageV1::encode(client.keys(), &peer_bundle, &content, sent_at_ns)?;
                let payload = postcard::to_allocvec(&message)?;

                let needs_intro = !client.inner.introduced.lock().contains(&conversation.topic);
                if needs_intro {
                    for intro_topic in [
                        topic::intro(client.address()),
                        topic::intro(&conversation.peer_address),
                    ] {
                        envelopes.push(Envelope {
                            content_topic: intro_topic,
                            timestamp_ns: sent_at_ns,
                            payload: payload.clone(),
                        });
                    }
                }
                envelopes.push(Envelope {
                    content_topic: conversation.topic.clone(),
                    timestamp_ns: sent_at_ns,
                    payload,
                });
            }
            Self::V2(conversation) => {
                let message = MessageV2::encode(
                    client.keys(),
                    &content,
                    &conversation.topic,
                    &conversation.key_material,
                    sent_at_ns,
                )?;
                envelopes.push(Envelope {
                    content_topic: conversation.topic.clone(),
                    timestamp_ns: sent_at_ns,
                    payload: postcard::to_allocvec(&message)?,
                });
            }
        }

        // Id of the copy on the conversation topic, which is pushed last
        let id = message_id(&envelopes[envelopes.len() - 1].payload);
        client.publish(envelopes).await?;

        if let Self::V1(conversation) = self {
            client
                .inner
                .introduced
                .lock()
                .insert(conversation.topic.clone());
        }
        client.allow_on_send(self.peer_address()).await?;
        Ok(id)
    }

    /// Send a plain text message.
    pub async fn send_text(&self, client: &Client, body: &str) -> Result<String> {
        self.send(client, TextCodec.encode(body.to_string())?).await
    }

    /// Decrypt one envelope from this conversation's topic.
    pub fn decode(&self, client: &Client, envelope: &Envelope) -> Result<DecodedMessage> {
        let id = message_id(&envelope.payload);
        match self {
            Self::V1(_) => {
                let message: MessageV1 = postcard::from_bytes(&envelope.payload)?;
                let header = message.header()?;
                let content = message.decrypt(client.keys())?;
                Ok(DecodedMessage {
                    id,
                    content,
                    sender_address: header.sender.wallet_address()?,
                    sent_at_ns: header.timestamp_ns,
                    topic: envelope.content_topic.clone(),
                })
            }
            Self::V2(conversation) => {
                let message: MessageV2 = postcard::from_bytes(&envelope.payload)?;
                let header = message.header()?;
                let signed = message.decrypt(&conversation.key_material)?;
                Ok(DecodedMessage {
                    id,
                    content: signed.content()?,
                    sender_address: signed.sender.wallet_address()?,
                    sent_at_ns: header.created_ns,
                    topic: envelope.content_topic.clone(),
                })
            }
        }
    }

    /// Full decrypted history, newest first. Envelopes that fail to decode
    /// are logged and skipped.
    pub async fn messages(&self, client: &Client) -> Result<Vec<DecodedMessage>> {
        use crate::transport::{query_all, SortDirection};

        let envelopes = client
            .timed(query_all(
                client.transport(),
                self.topic(),
                None,
                SortDirection::Descending,
            ))
            .await?;

        let mut messages = Vec::with_capacity(envelopes.len());
        for envelope in &envelopes {
            match self.decode(client, envelope) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    debug!(topic = %self.topic(), error = %e, "skipping undecodable envelope");
                }
            }
        }
        Ok(messages)
    }

    /// One page of history under explicit pagination, with the cursor to
    /// continue from. Undecodable envelopes are logged and skipped.
    pub async fn messages_page(
        &self,
        client: &Client,
        start_time_ns: Option<u64>,
        end_time_ns: Option<u64>,
        pagination: crate::transport::Pagination,
    ) -> Result<(Vec<DecodedMessage>, Option<crate::transport::Cursor>)> {
        let response = client
            .timed(client.transport().query(crate::transport::QueryRequest {
                content_topic: self.topic().to_string(),
                start_time_ns,
                end_time_ns,
                pagination: Some(pagination),
            }))
            .await?;

        let mut messages = Vec::with_capacity(response.envelopes.len());
        for envelope in &response.envelopes {
            match self.decode(client, envelope) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    debug!(topic = %self.topic(), error = %e, "skipping undecodable envelope");
                }
            }
        }
        Ok((messages, response.cursor))
    }

    /// Live feed of new messages in this conversation.
    pub async fn stream_messages(&self, client: &Client) -> Result<MessageStream> {
        let mut envelopes = client
            .timed(client.transport().subscribe(vec![self.topic().to_string()]))
            .await?;
        let (sender, receiver) = mpsc::channel(64);
        let conversation = self.clone();
        let client = client.clone();

        let producer = tokio::spawn(async move {
            while let Some(envelope) = envelopes.next().await {
                match conversation.decode(&client, &envelope) {
                    Ok(message) => {
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(
                            topic = %conversation.topic(),
                            error = %e,
                            "skipping undecodable envelope"
                        );
                    }
                }
            }
        });
        Ok(MessageStream { receiver, producer })
    }
}

/// Live message feed. Dropping it stops the producer task.
pub struct MessageStream {
    pub(crate) receiver: mpsc::Receiver<DecodedMessage>,
    pub(crate) producer: JoinHandle<()>,
}

impl MessageStream {
    pub async fn next(&mut self) -> Option<DecodedMessage> {
        self.receiver.recv().await
    }
}

impl futures::Stream for MessageStream {
    type Item = DecodedMessage;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<DecodedMessage>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}
