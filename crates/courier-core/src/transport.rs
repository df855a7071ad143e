//! Transport abstraction: envelopes, queries, and subscriptions
//!
//! The core never talks to the network directly. It publishes and queries
//! opaque [`Envelope`]s through the [`Transport`] trait; a gRPC or HTTP
//! client lives behind this seam in other crates. The [`memory`] submodule
//! provides a complete in-process implementation used by the tests and the
//! CLI demo.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{CourierError, Result};

/// Hard server-side cap on query requests per batch call.
pub const MAX_QUERY_REQUESTS_PER_BATCH: usize = 50;

/// Maximum envelopes returned per query page.
pub const MAX_PAGE_SIZE: u32 = 100;

/// A timestamped payload on a topic. The unit the network stores and relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub content_topic: String,
    /// Sender-assigned time in nanoseconds since the Unix epoch
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

/// Sort order for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Resume point within a topic's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// sha256 of the envelope payload the previous page ended on
    pub digest: Vec<u8>,
    pub sender_time_ns: u64,
}

/// Page size, order, and resume point for a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: Option<u32>,
    pub direction: SortDirection,
    pub cursor: Option<Cursor>,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: None,
            direction: SortDirection::Descending,
            cursor: None,
        }
    }
}

/// A single-topic history query with an optional time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub content_topic: String,
    /// Inclusive lower bound on `timestamp_ns`
    pub start_time_ns: Option<u64>,
    /// Inclusive upper bound on `timestamp_ns`
    pub end_time_ns: Option<u64>,
    pub pagination: Option<Pagination>,
}

impl QueryRequest {
    pub fn new(content_topic: impl Into<String>) -> Self {
        Self {
            content_topic: content_topic.into(),
            start_time_ns: None,
            end_time_ns: None,
            pagination: None,
        }
    }
}

/// One page of query results plus the cursor to fetch the next page, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub envelopes: Vec<Envelope>,
    pub cursor: Option<Cursor>,
}

/// Live feed of envelopes matching a subscription.
///
/// Backed by an mpsc channel; dropping the stream detaches it from the
/// transport, which prunes the dead subscriber on its next publish.
pub struct EnvelopeStream {
    receiver: mpsc::Receiver<Envelope>,
}

impl EnvelopeStream {
    pub fn new(receiver: mpsc::Receiver<Envelope>) -> Self {
        Self { receiver }
    }

    /// Next envelope, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Stop receiving. Already-buffered envelopes are discarded.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl futures::Stream for EnvelopeStream {
    type Item = Envelope;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Envelope>> {
        self.receiver.poll_recv(cx)
    }
}

/// Network backend seam. Implementations must be cheap to share behind `Arc`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch one page of a topic's history.
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse>;

    /// Durably publish envelopes and fan them out to live subscribers.
    async fn publish(&self, envelopes: Vec<Envelope>) -> Result<()>;

    /// Run up to [`MAX_QUERY_REQUESTS_PER_BATCH`] queries in one call.
    /// Responses are positionally matched to requests.
    async fn batch_query(&self, requests: Vec<QueryRequest>) -> Result<Vec<QueryResponse>>;

    /// Open a live feed over the given topics.
    async fn subscribe(&self, topics: Vec<String>) -> Result<EnvelopeStream>;
}

/// Drain a topic's full history by walking pages until the cursor runs out.
pub async fn query_all(
    transport: &dyn Transport,
    content_topic: &str,
    start_time_ns: Option<u64>,
    direction: SortDirection,
) -> Result<Vec<Envelope>> {
    let mut collected = Vec::new();
    let mut cursor = None;
    loop {
        let response = transport
            .query(QueryRequest {
                content_topic: content_topic.to_string(),
                start_time_ns,
                end_time_ns: None,
                pagination: Some(Pagination {
                    limit: Some(MAX_PAGE_SIZE),
                    direction,
                    cursor: cursor.take(),
                }),
            })
            .await?;
        if response.envelopes.is_empty() {
            break;
        }
        collected.extend(response.envelopes);
        match response.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(collected)
}

/// Guard a batch against the server-side request cap before sending it.
pub fn check_batch_size(requests: &[QueryRequest]) -> Result<()> {
    if requests.len() > MAX_QUERY_REQUESTS_PER_BATCH {
        return Err(CourierError::BatchTooLarge(
            requests.len(),
            MAX_QUERY_REQUESTS_PER_BATCH,
        ));
    }
    Ok(())
}

pub mod memory {
    //! In-process transport with full pagination and subscription semantics

    use std::collections::HashMap;

    use parking_lot::Mutex;
    use tracing::debug;

    use super::*;
    use crate::crypto::sha256;

    struct Subscriber {
        topics: Vec<String>,
        sender: mpsc::Sender<Envelope>,
    }

    #[derive(Default)]
    struct State {
        topics: HashMap<String, Vec<Envelope>>,
        subscribers: Vec<Subscriber>,
    }

    /// Stores envelopes per topic in arrival order and fans published
    /// envelopes out to live subscribers. Test double and CLI demo backend.
    #[derive(Default)]
    pub struct InMemoryTransport {
        state: Mutex<State>,
    }

    impl InMemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Raw stored envelopes for a topic, in arrival order. Test hook.
        pub fn stored(&self, content_topic: &str) -> Vec<Envelope> {
            self.state
                .lock()
                .topics
                .get(content_topic)
                .cloned()
                .unwrap_or_default()
        }

        /// Number of envelopes stored on a topic. Test hook.
        pub fn stored_count(&self, content_topic: &str) -> usize {
            self.state
                .lock()
                .topics
                .get(content_topic)
                .map(|v| v.len())
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl Transport for InMemoryTransport {
        async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
            let state = self.state.lock();
            let mut matching: Vec<Envelope> = state
                .topics
                .get(&request.content_topic)
                .map(|envelopes| {
                    envelopes
                        .iter()
                        .filter(|e| {
                            request.start_time_ns.map_or(true, |s| e.timestamp_ns >= s)
                                && request.end_time_ns.map_or(true, |e_ns| e.timestamp_ns <= e_ns)
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            drop(state);

            let pagination = request.pagination.unwrap_or_default();
            match pagination.direction {
                SortDirection::Ascending => {
                    matching.sort_by_key(|e| e.timestamp_ns);
                }
                SortDirection::Descending => {
                    matching.sort_by_key(|e| std::cmp::Reverse(e.timestamp_ns));
                }
            }

            // Resume strictly after the envelope the cursor names.
            if let Some(cursor) = &pagination.cursor {
                if let Some(pos) = matching
                    .iter()
                    .position(|e| sha256(&e.payload).as_slice() == cursor.digest.as_slice())
                {
                    matching.drain(..=pos);
                }
            }

            let limit = pagination
                .limit
                .unwrap_or(MAX_PAGE_SIZE)
                .min(MAX_PAGE_SIZE) as usize;
            let has_more = matching.len() > limit;
            matching.truncate(limit);

            let cursor = if has_more {
                matching.last().map(|e| Cursor {
                    digest: sha256(&e.payload).to_vec(),
                    sender_time_ns: e.timestamp_ns,
                })
            } else {
                None
            };

            Ok(QueryResponse {
                envelopes: matching,
                cursor,
            })
        }

        async fn publish(&self, envelopes: Vec<Envelope>) -> Result<()> {
            let mut state = self.state.lock();
            for envelope in &envelopes {
                state
                    .topics
                    .entry(envelope.content_topic.clone())
                    .or_default()
                    .push(envelope.clone());
            }

            // Fan out, pruning subscribers whose receiver is gone.
            state.subscribers.retain(|subscriber| {
                for envelope in &envelopes {
                    if subscriber
                        .topics
                        .iter()
                        .any(|t| t == &envelope.content_topic)
                    {
                        match subscriber.sender.try_send(envelope.clone()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Closed(_)) => return false,
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                debug!(
                                    topic = %envelope.content_topic,
                                    "subscriber buffer full, dropping envelope"
                                );
                            }
                        }
                    }
                }
                true
            });
            Ok(())
        }

        async fn batch_query(&self, requests: Vec<QueryRequest>) -> Result<Vec<QueryResponse>> {
            check_batch_size(&requests)?;
            let mut responses = Vec::with_capacity(requests.len());
            for request in requests {
                responses.push(self.query(request).await?);
            }
            Ok(responses)
        }

        async fn subscribe(&self, topics: Vec<String>) -> Result<EnvelopeStream> {
            let (sender, receiver) = mpsc::channel(256);
            self.state
                .lock()
                .subscribers
                .push(Subscriber { topics, sender });
            Ok(EnvelopeStream::new(receiver))
        }
    }

}
