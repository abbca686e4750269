//! In-process upstream for single-node deployments and tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::upstream::{Upstream, UpstreamError, UpstreamFeed};

/// Default per-topic buffer size.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// An [`Upstream`] backed by one broadcast channel per topic.
#[derive(Debug)]
pub struct MemoryUpstream {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl MemoryUpstream {
    /// Create an in-memory upstream with the default topic buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create an in-memory upstream with a custom topic buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Publish a raw payload. Returns the number of subscribers it reached.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        match self.topics.get(topic) {
            Some(sender) => sender.send(payload.into()).unwrap_or(0),
            None => 0,
        }
    }

    /// Number of live subscriptions on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Drop a topic, ending every feed subscribed to it.
    pub fn close_topic(&self, topic: &str) -> bool {
        self.topics.remove(topic).is_some()
    }
}

impl Default for MemoryUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Upstream for MemoryUpstream {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn UpstreamFeed>, UpstreamError> {
        let receiver = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!(topic, "Memory upstream subscribed");
        Ok(Box::new(MemoryFeed {
            topic: topic.to_string(),
            receiver,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryFeed {
    topic: String,
    receiver: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl UpstreamFeed for MemoryFeed {
    async fn next_message(&mut self) -> Result<Option<Bytes>, UpstreamError> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Ok(Some(payload)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Memory feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}
