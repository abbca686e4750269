//! Upstream feeds and the per-group pump task.
//!
//! The broker owns at most one [`UpstreamSubscription`] per group. Each one is
//! a spawned pump that reads raw payloads from the group's upstream topic,
//! decodes them and fans the results out through
//! [`Broker::send_to_group`](crate::Broker::send_to_group).

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};
use tribe_protocol::{codec, DecodeError};

use crate::broker::{Broker, BrokerInner, Counters};
use crate::event::Event;
use crate::listener::GroupKey;

/// Upstream errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The feed ended or the connection was dropped.
    #[error("Upstream disconnected")]
    Disconnected,

    /// I/O error talking to the upstream.
    #[error("Upstream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The upstream sent something we could not understand.
    #[error("Upstream protocol error: {0}")]
    Protocol(String),
}

/// A publish/subscribe source with one topic per group.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Subscribe to a topic.
    ///
    /// Dropping the returned feed releases the subscription.
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn UpstreamFeed>, UpstreamError>;

    /// Upstream name (e.g., "memory", "redis").
    fn name(&self) -> &'static str;
}

/// A live subscription to one upstream topic.
#[async_trait]
pub trait UpstreamFeed: Send {
    /// Wait for the next raw payload.
    ///
    /// Returns `Ok(None)` if the feed ended cleanly.
    async fn next_message(&mut self) -> Result<Option<Bytes>, UpstreamError>;
}

/// Completion of a pump task. Cloneable so that both a successor pump and
/// [`Broker::retire`](crate::Broker::retire) can wait on it.
pub(crate) type PumpDone = Shared<BoxFuture<'static, ()>>;

pub(crate) fn is_done(done: &PumpDone) -> bool {
    done.clone().now_or_never().is_some()
}

/// Retry delays after an upstream failure.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    pub(crate) initial: Duration,
    pub(crate) max: Duration,
}

/// Handle to a running pump.
pub(crate) struct UpstreamSubscription {
    cancel: oneshot::Sender<()>,
    done: PumpDone,
}

impl UpstreamSubscription {
    /// Spawn the pump for `group`. If `predecessor` is set, the new pump
    /// waits for it to finish before subscribing upstream.
    pub(crate) fn spawn(
        broker: Weak<BrokerInner>,
        upstream: Arc<dyn Upstream>,
        group: GroupKey,
        topic: String,
        backoff: Backoff,
        predecessor: Option<PumpDone>,
    ) -> Self {
        let (cancel, cancelled) = oneshot::channel();
        let pump = Pump {
            broker,
            upstream,
            group,
            topic,
            backoff,
        };
        let handle = tokio::spawn(pump.run(predecessor.clone(), cancelled));
        // Completion implies the predecessor has finished too, even when this
        // pump was cancelled before it stopped waiting.
        let done = async move {
            let _ = handle.await;
            if let Some(predecessor) = predecessor {
                predecessor.await;
            }
        }
        .boxed()
        .shared();
        Self { cancel, done }
    }

    /// Signal the pump to stop. Returns its completion future.
    pub(crate) fn cancel(self) -> PumpDone {
        let _ = self.cancel.send(());
        self.done
    }
}

enum FeedEnd {
    Cancelled,
    BrokerGone,
    Failed(UpstreamError),
}

struct Pump {
    broker: Weak<BrokerInner>,
    upstream: Arc<dyn Upstream>,
    group: GroupKey,
    topic: String,
    backoff: Backoff,
}

impl Pump {
    async fn run(self, predecessor: Option<PumpDone>, mut cancelled: oneshot::Receiver<()>) {
        // The predecessor has already been cancelled; it only has to unwind.
        if let Some(predecessor) = predecessor {
            tokio::select! {
                biased;
                _ = &mut cancelled => {
                    debug!(group = self.group, topic = %self.topic, "Cancelled before subscribing");
                    return;
                }
                () = predecessor => {}
            }
        }

        info!(group = self.group, topic = %self.topic, upstream = self.upstream.name(), "Upstream subscription started");
        let mut delay = self.backoff.initial;

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = &mut cancelled => break,
                result = self.upstream.subscribe(&self.topic) => result,
            };

            let err = match subscribed {
                Ok(mut feed) => {
                    debug!(group = self.group, topic = %self.topic, "Subscribed upstream");
                    delay = self.backoff.initial;
                    match self.pump_feed(feed.as_mut(), &mut cancelled).await {
                        FeedEnd::Cancelled | FeedEnd::BrokerGone => break,
                        FeedEnd::Failed(err) => err,
                    }
                }
                Err(err) => err,
            };

            let Some(broker) = self.broker.upgrade() else {
                break;
            };
            broker.counters.upstream_errors.fetch_add(1, Ordering::Relaxed);
            drop(broker);

            error!(
                group = self.group,
                topic = %self.topic,
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "Upstream subscription lost"
            );

            tokio::select! {
                biased;
                _ = &mut cancelled => break,
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.backoff.max);
        }

        info!(group = self.group, topic = %self.topic, "Upstream subscription stopped");
    }

    /// Pump one feed until it fails or the pump is cancelled. The feed is
    /// released when the caller drops it.
    async fn pump_feed(
        &self,
        feed: &mut dyn UpstreamFeed,
        cancelled: &mut oneshot::Receiver<()>,
    ) -> FeedEnd {
        loop {
            let message = tokio::select! {
                biased;
                _ = &mut *cancelled => return FeedEnd::Cancelled,
                message = feed.next_message() => message,
            };

            let raw = match message {
                Ok(Some(raw)) => raw,
                Ok(None) => return FeedEnd::Failed(UpstreamError::Disconnected),
                Err(err) => return FeedEnd::Failed(err),
            };

            let Some(inner) = self.broker.upgrade() else {
                return FeedEnd::BrokerGone;
            };
            let Some(event) = decode_event(self.group, &raw, &inner.counters) else {
                continue;
            };

            let broker = Broker::from_inner(inner);
            tokio::select! {
                biased;
                _ = &mut *cancelled => return FeedEnd::Cancelled,
                result = broker.send_to_group(self.group, event) => match result {
                    Ok(recipients) => trace!(group = self.group, recipients, "Forwarded upstream record"),
                    Err(err) => warn!(group = self.group, error = %err, "Forward failed"),
                },
            }
        }
    }
}

/// Decode one upstream payload. Failures are logged and counted, never
/// propagated: a bad record must not stop the pump.
fn decode_event(group: GroupKey, raw: &[u8], counters: &Counters) -> Option<Event> {
    match codec::decode_message(raw) {
        Ok((envelope, record)) => {
            trace!(group, envelope = %envelope, variant = record.name(), "Decoded record");
            match Event::from_record(&record) {
                Ok(event) => Some(event.with_group(group)),
                Err(err) => {
                    counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(group, variant = record.name(), error = %err, "Record not serializable");
                    None
                }
            }
        }
        Err(DecodeError::UnknownVariant { discriminant }) => {
            counters.unknown_variants.fetch_add(1, Ordering::Relaxed);
            debug!(group, discriminant, "Skipping unknown record variant");
            None
        }
        Err(err) => {
            counters.decode_failures.fetch_add(1, Ordering::Relaxed);
            warn!(group, error = %err, len = raw.len(), "Dropping malformed record");
            None
        }
    }
}
