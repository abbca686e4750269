//! Listener channels: bounded per-client delivery queues.
//!
//! A listener is split in two halves. The broker keeps a [`ListenerSlot`]
//! in its routing indices and writes into it; the transport owns the
//! [`ListenerChannel`] and drains it. Closing is a one-way flag on the slot
//! that both halves observe, so a sender blocked on a full queue wakes up as
//! soon as the listener leaves.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::event::Event;

/// Identity of a listener's owner. One user may hold several listeners.
pub type UserKey = String;

/// Identity of a broadcast group (a tribe).
pub type GroupKey = i64;

/// Smallest queue capacity the broker will allocate.
pub const MIN_LISTENER_CAPACITY: usize = 16;

/// Default queue capacity.
pub const DEFAULT_LISTENER_CAPACITY: usize = 20;

/// Unique listener identifier, used as the listener's identity in the
/// routing indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl ListenerId {
    /// The raw numeric ID.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// What a sender does when a listener's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Wait for the consumer to drain, or for the listener to leave.
    #[default]
    Block,
    /// Drop the event for this listener only.
    DropNewest,
    /// Remove the listener from the broker.
    Disconnect,
}

/// Outcome of one write into one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// The listener was closed or its consumer is gone.
    Skipped,
    /// Queue full under [`DeliveryPolicy::DropNewest`].
    Dropped,
    /// Queue full under [`DeliveryPolicy::Disconnect`].
    Overflowed,
}

/// Resolves once the closed flag is set, or its sender is gone.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Broker-side half of a listener.
#[derive(Debug)]
pub(crate) struct ListenerSlot {
    pub(crate) id: ListenerId,
    pub(crate) user: UserKey,
    pub(crate) group: GroupKey,
    sender: mpsc::Sender<Event>,
    closed: watch::Sender<bool>,
}

impl ListenerSlot {
    pub(crate) fn new(
        id: ListenerId,
        user: UserKey,
        group: GroupKey,
        capacity: usize,
    ) -> (Arc<Self>, ListenerChannel) {
        let capacity = capacity.max(MIN_LISTENER_CAPACITY);
        let (sender, receiver) = mpsc::channel(capacity);
        let (closed, closed_rx) = watch::channel(false);

        let channel = ListenerChannel {
            id,
            user: user.clone(),
            group,
            capacity,
            receiver,
            closed: closed_rx,
        };
        let slot = Arc::new(Self {
            id,
            user,
            group,
            sender,
            closed,
        });
        (slot, channel)
    }

    /// Mark the listener closed. Returns `true` only for the first call.
    pub(crate) fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write one event according to `policy`.
    pub(crate) async fn deliver(&self, event: Event, policy: DeliveryPolicy) -> Delivery {
        if self.is_closed() {
            return Delivery::Skipped;
        }

        match policy {
            DeliveryPolicy::Block => {
                let mut closed = self.closed.subscribe();
                let permit = tokio::select! {
                    biased;
                    () = wait_closed(&mut closed) => return Delivery::Skipped,
                    permit = self.sender.reserve() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Delivery::Skipped,
                    },
                };
                // The flag may have flipped while we held no lock.
                if self.is_closed() {
                    return Delivery::Skipped;
                }
                permit.send(event);
                trace!(listener = %self.id, "Delivered");
                Delivery::Delivered
            }
            DeliveryPolicy::DropNewest | DeliveryPolicy::Disconnect => {
                match self.sender.try_send(event) {
                    Ok(()) => Delivery::Delivered,
                    Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Skipped,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        if policy == DeliveryPolicy::DropNewest {
                            Delivery::Dropped
                        } else {
                            Delivery::Overflowed
                        }
                    }
                }
            }
        }
    }
}

/// Consumer-side half of a listener, handed to the transport by
/// [`Broker::join`](crate::Broker::join).
#[derive(Debug)]
pub struct ListenerChannel {
    id: ListenerId,
    user: UserKey,
    group: GroupKey,
    capacity: usize,
    receiver: mpsc::Receiver<Event>,
    closed: watch::Receiver<bool>,
}

impl ListenerChannel {
    /// The listener's identity, passed to [`Broker::leave`](crate::Broker::leave).
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Owning user.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Group the listener belongs to.
    #[must_use]
    pub fn group(&self) -> GroupKey {
        self.group
    }

    /// Queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the broker has closed this listener.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the listener has been closed; events still queued
    /// at that point are discarded.
    pub async fn recv(&mut self) -> Option<Event> {
        if self.is_closed() {
            return None;
        }
        tokio::select! {
            biased;
            () = wait_closed(&mut self.closed) => None,
            event = self.receiver.recv() => event,
        }
    }

    /// Receive an event if one is queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        if self.is_closed() {
            return None;
        }
        self.receiver.try_recv().ok()
    }
}
