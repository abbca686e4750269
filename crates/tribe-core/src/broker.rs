//! Tribe event broker.
//!
//! The broker routes events to listeners by user and by group, and keeps
//! exactly one upstream subscription alive for every group that has at least
//! one listener.
//!
//! All routing state lives behind a single mutex that is never held across
//! an `.await`. Sends snapshot the target listeners under the lock and write
//! after releasing it, so a slow listener never blocks `join` or `leave`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::event::Event;
use crate::listener::{
    Delivery, DeliveryPolicy, GroupKey, ListenerChannel, ListenerId, ListenerSlot, UserKey,
    DEFAULT_LISTENER_CAPACITY,
};
use crate::upstream::{is_done, Backoff, PumpDone, Upstream, UpstreamSubscription};

/// Default upstream topic prefix; a group's topic is `<prefix><group>`.
pub const DEFAULT_TOPIC_PREFIX: &str = "tribemsg:";

/// A send target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKey {
    User(UserKey),
    Group(GroupKey),
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKey::User(user) => write!(f, "user {user}"),
            RouteKey::Group(group) => write!(f, "group {group}"),
        }
    }
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The key has never had a listener.
    #[error("Key not found: {0}")]
    KeyNotFound(RouteKey),
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Queue capacity of each listener (clamped to at least 16).
    pub listener_capacity: usize,
    /// What to do when a listener's queue is full.
    pub delivery_policy: DeliveryPolicy,
    /// Upstream topic prefix.
    pub topic_prefix: String,
    /// First delay before resubscribing after an upstream failure.
    pub resubscribe_initial: Duration,
    /// Upper bound for the resubscribe delay.
    pub resubscribe_max: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listener_capacity: DEFAULT_LISTENER_CAPACITY,
            delivery_policy: DeliveryPolicy::Block,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            resubscribe_initial: Duration::from_millis(250),
            resubscribe_max: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of a group's upstream subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Absent,
    Active,
    /// Cancelled, but the pump has not finished unwinding.
    Cancelling,
}

/// Running totals, shared with the pumps.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) delivered: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) disconnected: AtomicU64,
    pub(crate) decode_failures: AtomicU64,
    pub(crate) unknown_variants: AtomicU64,
    pub(crate) upstream_errors: AtomicU64,
}

#[derive(Default)]
struct RoutingState {
    /// Every live listener by identity.
    listeners: HashMap<ListenerId, Arc<ListenerSlot>>,
    /// User index. Keys are kept after their last listener leaves.
    users: HashMap<UserKey, Vec<Arc<ListenerSlot>>>,
    /// Group index. Keys are kept after their last listener leaves.
    groups: HashMap<GroupKey, Vec<Arc<ListenerSlot>>>,
    /// Active subscriptions; present iff the group's list is non-empty.
    subscriptions: HashMap<GroupKey, UpstreamSubscription>,
    /// Cancelled pumps that may still be unwinding.
    retiring: HashMap<GroupKey, PumpDone>,
}

pub(crate) struct BrokerInner {
    state: Mutex<RoutingState>,
    upstream: Arc<dyn Upstream>,
    config: BrokerConfig,
    next_listener: AtomicU64,
    pub(crate) counters: Counters,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, RoutingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The tribe event broker.
///
/// Cheap to clone; clones share the same routing state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Create a broker with default configuration.
    #[must_use]
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self::with_config(upstream, BrokerConfig::default())
    }

    /// Create a broker with custom configuration.
    #[must_use]
    pub fn with_config(upstream: Arc<dyn Upstream>, config: BrokerConfig) -> Self {
        info!(upstream = upstream.name(), "Creating broker with config: {:?}", config);
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(RoutingState::default()),
                upstream,
                config,
                next_listener: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<BrokerInner>) -> Self {
        Self { inner }
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Upstream topic for a group.
    #[must_use]
    pub fn topic(&self, group: GroupKey) -> String {
        format!("{}{}", self.inner.config.topic_prefix, group)
    }

    /// Register a new listener for `user` in `group`.
    ///
    /// Starts the group's upstream subscription if this is the group's only
    /// listener. Must be called from within a Tokio runtime.
    pub fn join(&self, user: impl Into<UserKey>, group: GroupKey) -> ListenerChannel {
        let user = user.into();
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let (slot, channel) =
            ListenerSlot::new(id, user.clone(), group, self.inner.config.listener_capacity);

        let mut state = self.inner.lock();
        state.listeners.insert(id, Arc::clone(&slot));
        state
            .users
            .entry(user.clone())
            .or_default()
            .push(Arc::clone(&slot));
        let members = state.groups.entry(group).or_default();
        members.push(slot);
        let member_count = members.len();

        if !state.subscriptions.contains_key(&group) {
            self.start_subscription(&mut state, group);
        }
        drop(state);

        debug!(
            listener = %id,
            user = %user,
            group,
            members = member_count,
            "Listener joined"
        );
        channel
    }

    fn start_subscription(&self, state: &mut RoutingState, group: GroupKey) {
        let predecessor = state.retiring.remove(&group);
        state.retiring.retain(|_, done| !is_done(done));

        let subscription = UpstreamSubscription::spawn(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.upstream),
            group,
            self.topic(group),
            Backoff {
                initial: self.inner.config.resubscribe_initial,
                max: self.inner.config.resubscribe_max,
            },
            predecessor,
        );
        state.subscriptions.insert(group, subscription);
        debug!(group, "Starting upstream subscription");
    }

    /// Remove a listener from every index and close it.
    ///
    /// Cancels the group's upstream subscription if this was its last
    /// listener. Returns `false` if the listener was already gone.
    pub fn leave(&self, id: ListenerId) -> bool {
        let mut state = self.inner.lock();
        let Some(slot) = state.listeners.remove(&id) else {
            return false;
        };

        if let Some(list) = state.users.get_mut(&slot.user) {
            list.retain(|s| s.id != id);
        }
        let remaining = match state.groups.get_mut(&slot.group) {
            Some(list) => {
                list.retain(|s| s.id != id);
                list.len()
            }
            None => 0,
        };

        if remaining == 0 {
            if let Some(subscription) = state.subscriptions.remove(&slot.group) {
                let done = subscription.cancel();
                state.retiring.insert(slot.group, done);
                debug!(group = slot.group, "Cancelling upstream subscription");
            }
        }

        // Closed only after removal, while the lock is still held.
        slot.close();
        drop(state);

        debug!(
            listener = %id,
            user = %slot.user,
            group = slot.group,
            members = remaining,
            "Listener left"
        );
        true
    }

    /// Send an event to every listener owned by `user`.
    ///
    /// Returns the number of listeners the event was written to.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if the user never had a listener.
    pub async fn send_to_user(&self, user: &str, event: Event) -> Result<usize, BrokerError> {
        let targets = {
            let state = self.inner.lock();
            state
                .users
                .get(user)
                .cloned()
                .ok_or_else(|| BrokerError::KeyNotFound(RouteKey::User(user.to_string())))?
        };
        Ok(self.fan_out(targets, event).await)
    }

    /// Send an event to every listener in `group`.
    ///
    /// Returns the number of listeners the event was written to.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if the group never had a listener.
    pub async fn send_to_group(&self, group: GroupKey, event: Event) -> Result<usize, BrokerError> {
        let targets = {
            let state = self.inner.lock();
            state
                .groups
                .get(&group)
                .cloned()
                .ok_or(BrokerError::KeyNotFound(RouteKey::Group(group)))?
        };
        Ok(self.fan_out(targets, event).await)
    }

    async fn fan_out(&self, targets: Vec<Arc<ListenerSlot>>, event: Event) -> usize {
        let policy = self.inner.config.delivery_policy;
        let counters = &self.inner.counters;
        let mut delivered = 0;
        let mut overflowed = Vec::new();

        for slot in &targets {
            match slot.deliver(event.clone(), policy).await {
                Delivery::Delivered => delivered += 1,
                Delivery::Skipped => {}
                Delivery::Dropped => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(listener = %slot.id, user = %slot.user, "Listener queue full, event dropped");
                }
                Delivery::Overflowed => overflowed.push(slot.id),
            }
        }

        for id in overflowed {
            if self.leave(id) {
                counters.disconnected.fetch_add(1, Ordering::Relaxed);
                warn!(listener = %id, "Listener queue full, disconnecting");
            }
        }

        counters.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Current state of a group's upstream subscription.
    #[must_use]
    pub fn subscription_state(&self, group: GroupKey) -> SubscriptionState {
        let state = self.inner.lock();
        if state.subscriptions.contains_key(&group) {
            SubscriptionState::Active
        } else if state.retiring.get(&group).is_some_and(|done| !is_done(done)) {
            SubscriptionState::Cancelling
        } else {
            SubscriptionState::Absent
        }
    }

    /// Wait until a cancelled subscription for `group` has fully stopped.
    ///
    /// Returns immediately if the group has no cancelled subscription.
    pub async fn retire(&self, group: GroupKey) {
        let done = self.inner.lock().retiring.get(&group).cloned();
        if let Some(done) = done {
            done.await;
        }
    }

    /// Number of listeners currently registered for a group.
    #[must_use]
    pub fn group_listener_count(&self, group: GroupKey) -> usize {
        self.inner.lock().groups.get(&group).map_or(0, Vec::len)
    }

    /// Number of listeners currently registered for a user.
    #[must_use]
    pub fn user_listener_count(&self, user: &str) -> usize {
        self.inner.lock().users.get(user).map_or(0, Vec::len)
    }

    /// Close every listener, cancel every subscription and wait for all
    /// pumps to stop.
    pub async fn shutdown(&self) {
        let pumps: Vec<PumpDone> = {
            let mut state = self.inner.lock();
            for list in state.users.values_mut() {
                list.clear();
            }
            for list in state.groups.values_mut() {
                list.clear();
            }
            for (_, slot) in state.listeners.drain() {
                slot.close();
            }
            let mut pumps: Vec<PumpDone> = state
                .subscriptions
                .drain()
                .map(|(_, subscription)| subscription.cancel())
                .collect();
            pumps.extend(state.retiring.drain().map(|(_, done)| done));
            pumps
        };

        info!(pumps = pumps.len(), "Shutting down broker");
        for done in pumps {
            done.await;
        }
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let (users, groups, listeners, active_subscriptions, retiring_subscriptions) = {
            let state = self.inner.lock();
            (
                state.users.values().filter(|l| !l.is_empty()).count(),
                state.groups.values().filter(|l| !l.is_empty()).count(),
                state.listeners.len(),
                state.subscriptions.len(),
                state.retiring.values().filter(|done| !is_done(done)).count(),
            )
        };
        let counters = &self.inner.counters;
        BrokerStats {
            users,
            groups,
            listeners,
            active_subscriptions,
            retiring_subscriptions,
            events_delivered: counters.delivered.load(Ordering::Relaxed),
            events_dropped: counters.dropped.load(Ordering::Relaxed),
            listeners_disconnected: counters.disconnected.load(Ordering::Relaxed),
            decode_failures: counters.decode_failures.load(Ordering::Relaxed),
            unknown_variants: counters.unknown_variants.load(Ordering::Relaxed),
            upstream_errors: counters.upstream_errors.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("upstream", &self.inner.upstream.name())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Broker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    /// Users with at least one listener.
    pub users: usize,
    /// Groups with at least one listener.
    pub groups: usize,
    /// Registered listeners.
    pub listeners: usize,
    /// Active upstream subscriptions.
    pub active_subscriptions: usize,
    /// Cancelled subscriptions still unwinding.
    pub retiring_subscriptions: usize,
    /// Total successful listener writes.
    pub events_delivered: u64,
    /// Events dropped on full queues.
    pub events_dropped: u64,
    /// Listeners removed for falling behind.
    pub listeners_disconnected: u64,
    /// Upstream payloads that failed to decode.
    pub decode_failures: u64,
    /// Upstream payloads with an unknown discriminant.
    pub unknown_variants: u64,
    /// Upstream subscribe/read failures.
    pub upstream_errors: u64,
}
