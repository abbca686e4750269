//! # tribecast-core
//!
//! Listener routing and upstream subscription lifecycle for the tribe event
//! broker.
//!
//! - **Broker** - Routes events to listeners by user and by group
//! - **Listener** - Bounded per-client delivery queue
//! - **Upstream** - Pub/sub source with one topic per group, pumped into the broker
//! - **Event** - Outbound payload shared across fan-out
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Upstream   │────▶│    Pump     │────▶│   Broker    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                     one per group              │
//!                                                ▼
//!                                         ┌─────────────┐
//!                                         │  Listeners  │
//!                                         └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use tribecast_core::{Broker, Event, MemoryUpstream};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = Broker::new(Arc::new(MemoryUpstream::new()));
//! let mut listener = broker.join("player-1", 7);
//!
//! broker.send_to_group(7, Event::new("hello")).await.unwrap();
//! assert_eq!(listener.recv().await.unwrap().data(), "hello");
//!
//! broker.leave(listener.id());
//! # }
//! ```

pub mod broker;
pub mod event;
pub mod listener;
pub mod memory;
pub mod upstream;

pub use broker::{
    Broker, BrokerConfig, BrokerError, BrokerStats, RouteKey, SubscriptionState,
    DEFAULT_TOPIC_PREFIX,
};
pub use event::{Event, EventId};
pub use listener::{DeliveryPolicy, GroupKey, ListenerChannel, ListenerId, UserKey};
pub use memory::MemoryUpstream;
pub use upstream::{Upstream, UpstreamError, UpstreamFeed};
