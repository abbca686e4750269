//! Events delivered to listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tribe_protocol::Record;

use crate::listener::GroupKey;

/// A unique event identifier.
pub type EventId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique, increasing event ID.
#[must_use]
pub fn generate_event_id() -> EventId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// An outbound payload, shared between every listener it is fanned out to.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event identifier.
    pub id: EventId,
    /// Group the event was published to, if any.
    pub group: Option<GroupKey>,
    /// Record variant name, if the event carries a decoded record.
    pub kind: Option<&'static str>,
    /// Serialized payload (shared for zero-copy fan-out).
    pub data: Arc<str>,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: u64,
}

impl Event {
    /// Create an event from an already serialized payload.
    #[must_use]
    pub fn new(data: impl Into<Arc<str>>) -> Self {
        Self {
            id: generate_event_id(),
            group: None,
            kind: None,
            data: data.into(),
            timestamp: now_millis(),
        }
    }

    /// Create an event carrying the JSON form of a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized.
    pub fn from_record(record: &Record) -> Result<Self, serde_json::Error> {
        let mut event = Self::new(record.to_json()?);
        event.kind = Some(record.name());
        Ok(event)
    }

    /// Tag the event with its group.
    #[must_use]
    pub fn with_group(mut self, group: GroupKey) -> Self {
        self.group = Some(group);
        self
    }

    /// The payload text.
    #[must_use]
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }
}
