//! Event types delivered over pub/sub channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier stamped on every published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Ulid);

impl EventId {
    /// Create a new unique event ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fire-and-forget message published on a channel.
///
/// Events are not persisted; they reach only the listeners subscribed at
/// the time of publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Channel the event was published on.
    pub channel: String,
    /// Caller supplied payload.
    pub payload: serde_json::Value,
    /// Identifier stamped at publish time.
    pub event_id: EventId,
    /// When the event was published.
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    /// Stamp a new event for `channel`.
    pub fn new(channel: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
            event_id: EventId::new(),
            emitted_at: Utc::now(),
        }
    }

    /// Wire encoding used on the store's channels.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode an event received from a channel.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
