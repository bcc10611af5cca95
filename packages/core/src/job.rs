//! Job domain types for work items on a lease queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work delivered at least once to a queue listener.
///
/// The job is stored as JSON under its payload key from enqueue until it is
/// completed. Its identity is `id`; `payload` is opaque to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier assigned at enqueue time.
    pub id: JobId,
    /// Name of the queue the job was enqueued on.
    pub queue: String,
    /// Caller supplied payload.
    pub payload: serde_json::Value,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job with a fresh id.
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }

    /// Encode the job as stored under its payload key.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a job previously written with [`Job::to_json`].
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
