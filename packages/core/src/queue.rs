//! Queue key namespace and statistics.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Store keys backing one named queue.
///
/// Layout, with `<p>` the namespace prefix and `<q>` the queue name:
/// - `<p><q>` ready list
/// - `<p><q>:processing` processing list
/// - `<p><q>:failed` failed list
/// - `<p><q>:<id>` job payload
/// - `<p><q>:lock:processing:<id>` lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    name: String,
    ready: String,
    processing: String,
    failed: String,
}

impl QueueKeys {
    /// Build the keys for `queue` under `prefix`.
    ///
    /// A non-empty prefix is separated from the queue name by `:`.
    pub fn new(prefix: &str, queue: &str) -> Self {
        let ready = format!("{}{}", normalize_prefix(prefix), queue);
        Self {
            name: queue.to_string(),
            processing: format!("{ready}:processing"),
            failed: format!("{ready}:failed"),
            ready,
        }
    }

    /// The logical queue name, without prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// List of ids waiting to be claimed. Pushed at the head, claimed from
    /// the tail.
    pub fn ready(&self) -> &str {
        &self.ready
    }

    /// List of ids claimed and not yet settled.
    pub fn processing(&self) -> &str {
        &self.processing
    }

    /// List of ids that could not be delivered: nobody was listening, or the
    /// payload would not decode.
    pub fn failed(&self) -> &str {
        &self.failed
    }

    /// Key holding the JSON job.
    pub fn payload(&self, id: impl fmt::Display) -> String {
        format!("{}:{}", self.ready, id)
    }

    /// Key whose presence is the job's lease.
    pub fn lock(&self, id: impl fmt::Display) -> String {
        format!("{}:lock:processing:{}", self.ready, id)
    }
}

/// Append `:` to a non-empty prefix that lacks one.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with(':') {
        prefix.to_string()
    } else {
        format!("{prefix}:")
    }
}

/// Snapshot of the list lengths of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    /// Jobs waiting to be claimed.
    pub ready: u64,
    /// Jobs currently leased to a consumer.
    pub processing: u64,
    /// Jobs that were claimed with no listener registered.
    pub failed: u64,
}

impl QueueStats {
    /// Jobs not yet completed or failed.
    pub fn active(&self) -> u64 {
        self.ready + self.processing
    }
}
