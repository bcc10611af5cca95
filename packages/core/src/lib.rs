//! Core domain types shared by the store and the bus.
//!
//! This crate contains:
//! - Job and JobId for work items on a lease queue
//! - Event and EventId for pub/sub messages
//! - QueueKeys for the store key namespace of a queue

mod events;
mod job;
mod queue;

pub use events::{Event, EventId};
pub use job::{Job, JobId};
pub use queue::{QueueKeys, QueueStats, normalize_prefix};
