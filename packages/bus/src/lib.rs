//! Store-backed event bus and reliable work queue.
//!
//! This crate provides two independent facilities sharing one store:
//!
//! - `EventBus` - fire-and-forget pub/sub; every listener on a channel
//!   receives every event published while it is registered
//! - `QueueBus` - named queues where each job goes to one consumer, is
//!   leased while processed, and is redelivered if the lease lapses
//!
//! # Usage
//!
//! ```ignore
//! use bus::{BusConfig, EventBus, QueueBus, Store};
//!
//! let store = Store::memory();
//!
//! let events = EventBus::new(store.clone()).await?;
//! events.subscribe("user.created", |event| async move {
//!     println!("{}", event.payload);
//!     Ok(())
//! }).await?;
//! events.publish("user.created", json!({ "id": 7 })).await?;
//!
//! let queues = QueueBus::new(store, BusConfig::default())?;
//! queues.on_dequeue("emails", |job| async move {
//!     send(job.payload).await?;
//!     Ok(())
//! }).await?;
//! queues.enqueue("emails", json!({ "to": "a@b.c" })).await?;
//! ```

mod config;
mod error;
mod event_bus;
mod lease;
mod listener;
mod queue_bus;
pub mod registry;

pub use config::{BusConfig, MAX_CONFIG_SECS};
pub use error::{BusError, BusResult};
pub use event_bus::EventBus;
pub use lease::LeaseQueue;
pub use listener::{Listener, ListenerError, ListenerFailure, ListenerFuture, ListenerResult};
pub use queue_bus::QueueBus;
pub use registry::{DispatchReport, ListenerId, ListenerRegistry};

/// Re-export the domain and store types callers need.
pub use bus_core::{Event, EventId, Job, JobId, QueueKeys, QueueStats};
pub use store::{MemoryStore, RedisConfig, Store, StoreBackend, StoreConfig, StoreError, StoreKind};
