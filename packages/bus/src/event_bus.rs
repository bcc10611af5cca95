//! Fire-and-forget pub/sub over the store.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use bus_core::Event;
use store::{Store, StoreConfig, StoreMessage, Subscriber, SubscriberConnection};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::listener::{Listener, ListenerResult};
use crate::registry::{ListenerId, ListenerRegistry, dispatch};
use crate::{BusError, BusResult};

/// Publishes events on named channels and delivers them to local listeners.
///
/// Any number of local listeners on a channel share one store-level
/// subscription, taken when the first listener arrives and dropped when the
/// last one leaves. Cloning the bus yields another handle to the same
/// subscription and registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    store: Store,
    subscriber: Box<dyn Subscriber>,
    listeners: Mutex<ListenerRegistry<Event>>,
    closing: AtomicBool,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Open the shared subscriber connection and start delivering.
    pub async fn new(store: Store) -> BusResult<Self> {
        let SubscriberConnection {
            subscriber,
            messages,
        } = store.subscriber().await?;

        let inner = Arc::new(EventBusInner {
            store,
            subscriber,
            listeners: Mutex::new(ListenerRegistry::new()),
            closing: AtomicBool::new(false),
            pump: StdMutex::new(None),
        });

        let pump = tokio::spawn(pump(Arc::downgrade(&inner), messages));
        *inner.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);

        tracing::info!("Event bus started on {} store", inner.store.kind_str());
        Ok(Self { inner })
    }

    /// Resolve `cfg` into a store and build a bus on it.
    pub async fn connect(cfg: StoreConfig) -> BusResult<Self> {
        let store = Store::new(cfg).await?;
        Self::new(store).await
    }

    /// Publish `payload` on `channel`.
    ///
    /// Publishing where nobody listens is not an error; the event is simply
    /// not delivered.
    pub async fn publish(&self, channel: &str, payload: serde_json::Value) -> BusResult<Event> {
        self.ensure_open()?;

        let event = Event::new(channel, payload);
        let receivers = self
            .inner
            .store
            .publish(channel, &event.to_json()?)
            .await?;

        tracing::debug!(channel, event = %event.event_id, receivers, "Published event");
        Ok(event)
    }

    /// Invoke `listener` for every event on `channel`.
    pub async fn subscribe<F, Fut>(&self, channel: &str, listener: F) -> BusResult<ListenerId>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        self.add(channel, Arc::new(listener), false).await
    }

    /// Invoke `listener` for the next event on `channel` only.
    pub async fn once<F, Fut>(&self, channel: &str, listener: F) -> BusResult<ListenerId>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        self.add(channel, Arc::new(listener), true).await
    }

    /// Register a listener implemented by hand rather than as a closure.
    pub async fn subscribe_listener(
        &self,
        channel: &str,
        listener: Arc<dyn Listener<Event>>,
    ) -> BusResult<ListenerId> {
        self.add(channel, listener, false).await
    }

    async fn add(
        &self,
        channel: &str,
        listener: Arc<dyn Listener<Event>>,
        once: bool,
    ) -> BusResult<ListenerId> {
        let mut listeners = self.inner.listeners.lock().await;
        self.ensure_open()?;

        let added = if once {
            listeners.add_once(channel, listener)
        } else {
            listeners.add(channel, listener)
        };

        if added.first {
            if let Err(e) = self.inner.subscriber.subscribe(channel).await {
                listeners.remove(channel, added.id);
                return Err(e.into());
            }
            tracing::debug!(channel, "Subscribed");
        }

        Ok(added.id)
    }

    /// Remove one listener. Returns false if `id` was not registered on
    /// `channel`.
    pub async fn unsubscribe(&self, channel: &str, id: ListenerId) -> BusResult<bool> {
        self.ensure_open()?;
        Ok(self.inner.remove(channel, id).await)
    }

    pub async fn listener_count(&self, channel: &str) -> usize {
        self.inner.listeners.lock().await.count(channel)
    }

    /// Channels with at least one listener.
    pub async fn channels(&self) -> Vec<String> {
        self.inner.listeners.lock().await.names()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Stop delivering, drop every listener and release the subscriber
    /// connection. Listeners already running are not awaited.
    pub async fn close(&self) -> BusResult<()> {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let pump = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }

        let channels = self.inner.listeners.lock().await.clear();
        self.inner.subscriber.close().await?;

        tracing::info!("Event bus closed, dropped listeners on {} channels", channels.len());
        Ok(())
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

impl EventBusInner {
    /// Drop a registration, releasing the store subscription with the last
    /// one. A failed unsubscribe leaves the channel subscribed with no
    /// listeners; its messages are ignored until a listener returns.
    async fn remove(&self, channel: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().await;
        let removal = listeners.remove(channel, id);

        if removal.last {
            match self.subscriber.unsubscribe(channel).await {
                Ok(()) => tracing::debug!(channel, "Unsubscribed"),
                Err(e) => tracing::warn!(channel, "Failed to unsubscribe: {}", e),
            }
        }

        removal.found
    }

    async fn deliver(&self, message: StoreMessage) {
        let StoreMessage { channel, payload } = message;

        let event = match Event::from_json(&payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(channel = %channel, "Dropping malformed event: {}", e);
                return;
            }
        };

        let registrations = self.listeners.lock().await.snapshot(&channel);
        if registrations.is_empty() {
            return;
        }

        let report = dispatch(&channel, registrations, event, |id| {
            let channel = channel.clone();
            async move {
                self.remove(&channel, id).await;
            }
        })
        .await;

        tracing::trace!(
            channel = %channel,
            delivered = report.delivered,
            failed = report.failed,
            "Dispatched event"
        );
    }
}

/// Forward inbound messages to listeners until the bus goes away.
async fn pump(bus: Weak<EventBusInner>, mut messages: mpsc::UnboundedReceiver<StoreMessage>) {
    while let Some(message) = messages.recv().await {
        let Some(inner) = bus.upgrade() else {
            break;
        };
        if inner.closing.load(Ordering::Acquire) {
            break;
        }
        inner.deliver(message).await;
    }

    tracing::debug!("Event pump stopped");
}
