//! Reliable work queues with at-least-once delivery.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bus_core::{Job, JobId, QueueStats};
use store::{Store, StoreBackend, StoreConfig};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::lease::LeaseQueue;
use crate::listener::{Listener, ListenerResult};
use crate::registry::{DispatchReport, ListenerId, ListenerRegistry, dispatch};
use crate::{BusConfig, BusError, BusResult};

/// Enqueues jobs and runs one consumer per queue that has listeners.
///
/// A consumer is a claim task blocking on its own store connection plus a
/// sweep task that requeues jobs whose lease lapsed. It starts with the
/// first listener on a queue and stops with the last.
#[derive(Clone)]
pub struct QueueBus {
    inner: Arc<QueueBusInner>,
}

struct QueueBusInner {
    engine: LeaseQueue,
    state: Mutex<QueueBusState>,
    closing: AtomicBool,
}

#[derive(Default)]
struct QueueBusState {
    listeners: ListenerRegistry<Job>,
    consumers: HashMap<String, Consumer>,
}

/// Handles to the tasks serving one queue.
struct Consumer {
    stop: watch::Sender<bool>,
    sweep: JoinHandle<()>,
}

impl Consumer {
    /// The claim task finishes the job it is dispatching, if any, and exits.
    fn stop(self) {
        let _ = self.stop.send(true);
        self.sweep.abort();
    }
}

impl QueueBus {
    pub fn new(store: Store, config: BusConfig) -> BusResult<Self> {
        config.validate()?;
        tracing::info!(
            "Queue bus started on {} store, lease {}s, sweep every {}ms",
            store.kind_str(),
            config.lease_ttl_secs,
            config.sweep_interval_ms
        );

        Ok(Self {
            inner: Arc::new(QueueBusInner {
                engine: LeaseQueue::new(store, config),
                state: Mutex::new(QueueBusState::default()),
                closing: AtomicBool::new(false),
            }),
        })
    }

    /// Resolve `store` into a client and build a bus on it.
    pub async fn connect(store: StoreConfig, config: BusConfig) -> BusResult<Self> {
        config.validate()?;
        let store = Store::new(store).await?;
        Self::new(store, config)
    }

    pub fn config(&self) -> &BusConfig {
        self.inner.engine.config()
    }

    /// Add a job to the tail of `queue`.
    pub async fn enqueue(&self, queue: &str, payload: serde_json::Value) -> BusResult<JobId> {
        self.ensure_open()?;
        let job = self.inner.engine.enqueue(queue, payload).await?;
        Ok(job.id)
    }

    /// Invoke `listener` for every job claimed from `queue`.
    pub async fn on_dequeue<F, Fut>(&self, queue: &str, listener: F) -> BusResult<ListenerId>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        self.add(queue, Arc::new(listener), false).await
    }

    /// Invoke `listener` for the next job claimed from `queue` only.
    pub async fn once<F, Fut>(&self, queue: &str, listener: F) -> BusResult<ListenerId>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        self.add(queue, Arc::new(listener), true).await
    }

    /// Register a listener implemented by hand rather than as a closure.
    pub async fn on_dequeue_listener(
        &self,
        queue: &str,
        listener: Arc<dyn Listener<Job>>,
    ) -> BusResult<ListenerId> {
        self.add(queue, listener, false).await
    }

    async fn add(
        &self,
        queue: &str,
        listener: Arc<dyn Listener<Job>>,
        once: bool,
    ) -> BusResult<ListenerId> {
        let mut state = self.inner.state.lock().await;
        self.ensure_open()?;

        let added = if once {
            state.listeners.add_once(queue, listener)
        } else {
            state.listeners.add(queue, listener)
        };

        if added.first {
            match self.inner.start_consumer(queue).await {
                Ok(consumer) => {
                    state.consumers.insert(queue.to_string(), consumer);
                }
                Err(e) => {
                    state.listeners.remove(queue, added.id);
                    return Err(e);
                }
            }
        }

        Ok(added.id)
    }

    /// Remove one listener. Returns false if `id` was not registered on
    /// `queue`.
    pub async fn remove_listener(&self, queue: &str, id: ListenerId) -> BusResult<bool> {
        self.ensure_open()?;
        Ok(self.inner.remove(queue, id).await)
    }

    pub async fn listener_count(&self, queue: &str) -> usize {
        self.inner.state.lock().await.listeners.count(queue)
    }

    pub async fn stats(&self, queue: &str) -> BusResult<QueueStats> {
        self.inner.engine.stats(queue).await
    }

    /// Ids of jobs that were claimed while no listener was registered.
    pub async fn failed(&self, queue: &str) -> BusResult<Vec<JobId>> {
        self.inner.engine.failed(queue).await
    }

    pub async fn requeue_failed(&self, queue: &str, id: JobId) -> BusResult<bool> {
        self.ensure_open()?;
        self.inner.engine.requeue_failed(queue, id).await
    }

    /// Run one sweep pass now instead of waiting for the timer.
    pub async fn sweep(&self, queue: &str) -> BusResult<usize> {
        self.ensure_open()?;
        self.inner.engine.sweep(queue).await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Stop every consumer and drop every listener.
    ///
    /// Jobs being dispatched are not awaited; any left in processing are
    /// reclaimed by a sweep once their lease lapses.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.inner.state.lock().await;
        let consumers = state.consumers.len();
        for (_, consumer) in state.consumers.drain() {
            consumer.stop();
        }
        state.listeners.clear();

        tracing::info!("Queue bus closed, stopped {} consumers", consumers);
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

impl QueueBusInner {
    async fn start_consumer(self: &Arc<Self>, queue: &str) -> BusResult<Consumer> {
        let conn = self.engine.store().dedicated().await?;
        let (stop, stop_rx) = watch::channel(false);

        tokio::spawn(claim_loop(
            Arc::downgrade(self),
            self.engine.clone(),
            conn,
            queue.to_string(),
            stop_rx.clone(),
        ));
        let sweep = tokio::spawn(sweep_loop(self.engine.clone(), queue.to_string(), stop_rx));

        tracing::info!("Starting consumer: {}", queue);
        Ok(Consumer { stop, sweep })
    }

    async fn remove(&self, queue: &str, id: ListenerId) -> bool {
        let mut state = self.state.lock().await;
        let removal = state.listeners.remove(queue, id);

        if removal.last {
            if let Some(consumer) = state.consumers.remove(queue) {
                tracing::info!("Stopping consumer: {}", queue);
                consumer.stop();
            }
        }

        removal.found
    }

    /// Hand a claimed job to the listeners, then settle it.
    async fn deliver(&self, queue: &str, job: Job) {
        let id = job.id;
        let registrations = self.state.lock().await.listeners.snapshot(queue);

        let report = if registrations.is_empty() {
            DispatchReport::default()
        } else {
            dispatch(queue, registrations, job, |listener| async move {
                self.remove(queue, listener).await;
            })
            .await
        };

        let settled = if report.invoked() == 0 {
            tracing::warn!(queue, job = %id, "No listener for job, moving to failed list");
            self.engine.fail(queue, id).await
        } else {
            tracing::debug!(queue, job = %id, failed = report.failed, "Completed job");
            self.engine.complete(queue, id).await
        };

        if let Err(e) = settled {
            tracing::error!(queue, job = %id, "Failed to settle job: {}", e);
        }
    }
}

/// Claim and deliver jobs one at a time until stopped.
async fn claim_loop(
    bus: Weak<QueueBusInner>,
    engine: LeaseQueue,
    conn: Arc<dyn StoreBackend>,
    queue: String,
    mut stop: watch::Receiver<bool>,
) {
    while let Some(job) = engine.claim_next(conn.as_ref(), &queue, &mut stop).await {
        let Some(inner) = bus.upgrade() else {
            break;
        };
        if inner.closing.load(Ordering::Acquire) {
            break;
        }

        tracing::debug!(queue = %queue, job = %job.id, "Claimed job");
        inner.deliver(&queue, job).await;
    }

    tracing::info!("Consumer stopped: {}", queue);
}

/// Requeue abandoned jobs every sweep interval until stopped.
async fn sweep_loop(engine: LeaseQueue, queue: String, mut stop: watch::Receiver<bool>) {
    let period = engine.config().sweep_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        match engine.sweep(&queue).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Sweep requeued {} jobs on {}", n, queue),
            Err(e) => tracing::warn!(queue = %queue, "Sweep failed, retrying next interval: {}", e),
        }
    }
}
