#![allow(dead_code)]

use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bus::{Listener, ListenerResult, MemoryStore, Store, StoreBackend, StoreConfig, StoreError};
use store::{StoreFuture, Subscriber, SubscriberConnection};
use tokio::sync::{Semaphore, mpsc};

pub type TestResult = Result<(), Box<dyn Error>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Store-level subscription calls seen by a [`TestStore`].
#[derive(Default)]
pub struct Counts {
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl Counts {
    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

/// Holds the next `get` until released, so a test can act while a claim
/// is half done.
pub struct Gate {
    armed: AtomicBool,
    entered: Semaphore,
    release: Semaphore,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            armed: AtomicBool::new(false),
            entered: Semaphore::new(0),
            release: Semaphore::new(0),
        }
    }
}

impl Gate {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until a `get` is parked at the gate.
    pub async fn entered(&self) -> TestResult {
        self.entered.acquire().await?.forget();
        Ok(())
    }

    pub fn open(&self) {
        self.release.add_permits(1);
    }

    async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.add_permits(1);
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
        }
    }
}

/// Switches that make store commands fail until cleared.
#[derive(Default)]
pub struct Faults {
    claims: AtomicBool,
    sweeps: AtomicBool,
    unsubscribes: AtomicBool,
}

impl Faults {
    /// Fail every blocking move while set.
    pub fn fail_claims(&self, on: bool) {
        self.claims.store(on, Ordering::SeqCst);
    }

    /// Fail every list range read while set.
    pub fn fail_sweeps(&self, on: bool) {
        self.sweeps.store(on, Ordering::SeqCst);
    }

    /// Fail every pub/sub unsubscribe while set.
    pub fn fail_unsubscribes(&self, on: bool) {
        self.unsubscribes.store(on, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Command(format!("{what}: connection reset")));
        }
        Ok(())
    }
}

/// In-memory store that records subscription traffic, can pause reads and
/// can fail commands on demand.
#[derive(Clone, Default)]
pub struct TestStore {
    inner: MemoryStore,
    pub counts: Arc<Counts>,
    pub gate: Arc<Gate>,
    pub faults: Arc<Faults>,
}

impl TestStore {
    pub async fn store(&self) -> Result<Store, Box<dyn Error>> {
        let backend: Arc<dyn StoreBackend> = Arc::new(self.clone());
        Ok(Store::new(StoreConfig::client(backend)).await?)
    }
}

impl StoreBackend for TestStore {
    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()> {
        self.inner.set(key, value)
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            self.gate.pass().await;
            self.inner.get(key).await
        })
    }

    fn set_ex<'a>(&'a self, key: &'a str, ttl_secs: u64, value: &'a str) -> StoreFuture<'a, ()> {
        self.inner.set_ex(key, ttl_secs, value)
    }

    fn del<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        self.inner.del(key)
    }

    fn rpush<'a>(&'a self, list: &'a str, value: &'a str) -> StoreFuture<'a, u64> {
        self.inner.rpush(list, value)
    }

    fn lpush<'a>(&'a self, list: &'a str, value: &'a str) -> StoreFuture<'a, u64> {
        self.inner.lpush(list, value)
    }

    fn lrange<'a>(&'a self, list: &'a str, start: i64, stop: i64) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            Faults::check(&self.faults.sweeps, "LRANGE")?;
            self.inner.lrange(list, start, stop).await
        })
    }

    fn lrem<'a>(&'a self, list: &'a str, count: i64, value: &'a str) -> StoreFuture<'a, u64> {
        self.inner.lrem(list, count, value)
    }

    fn llen<'a>(&'a self, list: &'a str) -> StoreFuture<'a, u64> {
        self.inner.llen(list)
    }

    fn blocking_pop_push<'a>(
        &'a self,
        src: &'a str,
        dst: &'a str,
        timeout: Duration,
    ) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            Faults::check(&self.faults.claims, "BRPOPLPUSH")?;
            self.inner.blocking_pop_push(src, dst, timeout).await
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, message: &'a str) -> StoreFuture<'a, u64> {
        self.inner.publish(channel, message)
    }

    fn subscriber(&self) -> StoreFuture<'_, SubscriberConnection> {
        Box::pin(async move {
            let SubscriberConnection {
                subscriber,
                messages,
            } = self.inner.subscriber().await?;

            Ok(SubscriberConnection {
                subscriber: Box::new(CountingSubscriber {
                    inner: subscriber,
                    counts: self.counts.clone(),
                    faults: self.faults.clone(),
                }),
                messages,
            })
        })
    }

    fn dedicated(&self) -> StoreFuture<'_, Arc<dyn StoreBackend>> {
        Box::pin(async move { Ok(Arc::new(self.clone()) as Arc<dyn StoreBackend>) })
    }
}

struct CountingSubscriber {
    inner: Box<dyn Subscriber>,
    counts: Arc<Counts>,
    faults: Arc<Faults>,
}

impl Subscriber for CountingSubscriber {
    fn subscribe<'a>(&'a self, channel: &'a str) -> StoreFuture<'a, ()> {
        self.counts.subscribes.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribe(channel)
    }

    fn unsubscribe<'a>(&'a self, channel: &'a str) -> StoreFuture<'a, ()> {
        self.counts.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Faults::check(&self.faults.unsubscribes, "UNSUBSCRIBE")?;
            self.inner.unsubscribe(channel).await
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        self.inner.close()
    }
}

/// Listener that forwards every item it receives into a channel.
pub fn forward<T: Send + 'static>() -> (Arc<dyn Listener<T>>, mpsc::UnboundedReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = move |item: T| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(item);
            ListenerResult::Ok(())
        }
    };
    (Arc::new(listener), rx)
}

/// Next item from `rx`, failing the test if none arrives in time.
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Result<T, Box<dyn Error>> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .ok_or_else(|| "listener channel closed".into())
}

/// True if nothing arrives on `rx` within `wait`. A closed channel counts
/// as empty.
pub async fn stays_empty<T>(rx: &mut mpsc::UnboundedReceiver<T>, wait: Duration) -> bool {
    !matches!(tokio::time::timeout(wait, rx.recv()).await, Ok(Some(_)))
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
