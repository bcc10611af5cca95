//! In-process store backend.
//!
//! Mirrors the semantics of the Redis commands the bus relies on closely
//! enough for tests and single-process deployments. Expiry uses
//! `tokio::time::Instant`, so paused-clock tests can advance past a TTL.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use crate::{
    StoreBackend, StoreError, StoreFuture, StoreMessage, Subscriber, SubscriberConnection,
};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

struct SubscriberSlot {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<StoreMessage>,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    subscribers: HashMap<u64, SubscriberSlot>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    /// Woken whenever an element is pushed onto any list.
    pushed: Notify,
    next_subscriber: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory implementation of [`StoreBackend`].
///
/// Clones share the same data, so a clone plays the role of another
/// connection to the same server.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channels with at least one subscriber.
    pub fn subscribed_channels(&self) -> usize {
        let state = self.inner.lock();
        let channels: HashSet<&String> = state
            .subscribers
            .values()
            .flat_map(|slot| slot.channels.iter())
            .collect();
        channels.len()
    }

    fn push(&self, list: &str, value: &str, push: fn(&mut VecDeque<String>, String)) -> u64 {
        let len = {
            let mut state = self.inner.lock();
            let items = state.lists.entry(list.to_string()).or_default();
            push(items, value.to_string());
            items.len() as u64
        };
        self.inner.pushed.notify_waiters();
        len
    }

    fn try_pop_push(&self, src: &str, dst: &str) -> Option<String> {
        let mut state = self.inner.lock();
        let list = state.lists.get_mut(src)?;
        let value = list.pop_back()?;
        if list.is_empty() {
            state.lists.remove(src);
        }
        state
            .lists
            .entry(dst.to_string())
            .or_default()
            .push_front(value.clone());
        Some(value)
    }

    async fn wait_pop_push(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            // Register interest before checking so a push in between is not missed.
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop_push(src, dst) {
                return Ok(Some(value));
            }

            match deadline {
                None => notified.await,
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Resolve Redis style inclusive indexes against a list of `len` items.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

impl StoreBackend for MemoryStore {
    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.inner.lock().strings.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut state = self.inner.lock();
            let found = state
                .strings
                .get(key)
                .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
            match found {
                Some(Some(value)) => Ok(Some(value)),
                Some(None) => {
                    state.strings.remove(key);
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }

    fn set_ex<'a>(&'a self, key: &'a str, ttl_secs: u64, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let expires_at = Instant::now()
                .checked_add(Duration::from_secs(ttl_secs))
                .ok_or_else(|| StoreError::Command(format!("ttl out of range: {ttl_secs}s")))?;
            self.inner.lock().strings.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(expires_at),
                },
            );
            Ok(())
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let now = Instant::now();
            let mut state = self.inner.lock();
            let string = state.strings.remove(key).is_some_and(|e| e.is_live(now));
            let list = state.lists.remove(key).is_some();
            Ok(string || list)
        })
    }

    fn rpush<'a>(&'a self, list: &'a str, value: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move { Ok(self.push(list, value, VecDeque::push_back)) })
    }

    fn lpush<'a>(&'a self, list: &'a str, value: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move { Ok(self.push(list, value, VecDeque::push_front)) })
    }

    fn lrange<'a>(&'a self, list: &'a str, start: i64, stop: i64) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let state = self.inner.lock();
            let Some(items) = state.lists.get(list) else {
                return Ok(Vec::new());
            };
            Ok(match resolve_range(items.len(), start, stop) {
                Some((from, to)) => items.range(from..=to).cloned().collect(),
                None => Vec::new(),
            })
        })
    }

    fn lrem<'a>(&'a self, list: &'a str, count: i64, value: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut state = self.inner.lock();
            let Some(items) = state.lists.get_mut(list) else {
                return Ok(0);
            };

            let limit = if count == 0 {
                usize::MAX
            } else {
                count.unsigned_abs() as usize
            };
            let mut removed = 0usize;

            if count >= 0 {
                let mut i = 0;
                while i < items.len() && removed < limit {
                    if items[i] == value {
                        items.remove(i);
                        removed += 1;
                    } else {
                        i += 1;
                    }
                }
            } else {
                let mut i = items.len();
                while i > 0 && removed < limit {
                    i -= 1;
                    if items[i] == value {
                        items.remove(i);
                        removed += 1;
                    }
                }
            }

            if items.is_empty() {
                state.lists.remove(list);
            }
            Ok(removed as u64)
        })
    }

    fn llen<'a>(&'a self, list: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let state = self.inner.lock();
            Ok(state.lists.get(list).map_or(0, |items| items.len() as u64))
        })
    }

    fn blocking_pop_push<'a>(
        &'a self,
        src: &'a str,
        dst: &'a str,
        timeout: Duration,
    ) -> StoreFuture<'a, Option<String>> {
        Box::pin(self.wait_pop_push(src, dst, timeout))
    }

    fn publish<'a>(&'a self, channel: &'a str, message: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut state = self.inner.lock();
            let mut delivered = 0;
            state.subscribers.retain(|_, slot| {
                if !slot.channels.contains(channel) {
                    return true;
                }
                let sent = slot.tx.send(StoreMessage {
                    channel: channel.to_string(),
                    payload: message.to_string(),
                });
                if sent.is_ok() {
                    delivered += 1;
                }
                sent.is_ok()
            });
            Ok(delivered)
        })
    }

    fn subscriber(&self) -> StoreFuture<'_, SubscriberConnection> {
        Box::pin(async move {
            let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::unbounded_channel();
            self.inner.lock().subscribers.insert(
                id,
                SubscriberSlot {
                    channels: HashSet::new(),
                    tx,
                },
            );

            Ok(SubscriberConnection {
                subscriber: Box::new(MemorySubscriber {
                    id,
                    inner: self.inner.clone(),
                }),
                messages: rx,
            })
        })
    }

    fn dedicated(&self) -> StoreFuture<'_, Arc<dyn StoreBackend>> {
        Box::pin(async move { Ok(Arc::new(self.clone()) as Arc<dyn StoreBackend>) })
    }
}

/// Pub/sub connection handed out by [`MemoryStore::subscriber`].
struct MemorySubscriber {
    id: u64,
    inner: Arc<Inner>,
}

impl MemorySubscriber {
    fn with_slot<T>(&self, f: impl FnOnce(&mut SubscriberSlot) -> T) -> Result<T, StoreError> {
        let mut state = self.inner.lock();
        state
            .subscribers
            .get_mut(&self.id)
            .map(f)
            .ok_or(StoreError::Closed)
    }
}

impl Subscriber for MemorySubscriber {
    fn subscribe<'a>(&'a self, channel: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_slot(|slot| {
                slot.channels.insert(channel.to_string());
            })
        })
    }

    fn unsubscribe<'a>(&'a self, channel: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_slot(|slot| {
                slot.channels.remove(channel);
            })
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.inner.lock().subscribers.remove(&self.id);
            Ok(())
        })
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        self.inner.lock().subscribers.remove(&self.id);
    }
}
