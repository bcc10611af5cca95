//! Listener registry with reference counting per name.
//!
//! The registry never talks to the store itself. It reports count
//! transitions (`first` on add, `last` on remove) and the owning bus turns
//! them into subscribe/unsubscribe calls or consumer start/stop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ulid::Ulid;

use crate::listener::{Listener, invoke};

/// Handle identifying one registration, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Ulid);

impl ListenerId {
    fn new() -> Self {
        Self(Ulid::new())
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Adapter that lets its delegate run at most once.
///
/// Whoever flips `fired` first owns the single invocation; every other
/// dispatch sees it already fired and skips it.
pub struct OnceListener<T> {
    fired: AtomicBool,
    delegate: Arc<dyn Listener<T>>,
}

impl<T> OnceListener<T> {
    pub fn new(delegate: Arc<dyn Listener<T>>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            delegate,
        }
    }

    /// Claim the single invocation. Returns false if already claimed.
    pub fn try_fire(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }
}

enum Slot<T> {
    Every(Arc<dyn Listener<T>>),
    Once(Arc<OnceListener<T>>),
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        match self {
            Slot::Every(l) => Slot::Every(l.clone()),
            Slot::Once(l) => Slot::Once(l.clone()),
        }
    }
}

/// One listener registered on a name.
pub struct Registration<T> {
    id: ListenerId,
    slot: Slot<T>,
}

impl<T> Clone for Registration<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            slot: self.slot.clone(),
        }
    }
}

/// Outcome of [`ListenerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Added {
    pub id: ListenerId,
    /// The name had no listeners before this one.
    pub first: bool,
}

/// Outcome of [`ListenerRegistry::remove`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removal {
    /// A registration with the id existed.
    pub found: bool,
    /// The name has no listeners left.
    pub last: bool,
}

/// Per-name listener lists, owned by one bus instance.
pub struct ListenerRegistry<T> {
    listeners: HashMap<String, Vec<Registration<T>>>,
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ListenerRegistry<T> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
        }
    }

    /// Register a listener invoked for every delivery on `name`.
    pub fn add(&mut self, name: &str, listener: Arc<dyn Listener<T>>) -> Added {
        self.insert(name, Slot::Every(listener))
    }

    /// Register a listener invoked for at most one delivery on `name`.
    pub fn add_once(&mut self, name: &str, listener: Arc<dyn Listener<T>>) -> Added {
        self.insert(name, Slot::Once(Arc::new(OnceListener::new(listener))))
    }

    fn insert(&mut self, name: &str, slot: Slot<T>) -> Added {
        let id = ListenerId::new();
        let list = self.listeners.entry(name.to_string()).or_default();
        let first = list.is_empty();
        list.push(Registration { id, slot });
        Added { id, first }
    }

    /// Remove the registration `id` from `name`.
    pub fn remove(&mut self, name: &str, id: ListenerId) -> Removal {
        let Some(list) = self.listeners.get_mut(name) else {
            return Removal::default();
        };
        let Some(pos) = list.iter().position(|r| r.id == id) else {
            return Removal::default();
        };

        list.remove(pos);
        let last = list.is_empty();
        if last {
            self.listeners.remove(name);
        }
        Removal { found: true, last }
    }

    /// Registrations for `name` in registration order.
    pub fn snapshot(&self, name: &str) -> Vec<Registration<T>> {
        self.listeners.get(name).cloned().unwrap_or_default()
    }

    /// Number of listeners currently registered on `name`.
    pub fn count(&self, name: &str) -> usize {
        self.listeners.get(name).map_or(0, Vec::len)
    }

    /// Names with at least one listener, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.listeners.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Drop every registration, returning the names that had listeners.
    pub fn clear(&mut self) -> Vec<String> {
        self.listeners.drain().map(|(name, _)| name).collect()
    }
}

/// Tally of one dispatch round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that completed without error.
    pub delivered: usize,
    /// Listeners that returned an error or panicked.
    pub failed: usize,
    /// Once-listeners that had already fired elsewhere.
    pub skipped: usize,
}

impl DispatchReport {
    /// Number of listeners actually invoked.
    pub fn invoked(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Invoke every registration in order, awaiting each one.
///
/// A failing listener is logged and does not stop the others. A once
/// registration is handed to `deregister` before its delegate runs.
pub async fn dispatch<T, F, Fut>(
    name: &str,
    registrations: Vec<Registration<T>>,
    item: T,
    mut deregister: F,
) -> DispatchReport
where
    T: Clone + Send + 'static,
    F: FnMut(ListenerId) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut report = DispatchReport::default();

    for registration in registrations {
        let listener = match &registration.slot {
            Slot::Every(listener) => listener.clone(),
            Slot::Once(once) => {
                if !once.try_fire() {
                    report.skipped += 1;
                    continue;
                }
                deregister(registration.id).await;
                once.delegate.clone()
            }
        };

        match invoke(listener, item.clone()).await {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                tracing::error!(name, listener = %registration.id, "Listener failed: {}", e);
                report.failed += 1;
            }
        }
    }

    report
}
