//! Store client facade used by the event bus and the lease queue.
//!
//! The bus only needs a handful of primitives from its backing store:
//! plain keys, keys with a TTL, lists with an atomic blocking move, and
//! publish/subscribe channels. Any backend providing them can sit behind
//! [`StoreBackend`]:
//! - Redis in production (`redis` feature)
//! - In-process memory for tests and single-process use
//! - A caller supplied client

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid store config: {0}")]
    InvalidConfig(String),

    #[error("store connection closed")]
    Closed,

    #[error("store command failed: {0}")]
    Command(String),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Future type returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Primitive operations of the backing store.
///
/// Every call is a single round trip; nothing is batched or cached on the
/// client side, so writes are visible to every other client immediately.
pub trait StoreBackend: Send + Sync + 'static {
    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()>;

    /// Returns `None` for an absent or expired key.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Set a key that deletes itself after `ttl_secs`.
    fn set_ex<'a>(&'a self, key: &'a str, ttl_secs: u64, value: &'a str) -> StoreFuture<'a, ()>;

    /// Returns whether the key existed.
    fn del<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Append to the tail, returning the new length.
    fn rpush<'a>(&'a self, list: &'a str, value: &'a str) -> StoreFuture<'a, u64>;

    /// Prepend to the head, returning the new length.
    fn lpush<'a>(&'a self, list: &'a str, value: &'a str) -> StoreFuture<'a, u64>;

    /// Inclusive range; negative indexes count from the tail.
    fn lrange<'a>(&'a self, list: &'a str, start: i64, stop: i64) -> StoreFuture<'a, Vec<String>>;

    /// Remove up to `count` occurrences of `value`: from the head when
    /// positive, from the tail when negative, all of them when zero.
    fn lrem<'a>(&'a self, list: &'a str, count: i64, value: &'a str) -> StoreFuture<'a, u64>;

    fn llen<'a>(&'a self, list: &'a str) -> StoreFuture<'a, u64>;

    /// Atomically pop the tail of `src` and push it onto the head of `dst`.
    ///
    /// Waits until an element is available or `timeout` elapses; a zero
    /// timeout waits forever.
    fn blocking_pop_push<'a>(
        &'a self,
        src: &'a str,
        dst: &'a str,
        timeout: Duration,
    ) -> StoreFuture<'a, Option<String>>;

    /// Returns the number of subscribers that received the message.
    fn publish<'a>(&'a self, channel: &'a str, message: &'a str) -> StoreFuture<'a, u64>;

    /// Open a dedicated pub/sub connection.
    fn subscriber(&self) -> StoreFuture<'_, SubscriberConnection>;

    /// Open a dedicated connection for blocking calls.
    fn dedicated(&self) -> StoreFuture<'_, Arc<dyn StoreBackend>>;
}

/// The command side of a pub/sub connection.
pub trait Subscriber: Send + Sync {
    fn subscribe<'a>(&'a self, channel: &'a str) -> StoreFuture<'a, ()>;

    fn unsubscribe<'a>(&'a self, channel: &'a str) -> StoreFuture<'a, ()>;

    /// Release the connection. The message receiver ends afterwards.
    fn close(&self) -> StoreFuture<'_, ()>;
}

/// A dedicated pub/sub connection and the stream of messages it receives.
pub struct SubscriberConnection {
    pub subscriber: Box<dyn Subscriber>,
    pub messages: mpsc::UnboundedReceiver<StoreMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Redis,
    Client,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Redis => "redis",
            StoreKind::Client => "client",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    /// Full connection URL; takes precedence over host/port/db.
    pub url: Option<String>,
}

impl RedisConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            db: 0,
            url: None,
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// Validated connection URL.
    pub fn connection_url(&self) -> Result<String, StoreError> {
        if let Some(url) = self.url.as_deref() {
            let url = url.trim();
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                return Err(StoreError::InvalidConfig(format!(
                    "redis url must start with redis:// or rediss://, got {url:?}"
                )));
            }
            return Ok(url.to_string());
        }

        if self.host.trim().is_empty() {
            return Err(StoreError::InvalidConfig("redis host is required".into()));
        }
        if self.port == 0 {
            return Err(StoreError::InvalidConfig("redis port is required".into()));
        }

        Ok(format!("redis://{}:{}/{}", self.host.trim(), self.port, self.db))
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 6379)
    }
}

/// How to reach the backing store.
#[derive(Clone)]
pub enum StoreConfig {
    Memory,
    Redis(RedisConfig),
    /// An already constructed client.
    Client(Arc<dyn StoreBackend>),
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreConfig::Memory => f.write_str("Memory"),
            StoreConfig::Redis(cfg) => f.debug_tuple("Redis").field(cfg).finish(),
            StoreConfig::Client(_) => f.write_str("Client(..)"),
        }
    }
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn redis(cfg: RedisConfig) -> Self {
        Self::Redis(cfg)
    }

    pub fn client(backend: Arc<dyn StoreBackend>) -> Self {
        Self::Client(backend)
    }

    /// Build a config from environment variables.
    ///
    /// Selection rules:
    /// - `STORE_BACKEND`: `memory` (default) or `redis`
    ///
    /// Redis env vars:
    /// - `REDIS_URL` (takes precedence when set)
    /// - `REDIS_HOST` (default: `127.0.0.1`)
    /// - `REDIS_PORT` (default: `6379`)
    /// - `REDIS_DB` (default: `0`)
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading variables through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, StoreError> {
        let backend = var("STORE_BACKEND").and_then(non_empty);

        match backend.as_deref() {
            None | Some("memory") | Some("mem") => Ok(Self::memory()),
            Some("redis") => Ok(Self::redis(read_redis_config(&var)?)),
            Some(other) => Err(StoreError::InvalidConfig(format!(
                "unsupported STORE_BACKEND={other} (expected memory|redis)"
            ))),
        }
    }
}

/// Normalized handle to the backing store.
///
/// Cheap to clone; every clone shares the same underlying client.
#[derive(Clone)]
pub struct Store {
    kind: StoreKind,
    backend: Arc<dyn StoreBackend>,
}

impl Store {
    pub async fn new(cfg: StoreConfig) -> Result<Self, StoreError> {
        let (kind, backend): (StoreKind, Arc<dyn StoreBackend>) = match cfg {
            StoreConfig::Memory => (StoreKind::Memory, Arc::new(MemoryStore::new())),
            StoreConfig::Redis(redis_cfg) => (StoreKind::Redis, connect_redis(&redis_cfg).await?),
            StoreConfig::Client(backend) => (StoreKind::Client, backend),
        };

        tracing::debug!("Store ready: {}", kind.as_str());
        Ok(Self { kind, backend })
    }

    pub async fn from_env() -> Result<Self, StoreError> {
        Self::new(StoreConfig::from_env()?).await
    }

    /// In-process store, mainly for tests.
    pub fn memory() -> Self {
        Self {
            kind: StoreKind::Memory,
            backend: Arc::new(MemoryStore::new()),
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn kind_str(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }
}

impl Deref for Store {
    type Target = dyn StoreBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(cfg: &RedisConfig) -> Result<Arc<dyn StoreBackend>, StoreError> {
    let store = RedisStore::connect(cfg).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(cfg: &RedisConfig) -> Result<Arc<dyn StoreBackend>, StoreError> {
    cfg.connection_url()?;
    Err(StoreError::InvalidConfig(
        "redis backend not compiled in (enable the `redis` feature)".into(),
    ))
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn read_redis_config(var: &impl Fn(&str) -> Option<String>) -> Result<RedisConfig, StoreError> {
    if let Some(url) = var("REDIS_URL").and_then(non_empty) {
        return Ok(RedisConfig::from_url(url));
    }

    let host = var("REDIS_HOST")
        .and_then(non_empty)
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let port = match var("REDIS_PORT").and_then(non_empty) {
        Some(v) => v
            .parse::<u16>()
            .map_err(|e| StoreError::InvalidConfig(format!("invalid REDIS_PORT={v}: {e}")))?,
        None => 6379,
    };

    let db = match var("REDIS_DB").and_then(non_empty) {
        Some(v) => v
            .parse::<i64>()
            .map_err(|e| StoreError::InvalidConfig(format!("invalid REDIS_DB={v}: {e}")))?,
        None => 0,
    };

    Ok(RedisConfig::new(host, port).with_db(db))
}
