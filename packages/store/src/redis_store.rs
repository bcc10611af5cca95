//! Redis backend.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink};
use redis::{Client, cmd};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::{
    RedisConfig, StoreBackend, StoreError, StoreFuture, StoreMessage, Subscriber,
    SubscriberConnection,
};

/// Redis implementation of [`StoreBackend`].
///
/// Commands share one multiplexed connection; [`StoreBackend::dedicated`]
/// and [`StoreBackend::subscriber`] open fresh connections since a blocking
/// pop or a subscription occupies its connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, StoreError> {
        let url = cfg.connection_url()?;
        tracing::info!("Connecting to redis: {}", redact(&url));

        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

/// Strip credentials from a connection URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***{}", &url[..scheme], &url[at..])
        }
        _ => url.to_string(),
    }
}

impl StoreBackend for RedisStore {
    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn();
            let _: () = cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let value: Option<String> = cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(value)
        })
    }

    fn set_ex<'a>(&'a self, key: &'a str, ttl_secs: u64, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn();
            let _: () = cmd("SETEX")
                .arg(key)
                .arg(ttl_secs.max(1))
                .arg(value)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn();
            let removed: u64 = cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(removed > 0)
        })
    }

    fn rpush<'a>(&'a self, list: &'a str, value: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn();
            let len: u64 = cmd("RPUSH").arg(list).arg(value).query_async(&mut conn).await?;
            Ok(len)
        })
    }

    fn lpush<'a>(&'a self, list: &'a str, value: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn();
            let len: u64 = cmd("LPUSH").arg(list).arg(value).query_async(&mut conn).await?;
            Ok(len)
        })
    }

    fn lrange<'a>(&'a self, list: &'a str, start: i64, stop: i64) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let items: Vec<String> = cmd("LRANGE")
                .arg(list)
                .arg(start)
                .arg(stop)
                .query_async(&mut conn)
                .await?;
            Ok(items)
        })
    }

    fn lrem<'a>(&'a self, list: &'a str, count: i64, value: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn();
            let removed: u64 = cmd("LREM")
                .arg(list)
                .arg(count)
                .arg(value)
                .query_async(&mut conn)
                .await?;
            Ok(removed)
        })
    }

    fn llen<'a>(&'a self, list: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn();
            let len: u64 = cmd("LLEN").arg(list).query_async(&mut conn).await?;
            Ok(len)
        })
    }

    fn blocking_pop_push<'a>(
        &'a self,
        src: &'a str,
        dst: &'a str,
        timeout: Duration,
    ) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let value: Option<String> = cmd("BRPOPLPUSH")
                .arg(src)
                .arg(dst)
                .arg(timeout.as_secs_f64())
                .query_async(&mut conn)
                .await?;
            Ok(value)
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, message: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn();
            let receivers: u64 = cmd("PUBLISH")
                .arg(channel)
                .arg(message)
                .query_async(&mut conn)
                .await?;
            Ok(receivers)
        })
    }

    fn subscriber(&self) -> StoreFuture<'_, SubscriberConnection> {
        Box::pin(async move {
            let pubsub = self.client.get_async_pubsub().await?;
            let (sink, mut stream) = pubsub.split();
            let (tx, rx) = mpsc::unbounded_channel();

            let forward = tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!("Dropping undecodable pub/sub message: {}", e);
                            continue;
                        }
                    };
                    let message = StoreMessage {
                        channel: msg.get_channel_name().to_string(),
                        payload,
                    };
                    if tx.send(message).is_err() {
                        break;
                    }
                }
            });

            Ok(SubscriberConnection {
                subscriber: Box::new(RedisSubscriber {
                    sink: Mutex::new(Some(sink)),
                    forward,
                }),
                messages: rx,
            })
        })
    }

    fn dedicated(&self) -> StoreFuture<'_, Arc<dyn StoreBackend>> {
        Box::pin(async move {
            let conn = self.client.get_multiplexed_async_connection().await?;
            let store = RedisStore {
                client: self.client.clone(),
                conn,
            };
            Ok(Arc::new(store) as Arc<dyn StoreBackend>)
        })
    }
}

struct RedisSubscriber {
    sink: Mutex<Option<PubSubSink>>,
    forward: JoinHandle<()>,
}

impl Subscriber for RedisSubscriber {
    fn subscribe<'a>(&'a self, channel: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            let sink = sink.as_mut().ok_or(StoreError::Closed)?;
            sink.subscribe(channel).await?;
            Ok(())
        })
    }

    fn unsubscribe<'a>(&'a self, channel: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            let sink = sink.as_mut().ok_or(StoreError::Closed)?;
            sink.unsubscribe(channel).await?;
            Ok(())
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.sink.lock().await.take();
            self.forward.abort();
            Ok(())
        })
    }
}

impl Drop for RedisSubscriber {
    fn drop(&mut self) {
        self.forward.abort();
    }
}
