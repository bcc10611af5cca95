//! Lease queue engine.
//!
//! A job lives in three places while it is in flight:
//! - its id in the ready list, then the processing list
//! - its JSON under the payload key
//! - a lock key with a TTL, the lease
//!
//! A claim atomically moves the id from ready to processing and arms the
//! lease. Completion removes all three. The sweep requeues any id in
//! processing whose lease has lapsed, which is how work abandoned by a
//! crashed consumer gets delivered again.

use std::time::Duration;

use bus_core::{Job, JobId, QueueKeys, QueueStats};
use store::{Store, StoreBackend};
use tokio::sync::watch;

use crate::{BusConfig, BusResult};

/// Store protocol for reliable queues, shared by every consumer of a bus.
#[derive(Clone)]
pub struct LeaseQueue {
    store: Store,
    config: BusConfig,
}

impl LeaseQueue {
    /// Create an engine over `store`. The config is taken as given; callers
    /// validate it first.
    pub fn new(store: Store, config: BusConfig) -> Self {
        Self { store, config }
    }

    /// The shared store handle used for every non-blocking command.
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Key names for `queue` under the configured prefix.
    pub fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.config.key_prefix, queue)
    }

    /// Store a new job and push it onto the ready list.
    ///
    /// Ids enter at the head and are claimed from the tail, so jobs are
    /// served oldest first. The lease is armed before the id becomes visible, so an id that is
    /// lost between ready and processing is still picked up by a sweep.
    pub async fn enqueue(&self, queue: &str, payload: serde_json::Value) -> BusResult<Job> {
        let keys = self.keys(queue);
        let job = Job::new(queue, payload);
        let raw = job.to_json()?;

        self.store
            .set_ex(&keys.lock(job.id), self.config.lease_ttl_secs, "")
            .await?;
        self.store.set(&keys.payload(job.id), &raw).await?;
        self.store.lpush(keys.ready(), &job.id.to_string()).await?;

        tracing::debug!(queue, job = %job.id, "Enqueued job");
        Ok(job)
    }

    /// Block on `conn` until a job is claimed or `stop` fires.
    ///
    /// Ids whose payload is gone are dropped and the wait continues. Store
    /// errors are logged and retried after `claim_retry_ms`.
    pub async fn claim_next(
        &self,
        conn: &dyn StoreBackend,
        queue: &str,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<Job> {
        let keys = self.keys(queue);

        loop {
            if *stop.borrow() {
                return None;
            }

            let popped = tokio::select! {
                biased;
                _ = stop.changed() => return None,
                popped = conn.blocking_pop_push(keys.ready(), keys.processing(), Duration::ZERO) => popped,
            };

            let claimed = match popped {
                Ok(Some(id)) => self.take_lease(conn, &keys, &id).await,
                Ok(None) => continue,
                Err(e) => Err(e.into()),
            };

            match claimed {
                Ok(Some(job)) => return Some(job),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(queue, "Claim failed, retrying: {}", e);
                    tokio::select! {
                        biased;
                        _ = stop.changed() => return None,
                        _ = tokio::time::sleep(self.config.claim_retry()) => {}
                    }
                }
            }
        }
    }

    async fn take_lease(
        &self,
        conn: &dyn StoreBackend,
        keys: &QueueKeys,
        id: &str,
    ) -> BusResult<Option<Job>> {
        conn.set_ex(&keys.lock(id), self.config.lease_ttl_secs, "")
            .await?;

        let Some(raw) = conn.get(&keys.payload(id)).await? else {
            tracing::warn!(queue = keys.name(), job = id, "Dropping job with missing payload");
            conn.lrem(keys.processing(), 1, id).await?;
            conn.del(&keys.lock(id)).await?;
            return Ok(None);
        };

        match Job::from_json(&raw) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                tracing::warn!(queue = keys.name(), job = id, "Failing job with undecodable payload: {}", e);
                conn.lrem(keys.processing(), 1, id).await?;
                conn.rpush(keys.failed(), id).await?;
                conn.del(&keys.lock(id)).await?;
                Ok(None)
            }
        }
    }

    /// Acknowledge a claimed job: drop it from processing with its payload
    /// and lease.
    pub async fn complete(&self, queue: &str, id: JobId) -> BusResult<()> {
        let keys = self.keys(queue);
        self.store.lrem(keys.processing(), 1, &id.to_string()).await?;
        self.store.del(&keys.payload(id)).await?;
        self.store.del(&keys.lock(id)).await?;
        Ok(())
    }

    /// Move a claimed job to the failed list. The payload is kept so the
    /// job can be inspected or requeued.
    pub async fn fail(&self, queue: &str, id: JobId) -> BusResult<()> {
        let keys = self.keys(queue);
        let raw_id = id.to_string();
        self.store.lrem(keys.processing(), 1, &raw_id).await?;
        self.store.rpush(keys.failed(), &raw_id).await?;
        self.store.del(&keys.lock(id)).await?;
        Ok(())
    }

    /// Requeue every processing entry whose lease has lapsed.
    ///
    /// Returns the number of jobs moved back to the ready list.
    pub async fn sweep(&self, queue: &str) -> BusResult<usize> {
        let keys = self.keys(queue);
        let in_flight = self.store.lrange(keys.processing(), 0, -1).await?;

        let mut reclaimed = 0;
        for id in in_flight {
            if self.store.get(&keys.lock(&id)).await?.is_some() {
                continue;
            }

            self.store
                .set_ex(&keys.lock(&id), self.config.lease_ttl_secs, "")
                .await?;
            if self.store.lrem(keys.processing(), 1, &id).await? == 0 {
                // Completed while we were looking.
                self.store.del(&keys.lock(&id)).await?;
                continue;
            }
            self.store.lpush(keys.ready(), &id).await?;
            tracing::info!(queue, job = %id, "Reclaimed job with expired lease");
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    /// Current length of the ready, processing and failed lists.
    pub async fn stats(&self, queue: &str) -> BusResult<QueueStats> {
        let keys = self.keys(queue);
        Ok(QueueStats {
            ready: self.store.llen(keys.ready()).await?,
            processing: self.store.llen(keys.processing()).await?,
            failed: self.store.llen(keys.failed()).await?,
        })
    }

    /// Ids on the failed list, oldest first.
    pub async fn failed(&self, queue: &str) -> BusResult<Vec<JobId>> {
        let keys = self.keys(queue);
        let ids = self.store.lrange(keys.failed(), 0, -1).await?;
        Ok(ids
            .iter()
            .filter_map(|id| JobId::parse(id).ok())
            .collect())
    }

    /// Move a failed job back to the ready list.
    ///
    /// Returns false if the id was not on the failed list.
    pub async fn requeue_failed(&self, queue: &str, id: JobId) -> BusResult<bool> {
        let keys = self.keys(queue);
        let raw_id = id.to_string();
        if self.store.lrem(keys.failed(), 1, &raw_id).await? == 0 {
            return Ok(false);
        }

        self.store
            .set_ex(&keys.lock(id), self.config.lease_ttl_secs, "")
            .await?;
        self.store.lpush(keys.ready(), &raw_id).await?;
        tracing::info!(queue, job = %id, "Requeued failed job");
        Ok(true)
    }

    /// Read a job's stored payload.
    pub async fn load(&self, queue: &str, id: JobId) -> BusResult<Option<Job>> {
        let keys = self.keys(queue);
        match self.store.get(&keys.payload(id)).await? {
            Some(raw) => Ok(Some(Job::from_json(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::BusError;
    use serde_json::json;

    fn engine() -> LeaseQueue {
        LeaseQueue::new(Store::memory(), BusConfig::default().with_key_prefix("test"))
    }

    async fn claim(engine: &LeaseQueue, queue: &str) -> Option<Job> {
        let (_stop_tx, mut stop) = watch::channel(false);
        let conn = engine.store().backend().clone();
        engine.claim_next(conn.as_ref(), queue, &mut stop).await
    }

    #[tokio::test]
    async fn claim_then_complete_leaves_nothing_behind() -> Result<(), BusError> {
        let engine = engine();
        let job = engine.enqueue("emails", json!({ "x": 1 })).await?;

        let claimed = claim(&engine, "emails").await;
        assert_eq!(claimed.as_ref().map(|j| j.id), Some(job.id));
        assert_eq!(claimed.map(|j| j.payload), Some(json!({ "x": 1 })));

        let keys = engine.keys("emails");
        let stats = engine.stats("emails").await?;
        assert_eq!((stats.ready, stats.processing), (0, 1));
        assert!(engine.store().get(&keys.lock(job.id)).await?.is_some());

        engine.complete("emails", job.id).await?;
        assert_eq!(engine.stats("emails").await?.active(), 0);
        assert_eq!(engine.store().get(&keys.payload(job.id)).await?, None);
        assert_eq!(engine.store().get(&keys.lock(job.id)).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn sweep_requeues_only_expired_leases() -> Result<(), BusError> {
        let engine = engine();
        let held = engine.enqueue("q", json!("held")).await?;
        let lost = engine.enqueue("q", json!("lost")).await?;
        claim(&engine, "q").await;
        claim(&engine, "q").await;

        let keys = engine.keys("q");
        engine.store().del(&keys.lock(lost.id)).await?;

        assert_eq!(engine.sweep("q").await?, 1);
        let stats = engine.stats("q").await?;
        assert_eq!((stats.ready, stats.processing), (1, 1));
        assert!(engine.store().get(&keys.lock(lost.id)).await?.is_some());
        assert!(engine.store().get(&keys.lock(held.id)).await?.is_some());

        let again = claim(&engine, "q").await;
        assert_eq!(again.map(|j| (j.id, j.payload)), Some((lost.id, json!("lost"))));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn lease_lapses_after_ttl() -> Result<(), BusError> {
        let engine = LeaseQueue::new(Store::memory(), BusConfig::default().with_lease_ttl_secs(5));
        engine.enqueue("q", json!(null)).await?;
        claim(&engine, "q").await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(engine.sweep("q").await?, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(engine.sweep("q").await?, 1);
        assert_eq!(engine.stats("q").await?.ready, 1);
        Ok(())
    }

    #[tokio::test]
    async fn jobs_are_claimed_oldest_first() -> Result<(), BusError> {
        let engine = engine();
        let mut enqueued = Vec::new();
        for name in ["a", "b", "c"] {
            enqueued.push(engine.enqueue("q", json!(name)).await?.id);
        }

        let mut claimed = Vec::new();
        for _ in 0..3 {
            claimed.extend(claim(&engine, "q").await.map(|j| j.id));
        }
        assert_eq!(claimed, enqueued);
        Ok(())
    }

    #[tokio::test]
    async fn reclaimed_job_goes_behind_waiting_work() -> Result<(), BusError> {
        let engine = engine();
        let lost = engine.enqueue("q", json!("lost")).await?;
        claim(&engine, "q").await;
        let waiting = engine.enqueue("q", json!("waiting")).await?;

        engine.store().del(&engine.keys("q").lock(lost.id)).await?;
        assert_eq!(engine.sweep("q").await?, 1);

        assert_eq!(claim(&engine, "q").await.map(|j| j.id), Some(waiting.id));
        assert_eq!(claim(&engine, "q").await.map(|j| j.id), Some(lost.id));
        Ok(())
    }

    #[tokio::test]
    async fn missing_payload_is_dropped_from_processing() -> Result<(), BusError> {
        let engine = engine();
        let gone = engine.enqueue("q", json!(1)).await?;
        let kept = engine.enqueue("q", json!(2)).await?;
        let keys = engine.keys("q");
        engine.store().del(&keys.payload(gone.id)).await?;

        let claimed = claim(&engine, "q").await;
        assert_eq!(claimed.map(|j| j.id), Some(kept.id));

        let in_flight = engine.store().lrange(keys.processing(), 0, -1).await?;
        assert_eq!(in_flight, vec![kept.id.to_string()]);
        assert_eq!(engine.store().get(&keys.lock(gone.id)).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn failed_jobs_can_be_requeued() -> Result<(), BusError> {
        let engine = engine();
        let job = engine.enqueue("q", json!({ "n": 3 })).await?;
        claim(&engine, "q").await;

        engine.fail("q", job.id).await?;
        assert_eq!(engine.failed("q").await?, vec![job.id]);
        assert_eq!(engine.load("q", job.id).await?.map(|j| j.payload), Some(json!({ "n": 3 })));

        assert!(engine.requeue_failed("q", job.id).await?);
        assert!(!engine.requeue_failed("q", job.id).await?);
        let stats = engine.stats("q").await?;
        assert_eq!((stats.ready, stats.failed), (1, 0));
        Ok(())
    }

    #[tokio::test]
    async fn claim_returns_none_once_stopped() {
        let engine = engine();
        let (stop_tx, mut stop) = watch::channel(false);
        let conn = engine.store().backend().clone();

        let waiter = tokio::spawn({
            let engine = engine.clone();
            async move { engine.claim_next(conn.as_ref(), "idle", &mut stop).await }
        });
        tokio::task::yield_now().await;
        let _ = stop_tx.send(true);

        assert!(waiter.await.unwrap().is_none());
    }
}
