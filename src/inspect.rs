//! Read-only inspection of a namespace.
//!
//! Used by tests and tooling; nothing here mutates queue state.

use crate::config::Config;
use crate::error::Result;
use crate::job::Job;
use crate::redis::{create_pool, RedisKeys};
use crate::stats::ProcessInfo;
use ::redis::AsyncCommands;
use deadpool_redis::Pool;

pub struct Inspector {
    pool: Pool,
    keys: RedisKeys,
}

impl Inspector {
    pub fn new(pool: Pool, namespace: &str) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(namespace),
        }
    }

    /// Connect with the given configuration's Redis and namespace sections.
    pub async fn connect(config: &Config) -> Result<Inspector> {
        let pool = create_pool(&config.redis).await?;
        Ok(Self::new(pool, &config.namespace))
    }

    /// Every in-flight process record across all nodes. Records that fail
    /// to decode (peer producers with a different shape) are skipped.
    pub async fn processes(&self) -> Result<Vec<ProcessInfo>> {
        let mut conn = self.pool.get().await?;
        let ids: Vec<String> = conn.smembers(self.keys.processes()).await?;

        let mut processes = Vec::with_capacity(ids.len());
        for id in ids {
            let record: Option<String> = conn.get(self.keys.process(&id)).await?;
            if let Some(raw) = record {
                if let Ok(info) = serde_json::from_str::<ProcessInfo>(&raw) {
                    processes.push(info);
                }
            }
        }
        Ok(processes)
    }

    /// Linear scan of the dead list for a jid.
    pub async fn find_failed(&self, jid: &str) -> Result<Option<Job>> {
        let mut conn = self.pool.get().await?;
        let entries: Vec<String> = conn.lrange(self.keys.dead(), 0, -1).await?;

        for raw in entries {
            if let Ok(job) = Job::decode(&raw) {
                if job.jid == jid {
                    return Ok(Some(job));
                }
            }
        }
        Ok(None)
    }

    pub async fn processed_count(&self) -> Result<u64> {
        self.counter(&self.keys.stat_processed()).await
    }

    pub async fn failed_count(&self) -> Result<u64> {
        self.counter(&self.keys.stat_failed()).await
    }

    pub async fn processed_count_for(&self, queue: &str) -> Result<u64> {
        self.counter(&self.keys.stat_processed_queue(queue)).await
    }

    pub async fn failed_count_for(&self, queue: &str) -> Result<u64> {
        self.counter(&self.keys.stat_failed_queue(queue)).await
    }

    /// Ready jobs waiting on one queue.
    pub async fn queue_size(&self, queue: &str) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        Ok(conn.llen(self.keys.queue(queue)).await?)
    }

    pub async fn scheduled_size(&self) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        Ok(conn.zcard(self.keys.schedule()).await?)
    }

    pub async fn retry_size(&self) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        Ok(conn.zcard(self.keys.retry()).await?)
    }

    pub async fn dead_size(&self) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        Ok(conn.llen(self.keys.dead()).await?)
    }

    /// Every queue name ever enqueued to or subscribed in this namespace.
    pub async fn known_queues(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.smembers(self.keys.queues()).await?)
    }

    async fn counter(&self, key: &str) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let value: Option<u64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }
}
