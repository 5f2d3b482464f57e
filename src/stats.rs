//! Durable statistics and the in-flight process registry.
//!
//! Counters and process records live in Redis so every node sees the same
//! totals. Writes here are best-effort observability: callers on the job
//! execution path log failures and keep going.

use crate::error::Result;
use crate::job::{now_epoch, Job};
use crate::redis::RedisKeys;
use chrono::Utc;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Registry record for one in-flight job on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_id: String,
    pub host: String,
    pub pid: u32,
    pub queue: String,
    pub started_at: f64,
    pub concurrency: String,
    pub payload: Job,
}

impl ProcessInfo {
    pub fn new(host: &str, queue: &str, concurrency: String, payload: Job) -> Self {
        let pid = std::process::id();
        Self {
            process_id: format!("{host}:{pid}:{}", Uuid::new_v4().simple()),
            host: host.to_string(),
            pid,
            queue: queue.to_string(),
            started_at: now_epoch(),
            concurrency,
            payload,
        }
    }
}

/// Writer for stat counters and process records.
#[derive(Clone)]
pub struct Stats {
    pool: Pool,
    keys: RedisKeys,
}

impl Stats {
    pub fn new(pool: Pool, namespace: &str) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(namespace),
        }
    }

    /// Bump the global, daily, and per-queue processed counters.
    pub async fn record_processed(&self, queue: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let today = Utc::now().date_naive();
        let _: () = redis::pipe()
            .incr(self.keys.stat_processed(), 1i64)
            .incr(self.keys.stat_processed_date(today), 1i64)
            .incr(self.keys.stat_processed_queue(queue), 1i64)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    /// Bump the global, daily, and per-queue failed counters.
    pub async fn record_failed(&self, queue: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let today = Utc::now().date_naive();
        let _: () = redis::pipe()
            .incr(self.keys.stat_failed(), 1i64)
            .incr(self.keys.stat_failed_date(today), 1i64)
            .incr(self.keys.stat_failed_queue(queue), 1i64)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    /// Register an in-flight job under a fresh process id.
    pub async fn add_process(&self, process: &ProcessInfo) -> Result<()> {
        let record = serde_json::to_string(process)?;
        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .sadd(self.keys.processes(), &process.process_id)
            .set(self.keys.process(&process.process_id), record)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    /// Drop a process record once its job reached a terminal outcome.
    pub async fn remove_process(&self, process_id: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .srem(self.keys.processes(), process_id)
            .del(self.keys.process(process_id))
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }
}
