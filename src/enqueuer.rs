//! Standalone enqueue surface.
//!
//! Producers that never process jobs don't need a manager: an [`Enqueuer`]
//! shares nothing with consumers except Redis, with semantics identical to
//! the manager's enqueue operations.

use crate::config::Config;
use crate::error::Result;
use crate::metrics::JobMetrics;
use crate::redis::{create_pool, JobQueue};
use serde_json::Value;

#[derive(Clone)]
pub struct Enqueuer {
    queue: JobQueue,
}

impl Enqueuer {
    /// Connect with the given configuration. Only the Redis and namespace
    /// sections are consulted.
    pub async fn connect(config: &Config) -> Result<Enqueuer> {
        let pool = create_pool(&config.redis).await?;
        Ok(Self {
            queue: JobQueue::new(
                pool,
                &config.namespace,
                config.max_retries,
                config.dead_max_jobs,
            ),
        })
    }

    /// Enqueue for immediate delivery. Returns the generated jid.
    pub async fn enqueue(&self, queue: &str, class: &str, args: Vec<Value>) -> Result<String> {
        let jid = self.queue.enqueue(queue, class, args).await?;
        JobMetrics::enqueued(queue);
        Ok(jid)
    }

    /// Enqueue for delivery `offset` seconds from now. A scheduler must be
    /// polling this namespace for the job to be promoted.
    pub async fn enqueue_in(
        &self,
        queue: &str,
        offset: f64,
        class: &str,
        args: Vec<Value>,
    ) -> Result<String> {
        let jid = self.queue.enqueue_in(queue, offset, class, args).await?;
        JobMetrics::enqueued(queue);
        Ok(jid)
    }

    /// Enqueue for delivery at an absolute epoch time.
    pub async fn enqueue_at(
        &self,
        queue: &str,
        at: f64,
        class: &str,
        args: Vec<Value>,
    ) -> Result<String> {
        let jid = self.queue.enqueue_at(queue, at, class, args).await?;
        JobMetrics::enqueued(queue);
        Ok(jid)
    }
}
