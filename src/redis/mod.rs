//! Redis connection handling and the namespace key layout.

mod queue;

pub use queue::{DequeuedJob, EnqueueOpts, JobQueue, RetryOutcome};

use crate::config::RedisConfig;
use crate::error::{Error, Result};
use chrono::NaiveDate;
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create the shared connection pool and verify the server is reachable.
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let cfg = Config::from_url(config.connection_url());

    let pool = cfg
        .builder()
        .map_err(|err| Error::Configuration(format!("invalid redis config: {err}")))?
        .max_size(config.pool_size)
        .create_timeout(Some(config.timeout()))
        .wait_timeout(Some(config.timeout()))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|err| Error::Configuration(format!("failed to create redis pool: {err}")))?;

    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!(pool_size = config.pool_size, "redis connection pool ready");

    Ok(pool)
}

/// Builder for every key in the namespace.
///
/// The suffixes are bit-exact with the established peer format so that
/// deployments in other runtimes can share a namespace.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    namespace: String,
}

impl RedisKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.namespace, suffix)
    }

    /// Set of every queue name ever subscribed or enqueued to.
    pub fn queues(&self) -> String {
        self.key("queues")
    }

    /// Ready list for one queue.
    pub fn queue(&self, name: &str) -> String {
        self.key(&format!("queue:{name}"))
    }

    /// In-flight backup list for one (host, queue).
    pub fn backup(&self, host: &str, queue: &str) -> String {
        self.key(&format!("{host}:{queue}:backup"))
    }

    /// Sorted set of jobs due at an absolute time.
    pub fn schedule(&self) -> String {
        self.key("schedule")
    }

    /// Sorted set of failed jobs awaiting a back-off retry.
    pub fn retry(&self) -> String {
        self.key("retry")
    }

    /// Capped list of terminally failed jobs.
    pub fn dead(&self) -> String {
        self.key("dead")
    }

    pub fn stat_processed(&self) -> String {
        self.key("stat:processed")
    }

    pub fn stat_failed(&self) -> String {
        self.key("stat:failed")
    }

    /// Daily UTC bucket of the processed counter.
    pub fn stat_processed_date(&self, date: NaiveDate) -> String {
        self.key(&format!("stat:processed:{}", date.format("%Y-%m-%d")))
    }

    pub fn stat_failed_date(&self, date: NaiveDate) -> String {
        self.key(&format!("stat:failed:{}", date.format("%Y-%m-%d")))
    }

    pub fn stat_processed_queue(&self, queue: &str) -> String {
        self.key(&format!("stat:processed_queues:{queue}"))
    }

    pub fn stat_failed_queue(&self, queue: &str) -> String {
        self.key(&format!("stat:failed_queues:{queue}"))
    }

    /// Set of in-flight process ids.
    pub fn processes(&self) -> String {
        self.key("processes")
    }

    /// Per-process metadata record.
    pub fn process(&self, process_id: &str) -> String {
        self.key(process_id)
    }
}
