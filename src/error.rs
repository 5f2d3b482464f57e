//! Crate error types.

use thiserror::Error;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the queue core.
#[derive(Debug, Error)]
pub enum Error {
    /// Redis command failed or the connection dropped.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// No connection could be checked out of the pool.
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// JSON encoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A payload was missing required fields or was not valid JSON.
    #[error("malformed job: {0}")]
    MalformedJob(String),

    /// No handler is registered for the job's class.
    #[error("no handler registered for class {0}")]
    WorkerNotFound(String),

    /// Invalid configuration or enqueue arguments.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The manager's control loop is gone.
    #[error("manager is shut down")]
    Shutdown,

    /// A manager call exceeded its timeout.
    #[error("manager call timed out after {0} ms")]
    Timeout(u64),
}

impl Error {
    /// Returns true when the error means Redis could not be reached.
    ///
    /// Dequeue loops back off and retry on these; enqueue callers see
    /// them directly.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Redis(_) | Error::Pool(_))
    }
}
