//! toil - Redis-backed background job processing
//!
//! A job queue core wire-compatible with the established Sidekiq payload
//! and key layout, so producers and consumers in other runtimes can share
//! a namespace. It provides:
//!
//! - Durable enqueue: immediate, delayed-by-interval, or at-absolute-time
//! - Per-queue worker pools with concurrency bounds and FIFO dequeue
//! - An atomic dequeue-to-backup move giving at-least-once delivery
//! - Boot recovery that re-delivers jobs stranded by a crash
//! - A scheduler promoting due jobs from the schedule and retry sets
//! - Retries with the ecosystem back-off curve, then a capped dead list
//! - Per-queue and global statistics plus an in-flight process registry
//!
//! # Architecture
//!
//! ```text
//!  Enqueuer / Manager ──► queue:<name> lists ──► per-queue WorkerPool
//!                             ▲    │ LMOVE            │
//!        schedule / retry ────┘    ▼                  ▼
//!        (scheduler sweep)   <host>:<q>:backup   handler registry
//!                             (crash recovery)   success │ failure
//!                                                 stats  │ retry/dead
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use toil::{Config, HandlerRegistry, Manager};
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register_fn("Mailer", |job| async move {
//!     println!("delivering with args {:?}", job.args);
//!     Ok(())
//! });
//!
//! let manager = Manager::start(Config::default(), registry).await?;
//! let jid = manager.enqueue("default", "Mailer", vec![]).await?;
//! manager.shutdown().await;
//! ```

pub mod config;
pub mod enqueuer;
pub mod error;
pub mod inspect;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod redis;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod worker;

pub use config::{Concurrency, Config, QueueConfig, RedisConfig};
pub use enqueuer::Enqueuer;
pub use error::{Error, Result};
pub use inspect::Inspector;
pub use job::{Job, Retry};
pub use manager::{current_epoch, Manager};
pub use crate::metrics::register_metrics;
pub use crate::redis::{DequeuedJob, EnqueueOpts, JobQueue, RedisKeys, RetryOutcome};
pub use registry::{HandlerRegistry, Invocation, JobHandler};
pub use stats::{ProcessInfo, Stats};
pub use worker::WorkerPoolStats;

/// Commonly used types.
pub mod prelude {
    pub use crate::config::{Concurrency, Config, QueueConfig};
    pub use crate::error::{Error, Result};
    pub use crate::job::Job;
    pub use crate::manager::Manager;
    pub use crate::registry::{HandlerRegistry, Invocation, JobHandler};
}
