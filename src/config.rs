//! Queue configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Configuration for one manager instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Optional label for this instance, used in log output when several
    /// managers run in one process.
    pub name: Option<String>,

    /// Redis connection parameters.
    pub redis: RedisConfig,

    /// Key prefix isolating deployments sharing one Redis.
    pub namespace: String,

    /// Queues to subscribe at startup.
    pub queues: Vec<QueueConfig>,

    /// Per-queue concurrency when a queue does not specify its own.
    pub concurrency: Concurrency,

    /// Overrides the node host used for backup-list keys. Defaults to the
    /// system hostname.
    pub node_id: Option<String>,

    /// Whether the schedule/retry poller runs. Must be enabled when
    /// `enqueue_in`/`enqueue_at` are in use.
    pub scheduler_enable: bool,

    /// Scheduler sweep interval in milliseconds.
    pub scheduler_poll_timeout_ms: u64,

    /// Worker pool poll interval in milliseconds.
    pub poll_timeout_ms: u64,

    /// Default retry budget for jobs enqueued with `retry: true`.
    pub max_retries: u32,

    /// Upper bound on manager control calls in milliseconds.
    pub manager_timeout_ms: u64,

    /// How long shutdown waits for in-flight jobs in milliseconds.
    pub shutdown_timeout_ms: u64,

    /// Cap on the terminally-failed job list.
    pub dead_max_jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            redis: RedisConfig::default(),
            namespace: default_namespace(),
            queues: vec![QueueConfig::Name("default".to_string())],
            concurrency: Concurrency::default(),
            node_id: None,
            scheduler_enable: false,
            scheduler_poll_timeout_ms: default_scheduler_poll_timeout(),
            poll_timeout_ms: default_poll_timeout(),
            max_retries: default_max_retries(),
            manager_timeout_ms: default_manager_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            dead_max_jobs: default_dead_max_jobs(),
        }
    }
}

fn default_namespace() -> String {
    "exq".to_string()
}

fn default_scheduler_poll_timeout() -> u64 {
    200
}

fn default_poll_timeout() -> u64 {
    50
}

fn default_max_retries() -> u32 {
    25
}

fn default_manager_timeout() -> u64 {
    5000
}

fn default_shutdown_timeout() -> u64 {
    30_000
}

fn default_dead_max_jobs() -> usize {
    10_000
}

impl Config {
    /// Scheduler sweep interval as a `Duration`.
    pub fn scheduler_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler_poll_timeout_ms)
    }

    /// Worker pool poll interval as a `Duration`.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Manager call timeout as a `Duration`.
    pub fn manager_timeout(&self) -> Duration {
        Duration::from_millis(self.manager_timeout_ms)
    }

    /// Shutdown drain timeout as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Redis connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Full connection URL. When set, the individual host/port/database
    /// fields are ignored.
    pub url: Option<String>,

    pub host: String,
    pub port: u16,
    pub database: u32,
    pub password: Option<String>,

    /// Connection pool size.
    pub pool_size: usize,

    /// Per-command socket timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            database: 0,
            password: None,
            pool_size: default_pool_size(),
            timeout_ms: default_redis_timeout(),
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_pool_size() -> usize {
    10
}

fn default_redis_timeout() -> u64 {
    5000
}

impl RedisConfig {
    /// Builds the connection URL from the individual fields unless an
    /// explicit `url` was given.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }

    /// Per-command timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A queue subscription: either a bare name or a (name, concurrency) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueConfig {
    Name(String),
    Pair(String, Concurrency),
}

impl QueueConfig {
    /// A subscription with the instance-default concurrency.
    pub fn named(name: impl Into<String>) -> Self {
        QueueConfig::Name(name.into())
    }

    /// A subscription with its own concurrency bound.
    pub fn with_concurrency(name: impl Into<String>, concurrency: Concurrency) -> Self {
        QueueConfig::Pair(name.into(), concurrency)
    }

    pub fn name(&self) -> &str {
        match self {
            QueueConfig::Name(name) => name,
            QueueConfig::Pair(name, _) => name,
        }
    }

    /// The queue's concurrency bound, falling back to the given default.
    pub fn concurrency(&self, default: Concurrency) -> Concurrency {
        match self {
            QueueConfig::Name(_) => default,
            QueueConfig::Pair(_, concurrency) => *concurrency,
        }
    }
}

/// Maximum simultaneously in-flight jobs for one queue on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Limit(usize),
    Unlimited,
}

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency::Limit(10_000)
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::Limit(n) => write!(f, "{}", n),
            Concurrency::Unlimited => write!(f, "unlimited"),
        }
    }
}

impl Serialize for Concurrency {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Concurrency::Limit(n) => serializer.serialize_u64(*n as u64),
            Concurrency::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for Concurrency {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = Concurrency;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer bound or the string \"unlimited\"")
            }

            fn visit_u64<E: serde::de::Error>(self, value: u64) -> std::result::Result<Concurrency, E> {
                Ok(Concurrency::Limit(value as usize))
            }

            fn visit_i64<E: serde::de::Error>(self, value: i64) -> std::result::Result<Concurrency, E> {
                if value < 0 {
                    return Err(E::custom("concurrency cannot be negative"));
                }
                Ok(Concurrency::Limit(value as usize))
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> std::result::Result<Concurrency, E> {
                if value.eq_ignore_ascii_case("unlimited") {
                    Ok(Concurrency::Unlimited)
                } else {
                    Err(E::custom(format!("unknown concurrency sentinel: {value}")))
                }
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}
