//! Shared helpers for the live-Redis suites.
//!
//! Every test gets its own namespace so suites can run concurrently
//! against one server. Set `REDIS_URL` to point somewhere other than the
//! local default.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;
use toil::job::new_jid;
use toil::redis::create_pool;
use toil::{Config, JobQueue};

static TRACING: Once = Once::new();

/// Log per `RUST_LOG`; silent by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn test_config(label: &str) -> Config {
    init_tracing();
    let mut config = Config::default();
    config.namespace = format!("toil-test-{label}-{}", new_jid());
    config.node_id = Some(format!("test-node-{}", new_jid()));
    config.poll_timeout_ms = 20;
    config.scheduler_poll_timeout_ms = 50;
    if let Ok(url) = std::env::var("REDIS_URL") {
        config.redis.url = Some(url);
    }
    config
}

pub async fn queue_for(config: &Config) -> JobQueue {
    let pool = create_pool(&config.redis).await.expect("redis reachable");
    JobQueue::new(
        pool,
        &config.namespace,
        config.max_retries,
        config.dead_max_jobs,
    )
}

pub async fn conn_for(config: &Config) -> deadpool_redis::Connection {
    let pool = create_pool(&config.redis).await.expect("redis reachable");
    pool.get().await.expect("connection")
}

/// Remove every key the test namespace created.
pub async fn cleanup(config: &Config) {
    let mut conn = conn_for(config).await;
    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(format!("{}:*", config.namespace))
        .query_async(&mut *conn)
        .await
        .expect("KEYS");
    if !keys.is_empty() {
        let _: () = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut *conn)
            .await
            .expect("DEL");
    }
}

/// Poll `predicate` every 10 ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
