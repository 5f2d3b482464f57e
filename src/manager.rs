//! Manager lifecycle.
//!
//! A [`Manager`] owns one pool per subscribed queue plus, optionally, the
//! scheduler. Before any pool starts dequeuing it drains this host's
//! backup lists back onto their ready queues, so jobs stranded by a prior
//! crash are re-delivered. Subscribe and unsubscribe are control messages
//! handled by a dedicated task; several managers can coexist in one
//! process, each addressed by its own handle.

use crate::config::{Concurrency, Config};
use crate::error::{Error, Result};
use crate::job::now_epoch;
use crate::metrics::JobMetrics;
use crate::redis::{create_pool, JobQueue};
use crate::registry::HandlerRegistry;
use crate::scheduler::Scheduler;
use crate::stats::Stats;
use crate::worker::{spawn_pool, PoolHandle, WorkerPoolStats};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

enum Command {
    Subscribe {
        queue: String,
        concurrency: Concurrency,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        queue: String,
        reply: oneshot::Sender<Result<()>>,
    },
    PoolStats {
        reply: oneshot::Sender<Vec<WorkerPoolStats>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle on one running manager instance.
pub struct Manager {
    cmd_tx: mpsc::Sender<Command>,
    queue: Arc<JobQueue>,
    host: String,
    timeout: Duration,
    scheduler_enabled: bool,
}

impl Manager {
    /// Connect to Redis, run boot recovery for every configured queue, and
    /// start the pools (and scheduler, when enabled).
    ///
    /// Recovery is mandatory and completes before the first dequeue: any
    /// job a prior crash left in a backup list is back on its ready queue
    /// when this returns.
    pub async fn start(config: Config, registry: Arc<HandlerRegistry>) -> Result<Manager> {
        let pool = create_pool(&config.redis).await?;
        let host = match &config.node_id {
            Some(node_id) => node_id.clone(),
            None => resolve_hostname(),
        };

        let queue = Arc::new(JobQueue::new(
            pool.clone(),
            &config.namespace,
            config.max_retries,
            config.dead_max_jobs,
        ));
        let stats = Stats::new(pool, &config.namespace);

        info!(
            name = config.name.as_deref().unwrap_or("toil"),
            host = %host,
            namespace = %config.namespace,
            queues = config.queues.len(),
            scheduler = config.scheduler_enable,
            "starting manager"
        );

        let mut pools: HashMap<String, PoolHandle> = HashMap::new();
        for entry in &config.queues {
            let name = entry.name().to_string();
            let recovered = queue.re_enqueue_backup(&host, &name).await?;
            if recovered > 0 {
                info!(queue = %name, recovered, "recovered in-flight jobs from prior run");
            }
            let handle = spawn_pool(
                name.clone(),
                entry.concurrency(config.concurrency),
                host.clone(),
                queue.clone(),
                stats.clone(),
                registry.clone(),
                config.poll_timeout(),
            );
            pools.insert(name, handle);
        }

        let scheduler = if config.scheduler_enable {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(
                Scheduler::new(queue.clone(), config.scheduler_poll_timeout()).run(shutdown_rx),
            );
            Some((shutdown_tx, task))
        } else {
            None
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let control = ControlLoop {
            pools,
            scheduler,
            host: host.clone(),
            queue: queue.clone(),
            stats,
            registry,
            default_concurrency: config.concurrency,
            poll_interval: config.poll_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
        };
        tokio::spawn(control.run(cmd_rx));

        Ok(Manager {
            cmd_tx,
            queue,
            host,
            timeout: config.manager_timeout(),
            scheduler_enabled: config.scheduler_enable,
        })
    }

    /// The host identity used for this manager's backup lists.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Enqueue for immediate delivery. Returns the generated jid.
    pub async fn enqueue(&self, queue: &str, class: &str, args: Vec<Value>) -> Result<String> {
        let jid = self.queue.enqueue(queue, class, args).await?;
        JobMetrics::enqueued(queue);
        Ok(jid)
    }

    /// Enqueue for delivery `offset` seconds from now.
    pub async fn enqueue_in(
        &self,
        queue: &str,
        offset: f64,
        class: &str,
        args: Vec<Value>,
    ) -> Result<String> {
        self.warn_if_scheduler_disabled();
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
        self.warn_if_scheduler_disabled();
        let jid = self.queue.enqueue_at(queue, at, class, args).await?;
        JobMetrics::enqueued(queue);
        Ok(jid)
    }

    /// Start a pool for a queue at runtime. Runs the same backup recovery
    /// as boot before the pool dequeues.
    pub async fn subscribe(&self, queue: &str, concurrency: Concurrency) -> Result<()> {
        self.call(|reply| Command::Subscribe {
            queue: queue.to_string(),
            concurrency,
            reply,
        })
        .await?
    }

    /// Stop a queue's pool: no more dequeues, in-flight jobs finish. Jobs
    /// enqueued afterwards stay in Redis until someone re-subscribes.
    pub async fn unsubscribe(&self, queue: &str) -> Result<()> {
        self.call(|reply| Command::Unsubscribe {
            queue: queue.to_string(),
            reply,
        })
        .await?
    }

    /// Counter snapshots for every running pool.
    pub async fn pool_stats(&self) -> Result<Vec<WorkerPoolStats>> {
        self.call(|reply| Command::PoolStats { reply }).await
    }

    /// Graceful shutdown: pools stop dequeuing, running jobs complete, the
    /// scheduler stops. Backup lists are left as-is; anything undrained is
    /// picked up by recovery on the next start.
    pub async fn shutdown(self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| Error::Shutdown)?;
        match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => Err(Error::Timeout(self.timeout.as_millis() as u64)),
            Ok(Err(_)) => Err(Error::Shutdown),
            Ok(Ok(value)) => Ok(value),
        }
    }

    fn warn_if_scheduler_disabled(&self) {
        if !self.scheduler_enabled {
            warn!(
                "timed enqueue with the scheduler disabled; the job will not be \
                 promoted until a scheduler runs against this namespace"
            );
        }
    }
}

struct ControlLoop {
    pools: HashMap<String, PoolHandle>,
    scheduler: Option<(watch::Sender<bool>, JoinHandle<()>)>,
    host: String,
    queue: Arc<JobQueue>,
    stats: Stats,
    registry: Arc<HandlerRegistry>,
    default_concurrency: Concurrency,
    poll_interval: Duration,
    shutdown_timeout: Duration,
}

impl ControlLoop {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(command) = cmd_rx.recv().await {
            match command {
                Command::Subscribe {
                    queue,
                    concurrency,
                    reply,
                } => {
                    let _ = reply.send(self.subscribe(queue, concurrency).await);
                }
                Command::Unsubscribe { queue, reply } => {
                    let _ = reply.send(self.unsubscribe(&queue));
                }
                Command::PoolStats { reply } => {
                    let stats = self.pools.values().map(PoolHandle::stats).collect();
                    let _ = reply.send(stats);
                }
                Command::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }

        // Every handle dropped without an explicit shutdown; stop anyway.
        self.shutdown().await;
    }

    async fn subscribe(&mut self, queue: String, concurrency: Concurrency) -> Result<()> {
        if self.pools.contains_key(&queue) {
            return Err(Error::Configuration(format!(
                "already subscribed to queue {queue}"
            )));
        }

        let concurrency = match concurrency {
            Concurrency::Limit(0) => self.default_concurrency,
            other => other,
        };

        let recovered = self.queue.re_enqueue_backup(&self.host, &queue).await?;
        if recovered > 0 {
            info!(queue = %queue, recovered, "recovered in-flight jobs before subscribing");
        }

        let handle = spawn_pool(
            queue.clone(),
            concurrency,
            self.host.clone(),
            self.queue.clone(),
            self.stats.clone(),
            self.registry.clone(),
            self.poll_interval,
        );
        self.pools.insert(queue, handle);
        Ok(())
    }

    fn unsubscribe(&mut self, queue: &str) -> Result<()> {
        // Idempotent: unsubscribing a queue that is not subscribed is a
        // no-op.
        if let Some(handle) = self.pools.remove(queue) {
            handle.signal_shutdown();
            info!(queue, "unsubscribed; pool draining");
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("manager shutting down");

        if let Some((shutdown_tx, task)) = self.scheduler.take() {
            let _ = shutdown_tx.send(true);
            let _ = task.await;
        }

        let mut joins = Vec::with_capacity(self.pools.len());
        for (_, handle) in self.pools.drain() {
            handle.signal_shutdown();
            joins.push(handle.into_join());
        }

        let drain = async {
            for join in joins {
                let _ = join.await;
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "shutdown timed out with jobs still running; backups will recover them"
            );
        }

        info!("manager stopped");
    }
}

fn resolve_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Epoch-seconds helper re-exported for callers computing `enqueue_at`
/// times.
pub fn current_epoch() -> f64 {
    now_epoch()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_resolves_to_something() {
        assert!(!resolve_hostname().is_empty());
    }

    #[test]
    fn current_epoch_is_recent() {
        // 2023-01-01 as a sanity floor.
        assert!(current_epoch() > 1_672_531_200.0);
    }
}
