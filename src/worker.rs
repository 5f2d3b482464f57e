//! Per-queue worker pools.
//!
//! One pool per subscribed queue. A semaphore of the queue's concurrency
//! bound gates dequeues: the pool only pulls a job when a worker slot is
//! free, and the slot is held until the job reaches a terminal outcome.
//! Worker invocations run on their own tasks so a slow job never blocks
//! the dequeue loop.

use crate::config::Concurrency;
use crate::job::Job;
use crate::metrics::JobMetrics;
use crate::redis::{DequeuedJob, JobQueue, RetryOutcome};
use crate::registry::{split_selector, HandlerRegistry, Invocation};
use crate::stats::{ProcessInfo, Stats};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Ceiling for the connectivity back-off on the poll timer.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(10);

/// Snapshot of one pool's counters.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub queue: String,
    pub concurrency: Concurrency,
    pub in_flight: usize,
    pub processed: u64,
    pub failed: u64,
}

/// Control handle the manager keeps per subscribed queue.
pub(crate) struct PoolHandle {
    pub(crate) queue: String,
    pub(crate) concurrency: Concurrency,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    in_flight: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl PoolHandle {
    pub(crate) fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            queue: self.queue.clone(),
            concurrency: self.concurrency,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    /// Stop dequeuing; in-flight jobs finish before the pool task exits.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn into_join(self) -> JoinHandle<()> {
        self.join
    }
}

/// Start the pool task for one queue.
pub(crate) fn spawn_pool(
    queue_name: String,
    concurrency: Concurrency,
    host: String,
    queue: Arc<JobQueue>,
    stats: Stats,
    registry: Arc<HandlerRegistry>,
    poll_interval: Duration,
) -> PoolHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let pool = WorkerPool {
        runner: JobRunner {
            queue_name: queue_name.clone(),
            host,
            queue,
            stats,
            registry,
            concurrency_label: concurrency.to_string(),
            in_flight: in_flight.clone(),
            processed: processed.clone(),
            failed: failed.clone(),
        },
        semaphore: Arc::new(Semaphore::new(permits(concurrency))),
        poll_interval,
    };

    let join = tokio::spawn(pool.run(shutdown_rx));

    PoolHandle {
        queue: queue_name,
        concurrency,
        shutdown_tx,
        join,
        in_flight,
        processed,
        failed,
    }
}

fn permits(concurrency: Concurrency) -> usize {
    match concurrency {
        Concurrency::Limit(n) => n.max(1),
        Concurrency::Unlimited => Semaphore::MAX_PERMITS,
    }
}

struct WorkerPool {
    runner: JobRunner,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
}

impl WorkerPool {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue_name = self.runner.queue_name.clone();
        info!(
            queue = %queue_name,
            concurrency = %self.runner.concurrency_label,
            "worker pool started"
        );

        let mut backoff = self.poll_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // A free worker slot is a precondition for dequeuing: the job
            // moves to the backup list the moment it is pulled, so nothing
            // may sit between dequeue and dispatch.
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    if sleep_or_shutdown(self.poll_interval, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self
                .runner
                .queue
                .dequeue(&self.runner.host, &[queue_name.as_str()])
                .await
            {
                Ok(mut jobs) => {
                    backoff = self.poll_interval;
                    match jobs.pop() {
                        Some(dequeued) => self.runner.spawn_job(dequeued, permit),
                        None => {
                            drop(permit);
                            if sleep_or_shutdown(self.poll_interval, &mut shutdown).await {
                                break;
                            }
                        }
                    }
                }
                Err(err) if err.is_connectivity() => {
                    drop(permit);
                    warn!(
                        queue = %queue_name,
                        %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "redis unreachable; backing off"
                    );
                    if sleep_or_shutdown(backoff, &mut shutdown).await {
                        break;
                    }
                    backoff = (backoff * 2).min(MAX_POLL_BACKOFF);
                }
                Err(err) => {
                    drop(permit);
                    error!(queue = %queue_name, %err, "dequeue failed");
                    if sleep_or_shutdown(self.poll_interval, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        // Graceful exit: no more dequeues, let in-flight jobs land. Any
        // hard kill instead leaves them in the backup list for boot
        // recovery.
        while self.runner.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        info!(
            queue = %queue_name,
            processed = self.runner.processed.load(Ordering::SeqCst),
            failed = self.runner.failed.load(Ordering::SeqCst),
            "worker pool stopped"
        );
    }
}

/// Returns true when shutdown fired (or the manager went away) during the
/// sleep.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Everything a spawned job task needs, clonable per job.
#[derive(Clone)]
struct JobRunner {
    queue_name: String,
    host: String,
    queue: Arc<JobQueue>,
    stats: Stats,
    registry: Arc<HandlerRegistry>,
    concurrency_label: String,
    in_flight: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl JobRunner {
    fn spawn_job(&self, dequeued: DequeuedJob, permit: OwnedSemaphorePermit) {
        let runner = self.clone();
        let count = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        JobMetrics::in_flight(&self.queue_name, count);

        tokio::spawn(async move {
            runner.process(dequeued.job, dequeued.raw).await;
            let count = runner.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
            JobMetrics::in_flight(&runner.queue_name, count);
            drop(permit);
        });
    }

    async fn process(&self, mut job: Job, raw: String) {
        job.processor = Some(self.host.clone());

        let process = ProcessInfo::new(
            &self.host,
            &self.queue_name,
            self.concurrency_label.clone(),
            job.clone(),
        );
        if let Err(err) = self.stats.add_process(&process).await {
            warn!(jid = %job.jid, %err, "failed to record process entry");
        }

        debug!(jid = %job.jid, class = %job.class, queue = %self.queue_name, "performing job");

        match self.invoke(&job).await {
            Ok(()) => self.complete(&job, &raw, &process).await,
            Err((error_class, error_message)) => {
                self.fail(&job, &raw, &process, &error_class, &error_message)
                    .await
            }
        }
    }

    /// Run the registered handler. Any failure mode — missing handler,
    /// handler error, handler panic — becomes a (error_class, message)
    /// pair; nothing here can take the pool down.
    async fn invoke(&self, job: &Job) -> std::result::Result<(), (String, String)> {
        let Some(handler) = self.registry.resolve(&job.class) else {
            return Err((
                "WorkerNotFound".to_string(),
                format!("no handler registered for class {}", job.class),
            ));
        };

        let (class, method) = split_selector(&job.class);
        let invocation = Invocation {
            jid: job.jid.clone(),
            queue: self.queue_name.clone(),
            class: class.to_string(),
            method: method.map(str::to_string),
            args: job.args.clone(),
            retry_count: job.retry_count.unwrap_or(0),
        };

        match AssertUnwindSafe(handler.perform(invocation)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(("WorkerRaised".to_string(), format!("{err:#}"))),
            Err(panic) => Err(("WorkerRaised".to_string(), panic_message(panic))),
        }
    }

    async fn complete(&self, job: &Job, raw: &str, process: &ProcessInfo) {
        if let Err(err) = self
            .queue
            .remove_job_from_backup(&self.host, &self.queue_name, raw)
            .await
        {
            error!(jid = %job.jid, %err, "failed to clear backup entry");
        }
        if let Err(err) = self.stats.record_processed(&self.queue_name).await {
            warn!(jid = %job.jid, %err, "stats write failed");
        }
        if let Err(err) = self.stats.remove_process(&process.process_id).await {
            warn!(jid = %job.jid, %err, "failed to clear process entry");
        }

        self.processed.fetch_add(1, Ordering::SeqCst);
        JobMetrics::processed(&self.queue_name);
        debug!(jid = %job.jid, "job done");
    }

    async fn fail(
        &self,
        job: &Job,
        raw: &str,
        process: &ProcessInfo,
        error_class: &str,
        error_message: &str,
    ) {
        warn!(
            jid = %job.jid,
            class = %job.class,
            error_class,
            error_message,
            "job failed"
        );

        match self
            .queue
            .retry_or_fail_job(job, error_class, error_message)
            .await
        {
            Ok(outcome) => {
                match outcome {
                    RetryOutcome::Retried { .. } => JobMetrics::retried(&self.queue_name),
                    RetryOutcome::Dead => JobMetrics::dead(&self.queue_name),
                }
                if let Err(err) = self
                    .queue
                    .remove_job_from_backup(&self.host, &self.queue_name, raw)
                    .await
                {
                    error!(jid = %job.jid, %err, "failed to clear backup entry");
                }
            }
            Err(err) => {
                // The failure record never made it to Redis. Leave the
                // backup entry alone so boot recovery re-delivers the job.
                error!(
                    jid = %job.jid,
                    %err,
                    "failed to record job failure; leaving job in backup"
                );
            }
        }

        if let Err(err) = self.stats.record_failed(&self.queue_name).await {
            warn!(jid = %job.jid, %err, "stats write failed");
        }
        if let Err(err) = self.stats.remove_process(&process.process_id).await {
            warn!(jid = %job.jid, %err, "failed to clear process entry");
        }

        self.failed.fetch_add(1, Ordering::SeqCst);
        JobMetrics::failed(&self.queue_name, error_class);
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_string()
    }
}
