//! The Redis job queue protocol.
//!
//! Every durable state transition lives here: enqueue, the atomic
//! dequeue-to-backup move, boot recovery, promotion of due scheduled jobs,
//! and the retry/dead split for failures. All multi-command sections go
//! through pipelines; the dequeue move itself is a single server-side
//! `LMOVE` so a job is never observable outside both the ready list and the
//! backup list.

use super::RedisKeys;
use crate::error::{Error, Result};
use crate::job::{now_epoch, Job, Retry};
use ::redis::{AsyncCommands, Direction};
use deadpool_redis::Pool;
use serde_json::Value;
use tracing::{debug, warn};

/// A job pulled off a ready queue, together with the exact payload bytes
/// now sitting in the backup list. The raw form is what
/// [`JobQueue::remove_job_from_backup`] must match.
#[derive(Debug, Clone)]
pub struct DequeuedJob {
    pub queue: String,
    pub job: Job,
    pub raw: String,
}

/// Per-enqueue overrides.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    /// Override the job's retry budget (`true` means the configured
    /// default).
    pub retry: Option<Retry>,
    /// Supply the jid instead of generating one.
    pub jid: Option<String>,
}

/// Where a failed job ended up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryOutcome {
    /// Scheduled for another attempt at the given epoch time.
    Retried { at: f64 },
    /// Retry budget exhausted; appended to the dead list.
    Dead,
}

/// Handle on one namespace's queue state.
#[derive(Clone)]
pub struct JobQueue {
    pool: Pool,
    keys: RedisKeys,
    max_retries: u32,
    dead_max_jobs: usize,
}

impl JobQueue {
    pub fn new(pool: Pool, namespace: &str, max_retries: u32, dead_max_jobs: usize) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(namespace),
            max_retries,
            dead_max_jobs,
        }
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Push a job onto the tail of its ready queue, registering the queue
    /// name in the known-queues set in the same round-trip.
    pub async fn enqueue(&self, queue: &str, class: &str, args: Vec<Value>) -> Result<String> {
        self.enqueue_with(queue, class, args, EnqueueOpts::default()).await
    }

    /// Enqueue with per-job overrides.
    pub async fn enqueue_with(
        &self,
        queue: &str,
        class: &str,
        args: Vec<Value>,
        opts: EnqueueOpts,
    ) -> Result<String> {
        validate_enqueue(queue, class)?;
        let mut job = Job::build(queue, class, args);
        if let Some(retry) = opts.retry {
            job.retry = retry;
        }
        if let Some(jid) = opts.jid {
            job.jid = jid;
        }
        self.enqueue_job(&job).await
    }

    /// Enqueue an already-built job record.
    pub async fn enqueue_job(&self, job: &Job) -> Result<String> {
        let payload = job.encode()?;
        self.push_ready(&job.queue, &payload).await?;
        debug!(jid = %job.jid, queue = %job.queue, class = %job.class, "enqueued job");
        Ok(job.jid.clone())
    }

    /// Add a job to the schedule set, due at `at` epoch seconds.
    pub async fn enqueue_at(
        &self,
        queue: &str,
        at: f64,
        class: &str,
        args: Vec<Value>,
    ) -> Result<String> {
        validate_enqueue(queue, class)?;
        let job = Job::build(queue, class, args);
        let payload = job.encode()?;

        let mut conn = self.conn().await?;
        let _: () = conn.zadd(self.keys.schedule(), &payload, at).await?;

        debug!(jid = %job.jid, queue = %job.queue, at, "scheduled job");
        Ok(job.jid)
    }

    /// Add a job to the schedule set, due `offset` seconds from now.
    ///
    /// A zero offset still passes through the schedule set so that delivery
    /// always goes through the scheduler sweep.
    pub async fn enqueue_in(
        &self,
        queue: &str,
        offset: f64,
        class: &str,
        args: Vec<Value>,
    ) -> Result<String> {
        self.enqueue_at(queue, now_epoch() + offset, class, args).await
    }

    /// For each queue in caller order, atomically move the head job to the
    /// (host, queue) backup list. Returns the subset that yielded a job.
    ///
    /// Payloads that fail to decode never reach a worker: they are pulled
    /// back out of the backup list and appended to the dead list.
    pub async fn dequeue(&self, host: &str, queues: &[&str]) -> Result<Vec<DequeuedJob>> {
        let mut conn = self.conn().await?;
        let mut dequeued = Vec::new();

        for &queue in queues {
            let raw: Option<String> = conn
                .lmove(
                    self.keys.queue(queue),
                    self.keys.backup(host, queue),
                    Direction::Left,
                    Direction::Right,
                )
                .await?;

            let Some(raw) = raw else { continue };

            match Job::decode(&raw) {
                Ok(job) => dequeued.push(DequeuedJob {
                    queue: queue.to_string(),
                    job,
                    raw,
                }),
                Err(err) => {
                    warn!(queue, %err, "dropping malformed payload to dead list");
                    let _: () = conn
                        .lrem(self.keys.backup(host, queue), 1, &raw)
                        .await?;
                    self.dead_letter_raw(&mut conn, &raw, &err.to_string()).await?;
                }
            }
        }

        Ok(dequeued)
    }

    /// Remove exactly one copy of a completed job from its backup list.
    pub async fn remove_job_from_backup(
        &self,
        host: &str,
        queue: &str,
        serialized: &str,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.lrem(self.keys.backup(host, queue), 1, serialized).await?;
        Ok(())
    }

    /// Drain the (host, queue) backup list back onto the ready queue,
    /// popping from the backup tail and appending to the queue tail until
    /// the backup list is empty. Returns how many jobs were moved.
    pub async fn re_enqueue_backup(&self, host: &str, queue: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let backup_key = self.keys.backup(host, queue);
        let queue_key = self.keys.queue(queue);
        let mut moved = 0u64;

        loop {
            let raw: Option<String> = conn
                .lmove(&backup_key, &queue_key, Direction::Right, Direction::Right)
                .await?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }

        if moved > 0 {
            debug!(host, queue, moved, "re-enqueued backup jobs");
        }
        Ok(moved)
    }

    /// Promote every entry of the schedule and retry sets whose score is
    /// at or below `now` onto its ready queue. Returns the number promoted.
    ///
    /// Each entry is claimed with a `ZREM` before it is pushed, so racing
    /// sweeps on other nodes can never promote the same payload twice.
    pub async fn scheduler_dequeue(&self, now: f64) -> Result<u64> {
        let mut promoted = 0;
        for key in [self.keys.schedule(), self.keys.retry()] {
            promoted += self.promote_due(&key, now).await?;
        }
        Ok(promoted)
    }

    async fn promote_due(&self, set_key: &str, now: f64) -> Result<u64> {
        let mut conn = self.conn().await?;

        // Ascending score order: older due jobs land on their queues first.
        let due: Vec<String> = conn.zrangebyscore(set_key, "-inf", now).await?;
        let mut promoted = 0u64;

        for raw in due {
            let claimed: i64 = conn.zrem(set_key, &raw).await?;
            if claimed == 0 {
                // Another sweep won this entry.
                continue;
            }

            match Job::decode(&raw) {
                Ok(job) => {
                    self.push_ready(&job.queue, &raw).await?;
                    promoted += 1;
                    debug!(jid = %job.jid, queue = %job.queue, "promoted due job");
                }
                Err(err) => {
                    warn!(set_key, %err, "dead-lettering malformed scheduled entry");
                    self.dead_letter_raw(&mut conn, &raw, &err.to_string()).await?;
                }
            }
        }

        Ok(promoted)
    }

    /// Record one failed attempt: back into the retry set while the budget
    /// lasts, otherwise onto the capped dead list.
    pub async fn retry_or_fail_job(
        &self,
        job: &Job,
        error_class: &str,
        error_message: &str,
    ) -> Result<RetryOutcome> {
        let mut failed = job.clone();
        failed.record_failure(error_class, error_message);

        let attempts = failed.retry_count.unwrap_or(1);
        let budget = failed.retry.budget(self.max_retries);
        let payload = failed.encode()?;
        let mut conn = self.conn().await?;

        if attempts <= budget {
            let at = now_epoch() + retry_backoff(attempts);
            let _: () = conn.zadd(self.keys.retry(), &payload, at).await?;
            debug!(
                jid = %failed.jid,
                attempts,
                budget,
                retry_at = at,
                "scheduled retry"
            );
            Ok(RetryOutcome::Retried { at })
        } else {
            self.push_dead(&mut conn, &payload).await?;
            debug!(jid = %failed.jid, attempts, "job moved to dead list");
            Ok(RetryOutcome::Dead)
        }
    }

    /// Pull a dead job back onto its queue with its failure state cleared.
    /// Returns false when no dead job carries the jid.
    pub async fn requeue_dead(&self, jid: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let entries: Vec<String> = conn.lrange(self.keys.dead(), 0, -1).await?;

        for raw in entries {
            let Ok(mut job) = Job::decode(&raw) else { continue };
            if job.jid != jid {
                continue;
            }

            let _: () = conn.lrem(self.keys.dead(), 1, &raw).await?;
            job.retry_count = None;
            job.failed_at = None;
            job.error_class = None;
            job.error_message = None;
            self.enqueue_job(&job).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn push_ready(&self, queue: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .sadd(self.keys.queues(), queue)
            .rpush(self.keys.queue(queue), payload)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn push_dead(&self, conn: &mut deadpool_redis::Connection, payload: &str) -> Result<()> {
        let _: () = redis::pipe()
            .lpush(self.keys.dead(), payload)
            .ltrim(self.keys.dead(), 0, self.dead_max_jobs as isize - 1)
            .query_async(&mut **conn)
            .await?;
        Ok(())
    }

    /// Append a payload that cannot be decoded to the dead list. When the
    /// payload is at least a JSON object, the failure metadata is stamped
    /// onto it; otherwise it is kept verbatim.
    async fn dead_letter_raw(
        &self,
        conn: &mut deadpool_redis::Connection,
        raw: &str,
        message: &str,
    ) -> Result<()> {
        let annotated = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(mut map)) => {
                map.insert("error_class".to_string(), Value::from("MalformedJob"));
                map.insert("error_message".to_string(), Value::from(message));
                map.insert("failed_at".to_string(), Value::from(now_epoch()));
                Value::Object(map).to_string()
            }
            _ => raw.to_string(),
        };
        self.push_dead(conn, &annotated).await
    }
}

fn validate_enqueue(queue: &str, class: &str) -> Result<()> {
    if queue.is_empty() {
        return Err(Error::Configuration("queue name is empty".to_string()));
    }
    if class.is_empty() {
        return Err(Error::Configuration("worker class is empty".to_string()));
    }
    Ok(())
}

/// Back-off before retry attempt `n`, in seconds:
/// `n^4 + 15 + (rand(30) * (n + 1))`, matching the peer ecosystem so retry
/// times stay comparable across mixed deployments.
pub(crate) fn retry_backoff(retry_count: u32) -> f64 {
    let n = f64::from(retry_count);
    n.powi(4) + 15.0 + (jitter(30) as f64) * (n + 1.0)
}

/// Pseudo-random value in `0..range` from a time-seeded LCG. Uniformity is
/// irrelevant here; the term only spreads retry times apart.
fn jitter(range: u64) -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    if range == 0 {
        return 0;
    }

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    let a: u64 = 6364136223846793005;
    let c: u64 = 1442695040888963407;

    seed.wrapping_mul(a).wrapping_add(c) % range
}
