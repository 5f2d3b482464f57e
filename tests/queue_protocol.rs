//! Protocol-level tests against a live Redis.
//!
//! Run with `cargo test -- --ignored` next to a local server, or point
//! `REDIS_URL` elsewhere.

mod common;

use common::{cleanup, conn_for, queue_for, test_config};
use redis::AsyncCommands;
use serde_json::json;
use toil::job::now_epoch;
use toil::{EnqueueOpts, Job, RedisKeys, Retry, RetryOutcome};

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn enqueue_lands_on_queue_and_registers_name() {
    let config = test_config("enqueue");
    let queue = queue_for(&config).await;
    let keys = RedisKeys::new(&config.namespace);

    let jid = queue
        .enqueue("default", "PerformWorker", vec![json!(1)])
        .await
        .unwrap();
    assert_eq!(jid.len(), 32);

    let mut conn = conn_for(&config).await;
    let size: u64 = conn.llen(keys.queue("default")).await.unwrap();
    assert_eq!(size, 1);

    let names: Vec<String> = conn.smembers(keys.queues()).await.unwrap();
    assert_eq!(names, vec!["default".to_string()]);

    let raw: Vec<String> = conn.lrange(keys.queue("default"), 0, -1).await.unwrap();
    let job = Job::decode(&raw[0]).unwrap();
    assert_eq!(job.jid, jid);
    assert_eq!(job.class, "PerformWorker");
    assert!(job.enqueued_at > 0.0);

    cleanup(&config).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn dequeue_moves_job_to_backup_in_one_step() {
    let config = test_config("dequeue");
    let queue = queue_for(&config).await;
    let keys = RedisKeys::new(&config.namespace);

    let jid = queue.enqueue("work", "PerformWorker", vec![]).await.unwrap();

    let dequeued = queue.dequeue("host-a", &["work"]).await.unwrap();
    assert_eq!(dequeued.len(), 1);
    assert_eq!(dequeued[0].queue, "work");
    assert_eq!(dequeued[0].job.jid, jid);

    // The job is in the backup list and nowhere else.
    let mut conn = conn_for(&config).await;
    let ready: u64 = conn.llen(keys.queue("work")).await.unwrap();
    assert_eq!(ready, 0);
    let backup: Vec<String> = conn
        .lrange(keys.backup("host-a", "work"), 0, -1)
        .await
        .unwrap();
    assert_eq!(backup, vec![dequeued[0].raw.clone()]);

    // Empty queue yields nothing.
    let again = queue.dequeue("host-a", &["work"]).await.unwrap();
    assert!(again.is_empty());

    cleanup(&config).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn dequeue_is_fifo_within_a_queue() {
    let config = test_config("fifo");
    let queue = queue_for(&config).await;

    let first = queue.enqueue("work", "W", vec![json!(1)]).await.unwrap();
    let second = queue.enqueue("work", "W", vec![json!(2)]).await.unwrap();
    let third = queue.enqueue("work", "W", vec![json!(3)]).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let mut jobs = queue.dequeue("host-a", &["work"]).await.unwrap();
        seen.push(jobs.pop().unwrap().job.jid);
    }
    assert_eq!(seen, vec![first, second, third]);

    cleanup(&config).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn completed_job_is_removed_from_backup() {
    let config = test_config("complete");
    let queue = queue_for(&config).await;
    let keys = RedisKeys::new(&config.namespace);

    queue.enqueue("work", "W", vec![]).await.unwrap();
    let dequeued = queue.dequeue("host-a", &["work"]).await.unwrap();

    queue
        .remove_job_from_backup("host-a", "work", &dequeued[0].raw)
        .await
        .unwrap();

    let mut conn = conn_for(&config).await;
    let backup: u64 = conn.llen(keys.backup("host-a", "work")).await.unwrap();
    assert_eq!(backup, 0);

    cleanup(&config).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn re_enqueue_backup_drains_everything_back() {
    let config = test_config("recovery");
    let queue = queue_for(&config).await;
    let keys = RedisKeys::new(&config.namespace);

    let mut jids = Vec::new();
    for i in 0..3 {
        jids.push(queue.enqueue("work", "W", vec![json!(i)]).await.unwrap());
    }
    for _ in 0..3 {
        queue.dequeue("host-a", &["work"]).await.unwrap();
    }

    let moved = queue.re_enqueue_backup("host-a", "work").await.unwrap();
    assert_eq!(moved, 3);

    let mut conn = conn_for(&config).await;
    let backup: u64 = conn.llen(keys.backup("host-a", "work")).await.unwrap();
    assert_eq!(backup, 0);
    let ready: Vec<String> = conn.lrange(keys.queue("work"), 0, -1).await.unwrap();
    let mut recovered: Vec<String> = ready
        .iter()
        .map(|raw| Job::decode(raw).unwrap().jid)
        .collect();
    recovered.sort();
    let mut expected = jids.clone();
    expected.sort();
    assert_eq!(recovered, expected);

    // A drained backup yields nothing more.
    let moved = queue.re_enqueue_backup("host-a", "work").await.unwrap();
    assert_eq!(moved, 0);

    cleanup(&config).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn scheduler_dequeue_promotes_only_due_entries() {
    let config = test_config("promote");
    let queue = queue_for(&config).await;
    let keys = RedisKeys::new(&config.namespace);

    let due = queue
        .enqueue_at("work", now_epoch() - 1.0, "W", vec![])
        .await
        .unwrap();
    let _future = queue
        .enqueue_at("work", now_epoch() + 3600.0, "W", vec![])
        .await
        .unwrap();

    let promoted = queue.scheduler_dequeue(now_epoch()).await.unwrap();
    assert_eq!(promoted, 1);

    let mut conn = conn_for(&config).await;
    let ready: Vec<String> = conn.lrange(keys.queue("work"), 0, -1).await.unwrap();
    assert_eq!(Job::decode(&ready[0]).unwrap().jid, due);
    let pending: u64 = conn.zcard(keys.schedule()).await.unwrap();
    assert_eq!(pending, 1);

    // A second sweep finds nothing due.
    let promoted = queue.scheduler_dequeue(now_epoch()).await.unwrap();
    assert_eq!(promoted, 0);

    cleanup(&config).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn enqueue_in_zero_still_passes_through_schedule() {
    let config = test_config("zero-offset");
    let queue = queue_for(&config).await;
    let keys = RedisKeys::new(&config.namespace);

    queue.enqueue_in("work", 0.0, "W", vec![]).await.unwrap();

    let mut conn = conn_for(&config).await;
    let ready: u64 = conn.llen(keys.queue("work")).await.unwrap();
    assert_eq!(ready, 0);
    let scheduled: u64 = conn.zcard(keys.schedule()).await.unwrap();
    assert_eq!(scheduled, 1);

    queue.scheduler_dequeue(now_epoch()).await.unwrap();
    let ready: u64 = conn.llen(keys.queue("work")).await.unwrap();
    assert_eq!(ready, 1);

    cleanup(&config).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn failed_job_retries_until_the_budget_runs_out() {
    let config = test_config("retry");
    let queue = queue_for(&config).await;
    let keys = RedisKeys::new(&config.namespace);

    let jid = queue
        .enqueue_with(
            "work",
            "Flaky",
            vec![],
            EnqueueOpts {
                retry: Some(Retry::Limit(1)),
                ..EnqueueOpts::default()
            },
        )
        .await
        .unwrap();
    let dequeued = queue.dequeue("host-a", &["work"]).await.unwrap();
    let job = &dequeued[0].job;

    // First failure: within budget, lands in the retry set with a score
    // inside the back-off envelope for attempt 1.
    let before = now_epoch();
    let outcome = queue
        .retry_or_fail_job(job, "WorkerRaised", "boom")
        .await
        .unwrap();
    assert!(matches!(outcome, RetryOutcome::Retried { .. }));

    let mut conn = conn_for(&config).await;
    let entries: Vec<(String, f64)> = conn
        .zrange_withscores(keys.retry(), 0, -1)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    let retried = Job::decode(&entries[0].0).unwrap();
    assert_eq!(retried.jid, jid);
    assert_eq!(retried.retry_count, Some(1));
    assert_eq!(retried.error_class.as_deref(), Some("WorkerRaised"));
    let delay = entries[0].1 - before;
    assert!((16.0..=77.0).contains(&delay), "delay was {delay}");

    // Second failure: budget exhausted, the job is dead.
    let outcome = queue
        .retry_or_fail_job(&retried, "WorkerRaised", "boom again")
        .await
        .unwrap();
    assert_eq!(outcome, RetryOutcome::Dead);

    let dead: Vec<String> = conn.lrange(keys.dead(), 0, -1).await.unwrap();
    assert_eq!(dead.len(), 1);
    let dead_job = Job::decode(&dead[0]).unwrap();
    assert_eq!(dead_job.jid, jid);
    assert_eq!(dead_job.retry_count, Some(2));

    cleanup(&config).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn malformed_ready_payload_is_dead_lettered() {
    let config = test_config("malformed");
    let queue = queue_for(&config).await;
    let keys = RedisKeys::new(&config.namespace);

    let mut conn = conn_for(&config).await;
    let _: () = conn
        .rpush(keys.queue("work"), r#"{"args":[],"queue":"work"}"#)
        .await
        .unwrap();

    let dequeued = queue.dequeue("host-a", &["work"]).await.unwrap();
    assert!(dequeued.is_empty());

    let backup: u64 = conn.llen(keys.backup("host-a", "work")).await.unwrap();
    assert_eq!(backup, 0);
    let dead: Vec<String> = conn.lrange(keys.dead(), 0, -1).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].contains("MalformedJob"));

    cleanup(&config).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn dead_job_can_be_requeued() {
    let config = test_config("requeue-dead");
    let queue = queue_for(&config).await;
    let keys = RedisKeys::new(&config.namespace);

    let jid = queue
        .enqueue_with(
            "work",
            "Flaky",
            vec![],
            EnqueueOpts {
                retry: Some(Retry::Flag(false)),
                ..EnqueueOpts::default()
            },
        )
        .await
        .unwrap();
    let dequeued = queue.dequeue("host-a", &["work"]).await.unwrap();
    let outcome = queue
        .retry_or_fail_job(&dequeued[0].job, "WorkerRaised", "boom")
        .await
        .unwrap();
    assert_eq!(outcome, RetryOutcome::Dead);

    assert!(queue.requeue_dead(&jid).await.unwrap());
    assert!(!queue.requeue_dead(&jid).await.unwrap());

    let mut conn = conn_for(&config).await;
    let dead: u64 = conn.llen(keys.dead()).await.unwrap();
    assert_eq!(dead, 0);
    let ready: Vec<String> = conn.lrange(keys.queue("work"), 0, -1).await.unwrap();
    let job = Job::decode(&ready[0]).unwrap();
    assert_eq!(job.jid, jid);
    assert_eq!(job.retry_count, None);
    assert_eq!(job.error_class, None);

    cleanup(&config).await;
}
