//! Process-local metrics for the queue core.
//!
//! Emitted through the `metrics` facade; the durable cross-node counters
//! live in Redis (see `stats`). Wire these up by installing any recorder,
//! e.g. a Prometheus exporter, in the host application.

use ::metrics::{counter, describe_counter, describe_gauge, gauge};

/// Metric names.
pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "toil_jobs_enqueued_total";
    pub const JOBS_PROCESSED_TOTAL: &str = "toil_jobs_processed_total";
    pub const JOBS_FAILED_TOTAL: &str = "toil_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "toil_jobs_retried_total";
    pub const JOBS_DEAD_TOTAL: &str = "toil_jobs_dead_total";
    pub const JOBS_PROMOTED_TOTAL: &str = "toil_jobs_promoted_total";
    pub const JOBS_IN_FLIGHT: &str = "toil_jobs_in_flight";
}

/// Register metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total jobs enqueued");
    describe_counter!(
        names::JOBS_PROCESSED_TOTAL,
        "Total jobs completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total failed job attempts");
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total failed attempts rescheduled for retry"
    );
    describe_counter!(
        names::JOBS_DEAD_TOTAL,
        "Total jobs moved to the dead list"
    );
    describe_counter!(
        names::JOBS_PROMOTED_TOTAL,
        "Total due jobs promoted from the schedule and retry sets"
    );
    describe_gauge!(names::JOBS_IN_FLIGHT, "Currently executing jobs");
}

/// Recorders for job lifecycle events.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    pub fn enqueued(queue: &str) {
        counter!(names::JOBS_ENQUEUED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    pub fn processed(queue: &str) {
        counter!(names::JOBS_PROCESSED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    pub fn failed(queue: &str, error_class: &str) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "error_class" => error_class.to_string()
        )
        .increment(1);
    }

    pub fn retried(queue: &str) {
        counter!(names::JOBS_RETRIED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    pub fn dead(queue: &str) {
        counter!(names::JOBS_DEAD_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    pub fn in_flight(queue: &str, count: usize) {
        gauge!(names::JOBS_IN_FLIGHT, "queue" => queue.to_string()).set(count as f64);
    }
}

/// Recorder for scheduler sweeps.
#[derive(Clone)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    pub fn promoted(count: u64) {
        counter!(names::JOBS_PROMOTED_TOTAL).increment(count);
    }
}
