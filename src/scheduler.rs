//! The schedule/retry poller.
//!
//! A single long-lived task per manager. Each sweep promotes every due
//! entry of the schedule and retry sets onto its ready queue; racing
//! sweeps on other nodes are safe because the protocol claims each entry
//! atomically.

use crate::job::now_epoch;
use crate::metrics::SchedulerMetrics;
use crate::redis::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub(crate) struct Scheduler {
    queue: Arc<JobQueue>,
    poll_interval: Duration,
}

impl Scheduler {
    pub(crate) fn new(queue: Arc<JobQueue>, poll_interval: Duration) -> Self {
        Self {
            queue,
            poll_interval,
        }
    }

    /// Sweep until shutdown is signalled. Sweep failures are logged and the
    /// loop keeps polling; a malformed entry is dead-lettered by the
    /// protocol layer, never crashes the scheduler.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "scheduler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.queue.scheduler_dequeue(now_epoch()).await {
                        Ok(0) => {}
                        Ok(promoted) => {
                            SchedulerMetrics::promoted(promoted);
                            debug!(promoted, "promoted due jobs");
                        }
                        Err(err) => warn!(%err, "scheduler sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("scheduler stopped");
    }
}
