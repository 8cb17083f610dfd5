//! Periodic liveness report, independent of job execution.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::queue::{Heartbeat, RemoteQueue, call_with_timeout};
use crate::snapshot::{SnapshotDelta, SnapshotHandle, StatusSnapshot};

pub struct HeartbeatTask {
    queue: Arc<dyn RemoteQueue>,
    worker_id: String,
    interval: Duration,
    call_timeout: Duration,
    snapshot: SnapshotHandle,
    view: watch::Receiver<Arc<StatusSnapshot>>,
}

impl HeartbeatTask {
    pub fn new(
        queue: Arc<dyn RemoteQueue>,
        worker_id: impl Into<String>,
        interval: Duration,
        call_timeout: Duration,
        snapshot: SnapshotHandle,
        view: watch::Receiver<Arc<StatusSnapshot>>,
    ) -> Self {
        Self {
            queue,
            worker_id: worker_id.into(),
            interval,
            call_timeout,
            snapshot,
            view,
        }
    }

    /// Build the report from the latest published snapshot.
    pub fn compose(&self) -> Heartbeat {
        let snap = self.view.borrow();
        Heartbeat {
            worker_id: self.worker_id.clone(),
            status: snap.status.label().to_string(),
            active_job_id: snap.active_job.as_ref().map(|j| j.id.clone()),
            counters: snap.counters,
            sent_at: Utc::now(),
        }
    }

    /// Send one heartbeat and record the outcome.
    pub async fn beat(&self) -> bool {
        let beat = self.compose();
        match call_with_timeout(self.call_timeout, self.queue.heartbeat(&beat)).await {
            Ok(()) => {
                debug!(worker_id = %self.worker_id, "heartbeat sent");
                self.snapshot.send(SnapshotDelta::HeartbeatSent(Utc::now()));
                true
            }
            Err(e) => {
                warn!(worker_id = %self.worker_id, error = %e, "heartbeat failed");
                self.snapshot.send(SnapshotDelta::HeartbeatFailed {
                    message: format!("heartbeat failed: {e}"),
                    at: Utc::now(),
                });
                false
            }
        }
    }

    /// Beat every interval (the first one interval after start) until
    /// cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticks = tokio::time::interval_at(start, self.interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticks.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.beat() => {}
            }
        }
    }
}
