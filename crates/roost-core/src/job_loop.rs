//! Claim -> start -> execute -> report, one job at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendRegistry, ExecutionContext};
use crate::config::HarnessConfig;
use crate::foreground::Foreground;
use crate::job::{FailureKind, Job, JobFailure, JobReport};
use crate::queue::{ClaimRequest, QueueError, RemoteQueue, call_with_timeout};
use crate::snapshot::{HarnessStatus, SessionInfo, SnapshotDelta, SnapshotHandle, StatusSnapshot};
use crate::terminal::Viewport;

/// First retry delay for lost reports.
const REPORT_RETRY_BASE: Duration = Duration::from_millis(500);

/// Exponential backoff with a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: 0,
        }
    }

    /// Delay before the next attempt; doubles each call up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

/// Result of one claim cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing claimable.
    Idle,
    /// A job ran; `succeeded` is the execution outcome.
    Executed { succeeded: bool },
    /// Claimed but refused locally (unsupported backend type).
    Rejected,
    /// Claimed but `start_job` failed; the queue will hand it out again.
    Abandoned,
    /// Claiming failed.
    RemoteError(QueueError),
    Cancelled,
}

#[derive(Clone, Copy)]
enum Report<'a> {
    Completed(&'a JobReport),
    Failed(&'a JobFailure),
}

impl Report<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completion",
            Self::Failed(_) => "failure",
        }
    }
}

pub struct JobLoop {
    queue: Arc<dyn RemoteQueue>,
    registry: BackendRegistry,
    config: HarnessConfig,
    session: SessionInfo,
    snapshot: SnapshotHandle,
    foreground: Foreground,
    view: Option<watch::Receiver<Arc<StatusSnapshot>>>,
}

impl JobLoop {
    pub fn new(
        queue: Arc<dyn RemoteQueue>,
        registry: BackendRegistry,
        config: HarnessConfig,
        session: SessionInfo,
        snapshot: SnapshotHandle,
        foreground: Foreground,
    ) -> Self {
        Self {
            queue,
            registry,
            config,
            session,
            snapshot,
            foreground,
            view: None,
        }
    }

    /// Read the content-area size for new jobs from published snapshots.
    pub fn with_view(mut self, view: watch::Receiver<Arc<StatusSnapshot>>) -> Self {
        self.view = Some(view);
        self
    }

    fn content_size(&self) -> Option<Viewport> {
        self.view.as_ref().and_then(|v| v.borrow().layout.content_size())
    }

    fn poll_wait(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.config.poll_interval + Duration::from_millis(jitter)
    }

    fn claim_request(&self) -> ClaimRequest {
        ClaimRequest {
            habitat_id: self.session.habitat_id.clone(),
            queue_id: self.session.queue_id.clone(),
            worker_id: self.session.worker_id.clone(),
            backend_types: self.registry.names(),
        }
    }

    /// Poll and execute until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.poll_interval, self.config.max_backoff);
        info!(backends = ?self.registry.names(), "job loop started");
        while !cancel.is_cancelled() {
            let outcome = self.run_cycle(&cancel).await;
            let wait = match &outcome {
                CycleOutcome::Cancelled => break,
                CycleOutcome::Idle | CycleOutcome::Abandoned => {
                    backoff.reset();
                    self.poll_wait()
                }
                CycleOutcome::Executed { .. } | CycleOutcome::Rejected => {
                    backoff.reset();
                    Duration::ZERO
                }
                CycleOutcome::RemoteError(QueueError::Unauthorized { .. }) => backoff.cap(),
                CycleOutcome::RemoteError(_) => backoff.next_delay(),
            };
            if wait.is_zero() {
                continue;
            }
            debug!(wait_ms = wait.as_millis() as u64, "waiting before next claim");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }
        debug!("job loop stopped");
    }

    /// One claim attempt and, if a job was claimed, its whole lifecycle.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleOutcome {
        self.snapshot.status(HarnessStatus::Polling);
        let request = self.claim_request();
        let claimed = tokio::select! {
            _ = cancel.cancelled() => return CycleOutcome::Cancelled,
            claimed = call_with_timeout(self.config.remote_call_timeout, self.queue.claim_job(&request)) => claimed,
        };
        let job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.snapshot.status(HarnessStatus::Idle);
                return CycleOutcome::Idle;
            }
            Err(e) => {
                self.record_remote_error(&e);
                return CycleOutcome::RemoteError(e);
            }
        };
        info!(job_id = %job.id, backend = %job.backend_type, "claimed job");
        self.process(job, cancel).await
    }

    fn record_remote_error(&self, err: &QueueError) {
        match err {
            QueueError::Unauthorized { status } => {
                warn!(status, "queue rejected credentials");
                self.snapshot
                    .error(format!("authentication required (HTTP {status}); check the queue token"));
            }
            other => {
                warn!(error = %other, "claim failed");
                self.snapshot.error(format!("claim failed: {other}"));
            }
        }
        self.snapshot.status(HarnessStatus::Error);
    }

    async fn process(&self, job: Job, cancel: &CancellationToken) -> CycleOutcome {
        let Some(backend) = self.registry.get(&job.backend_type) else {
            warn!(job_id = %job.id, backend = %job.backend_type, "unsupported backend type, rejecting");
            let failure = JobFailure::new(
                FailureKind::UnsupportedBackend,
                format!(
                    "backend type {:?} is not supported by this worker (supported: {})",
                    job.backend_type,
                    self.registry.names().join(", ")
                ),
            );
            self.deliver(&job.id, Report::Failed(&failure), cancel).await;
            self.snapshot.send(SnapshotDelta::JobFinished { succeeded: false });
            return CycleOutcome::Rejected;
        };

        if let Err(e) = call_with_timeout(self.config.remote_call_timeout, self.queue.start_job(&job.id)).await {
            warn!(job_id = %job.id, error = %e, "failed to mark job started, abandoning it");
            self.snapshot.error(format!("could not start job {}: {e}", job.id));
            return CycleOutcome::Abandoned;
        }

        self.snapshot.send(SnapshotDelta::JobStarted {
            id: job.id.clone(),
            backend_type: job.backend_type.clone(),
            at: Utc::now(),
        });
        let deadline = job.deadline(self.config.default_job_timeout);
        let ctx = ExecutionContext::new(cancel.clone(), deadline, self.foreground.clone())
            .with_size(self.content_size());
        debug!(job_id = %job.id, deadline_ms = deadline.as_millis() as u64, "executing");

        let execution = backend.execute(&job, ctx);
        tokio::pin!(execution);
        let outcome = tokio::select! {
            outcome = &mut execution => outcome,
            _ = cancel.cancelled() => {
                info!(job_id = %job.id, "shutdown during execution, interrupting backend");
                self.foreground.interrupt();
                execution.await
            }
        };

        self.snapshot.status(HarnessStatus::Reporting);
        let succeeded = outcome.is_ok();
        match &outcome {
            Ok(report) => {
                info!(job_id = %job.id, duration_ms = report.duration_ms, "job completed");
                self.deliver(&job.id, Report::Completed(report), cancel).await;
            }
            Err(failure) => {
                warn!(job_id = %job.id, kind = %failure.kind, error = %failure.message, "job failed");
                self.deliver(&job.id, Report::Failed(failure), cancel).await;
            }
        }
        self.snapshot.send(SnapshotDelta::JobFinished { succeeded });
        CycleOutcome::Executed { succeeded }
    }

    async fn send_report(&self, job_id: &str, report: Report<'_>) -> Result<(), QueueError> {
        match report {
            Report::Completed(r) => self.queue.complete_job(job_id, r).await,
            Report::Failed(f) => self.queue.fail_job(job_id, f).await,
        }
    }

    /// Deliver a report, retrying transient failures. During shutdown,
    /// including a shutdown that starts between retries, at most one more
    /// attempt is made.
    async fn deliver(&self, job_id: &str, report: Report<'_>, cancel: &CancellationToken) -> bool {
        let mut attempts = if cancel.is_cancelled() {
            1
        } else {
            self.config.report_attempts.max(1)
        };
        let mut backoff = Backoff::new(REPORT_RETRY_BASE, self.config.max_backoff);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = call_with_timeout(self.config.remote_call_timeout, self.send_report(job_id, report)).await;
            match result {
                Ok(()) => {
                    debug!(job_id, attempt, kind = report.kind(), "report delivered");
                    return true;
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(job_id, attempt, error = %e, "report failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(job_id, "shutting down, making one last report attempt");
                            attempts = attempt + 1;
                        }
                        _ = sleep(backoff.next_delay()) => {}
                    }
                }
                Err(e) => {
                    warn!(job_id, attempt, error = %e, kind = report.kind(), "report lost");
                    break;
                }
            }
        }
        self.snapshot
            .error(format!("{} report for job {job_id} was not delivered", report.kind()));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<_> = (0..5).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_survives_many_failures() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_secs(30));
        for _ in 0..100 {
            assert!(b.next_delay() <= Duration::from_secs(30));
        }
    }
}
