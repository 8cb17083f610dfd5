//! Remote job queue: the trait the harness talks to and its HTTP client.

pub mod http;
pub mod types;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::job::{Job, JobFailure, JobReport};
use crate::snapshot::Counters;

pub use http::{HttpQueue, HttpQueueConfig};
pub use types::{ClaimRequest, Heartbeat, WorkerRegistration};

/// Failure of one remote call, classified for retry decisions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// 401/403. Nothing will change until the operator fixes credentials.
    #[error("authentication required (status {status})")]
    Unauthorized { status: u16 },

    /// The queue refused this specific call (e.g. the job was reclaimed).
    #[error("rejected by queue (status {status}): {body}")]
    Rejected { status: u16, body: String },

    /// 5xx, network failure or timeout. Worth retrying.
    #[error("queue unavailable: {0}")]
    Transient(String),

    #[error("malformed queue response: {0}")]
    Malformed(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Operations the harness needs from the remote queue.
#[async_trait]
pub trait RemoteQueue: Send + Sync {
    async fn register_worker(&self, registration: &WorkerRegistration) -> Result<(), QueueError>;

    /// Claim the next job for one of `request.backend_types`; `None` when
    /// the queue is empty.
    async fn claim_job(&self, request: &ClaimRequest) -> Result<Option<Job>, QueueError>;

    async fn start_job(&self, job_id: &str) -> Result<(), QueueError>;

    async fn complete_job(&self, job_id: &str, report: &JobReport) -> Result<(), QueueError>;

    async fn fail_job(&self, job_id: &str, failure: &JobFailure) -> Result<(), QueueError>;

    async fn heartbeat(&self, beat: &Heartbeat) -> Result<(), QueueError>;

    async fn deregister_worker(&self, worker_id: &str, counters: &Counters) -> Result<(), QueueError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn RemoteQueue) {}
};

/// Bound a remote call; expiry counts as a transient failure.
pub async fn call_with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, QueueError>>,
) -> Result<T, QueueError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(QueueError::Transient(format!(
            "remote call timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
