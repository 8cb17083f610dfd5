//! Shared fakes for roost integration tests.
//!
//! - [`FakeQueue`]: in-memory [`RemoteQueue`] with scripted claims that
//!   records every call.
//! - [`RecordingTranscript`]: transcript sink that keeps chunks in memory.
//! - [`SharedBuffer`]: cloneable writer for capturing terminal output.
//! - [`ScriptedBackend`]: backend returning canned outcomes that tracks
//!   how many executions overlap.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use roost_core::backend::{Backend, ExecutionContext, LaunchError};
use roost_core::job::{FailureKind, Job, JobFailure, JobOutcome, JobReport};
use roost_core::queue::{ClaimRequest, Heartbeat, QueueError, RemoteQueue, WorkerRegistration};
use roost_core::snapshot::Counters;
use roost_core::transcript::TranscriptSink;

// ---------------------------------------------------------------------------
// FakeQueue
// ---------------------------------------------------------------------------

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueCall {
    Register(WorkerRegistration),
    Claim(ClaimRequest),
    Start(String),
    Complete(String, JobReport),
    Fail(String, JobFailure),
    Heartbeat(Heartbeat),
    Deregister(String, Counters),
}

#[derive(Default)]
struct FakeQueueState {
    claims: VecDeque<Result<Option<Job>, QueueError>>,
    register_errors: VecDeque<QueueError>,
    start_errors: VecDeque<QueueError>,
    report_errors: VecDeque<QueueError>,
    heartbeat_errors: VecDeque<QueueError>,
    calls: Vec<QueueCall>,
}

/// In-memory queue. Claims are served from a script; once it runs out
/// every claim returns "no job".
#[derive(Clone, Default)]
pub struct FakeQueue {
    state: Arc<Mutex<FakeQueueState>>,
}

impl FakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeQueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn push_job(&self, job: Job) -> &Self {
        self.lock().claims.push_back(Ok(Some(job)));
        self
    }

    pub fn push_claim_error(&self, err: QueueError) -> &Self {
        self.lock().claims.push_back(Err(err));
        self
    }

    pub fn fail_next_register(&self, err: QueueError) -> &Self {
        self.lock().register_errors.push_back(err);
        self
    }

    pub fn fail_next_start(&self, err: QueueError) -> &Self {
        self.lock().start_errors.push_back(err);
        self
    }

    /// Fail the next complete/fail report with `err`.
    pub fn fail_next_report(&self, err: QueueError) -> &Self {
        self.lock().report_errors.push_back(err);
        self
    }

    pub fn fail_next_heartbeat(&self, err: QueueError) -> &Self {
        self.lock().heartbeat_errors.push_back(err);
        self
    }

    pub fn calls(&self) -> Vec<QueueCall> {
        self.lock().calls.clone()
    }

    pub fn claims(&self) -> usize {
        self.count(|c| matches!(c, QueueCall::Claim(_)))
    }

    pub fn starts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                QueueCall::Start(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> Vec<(String, JobReport)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                QueueCall::Complete(id, report) => Some((id, report)),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<(String, JobFailure)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                QueueCall::Fail(id, failure) => Some((id, failure)),
                _ => None,
            })
            .collect()
    }

    pub fn heartbeats(&self) -> usize {
        self.count(|c| matches!(c, QueueCall::Heartbeat(_)))
    }

    pub fn deregistrations(&self) -> Vec<(String, Counters)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                QueueCall::Deregister(id, counters) => Some((id, counters)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&QueueCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: QueueCall) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl RemoteQueue for FakeQueue {
    async fn register_worker(&self, registration: &WorkerRegistration) -> Result<(), QueueError> {
        self.record(QueueCall::Register(registration.clone()));
        match self.lock().register_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn claim_job(&self, request: &ClaimRequest) -> Result<Option<Job>, QueueError> {
        self.record(QueueCall::Claim(request.clone()));
        self.lock().claims.pop_front().unwrap_or(Ok(None))
    }

    async fn start_job(&self, job_id: &str) -> Result<(), QueueError> {
        self.record(QueueCall::Start(job_id.to_string()));
        match self.lock().start_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn complete_job(&self, job_id: &str, report: &JobReport) -> Result<(), QueueError> {
        self.record(QueueCall::Complete(job_id.to_string(), report.clone()));
        match self.lock().report_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fail_job(&self, job_id: &str, failure: &JobFailure) -> Result<(), QueueError> {
        self.record(QueueCall::Fail(job_id.to_string(), failure.clone()));
        match self.lock().report_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn heartbeat(&self, beat: &Heartbeat) -> Result<(), QueueError> {
        self.record(QueueCall::Heartbeat(beat.clone()));
        match self.lock().heartbeat_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn deregister_worker(&self, worker_id: &str, counters: &Counters) -> Result<(), QueueError> {
        self.record(QueueCall::Deregister(worker_id.to_string(), *counters));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingTranscript
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingTranscript {
    chunks: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingTranscript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn chunks(&self) -> Vec<(String, Vec<u8>)> {
        self.chunks.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Everything recorded for `stream`, joined and decoded lossily.
    pub fn text(&self, stream: &str) -> String {
        let bytes: Vec<u8> = self
            .chunks()
            .into_iter()
            .filter(|(s, _)| s == stream)
            .flat_map(|(_, b)| b)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl TranscriptSink for RecordingTranscript {
    fn append(&self, stream: &str, bytes: &[u8]) -> anyhow::Result<()> {
        self.chunks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((stream.to_string(), bytes.to_vec()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SharedBuffer
// ---------------------------------------------------------------------------

/// Cloneable in-memory writer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock().unwrap_or_else(|p| p.into_inner())).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Overlap {
    active: AtomicUsize,
    max_active: AtomicUsize,
    executions: AtomicUsize,
}

/// Backend that sleeps for a fixed time and returns scripted outcomes
/// (a default success once the script is exhausted). Honors cancellation.
#[derive(Clone)]
pub struct ScriptedBackend {
    name: String,
    delay: Duration,
    outcomes: Arc<Mutex<VecDeque<JobOutcome>>>,
    overlap: Arc<Overlap>,
}

impl ScriptedBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            outcomes: Arc::new(Mutex::new(VecDeque::new())),
            overlap: Arc::new(Overlap::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_outcome(&self, outcome: JobOutcome) -> &Self {
        self.outcomes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(outcome);
        self
    }

    pub fn executions(&self) -> usize {
        self.overlap.executions.load(Ordering::SeqCst)
    }

    /// Highest number of executions that were ever in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.overlap.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn preflight(&self) -> Result<(), LaunchError> {
        Ok(())
    }

    async fn execute(&self, job: &Job, ctx: ExecutionContext) -> JobOutcome {
        self.overlap.executions.fetch_add(1, Ordering::SeqCst);
        let now = self.overlap.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.overlap.max_active.fetch_max(now, Ordering::SeqCst);

        let cancelled = tokio::select! {
            _ = ctx.cancel.cancelled() => true,
            _ = tokio::time::sleep(self.delay) => false,
        };
        self.overlap.active.fetch_sub(1, Ordering::SeqCst);

        if cancelled {
            return Err(JobFailure::new(FailureKind::Cancelled, "harness shutting down"));
        }
        let scripted = self
            .outcomes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        scripted.unwrap_or_else(|| {
            Ok(JobReport {
                output: format!("ran {}", job.id),
                ..JobReport::default()
            })
        })
    }
}
