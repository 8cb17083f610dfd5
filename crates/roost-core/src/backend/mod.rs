//! Execution backends: how a claimed job actually runs.
//!
//! Two variants implement [`Backend`]:
//!
//! - [`interactive::InteractiveBackend`] keeps a conversational CLI alive
//!   inside a pseudo-terminal and feeds it one prompt per job.
//! - [`subprocess::SubprocessBackend`] runs a fresh `sh -c` per job.
//!
//! Both stream raw output to the terminal and the transcript while the
//! job runs and install themselves in the [`Foreground`] slot so the
//! operator's keystrokes and interrupts reach them.

pub mod interactive;
pub mod launch;
pub mod registry;
pub mod subprocess;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::foreground::Foreground;
use crate::job::{Job, JobOutcome};
use crate::process::Termination;
use crate::terminal::{TerminalOut, Viewport};
use crate::transcript::TranscriptSink;

pub use launch::LaunchError;
pub use registry::{BackendRegistry, BackendRegistryBuilder};

/// Per-job inputs handed to [`Backend::execute`].
#[derive(Clone)]
pub struct ExecutionContext {
    /// Cancelled when the harness shuts down.
    pub cancel: CancellationToken,
    /// Execution deadline for this job.
    pub deadline: Duration,
    /// Current size of the content area, if known.
    pub size: Option<Viewport>,
    pub foreground: Foreground,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken, deadline: Duration, foreground: Foreground) -> Self {
        Self {
            cancel,
            deadline,
            size: None,
            foreground,
        }
    }

    pub fn with_size(mut self, size: Option<Viewport>) -> Self {
        self.size = size;
        self
    }
}

/// Where backend output goes besides the report.
#[derive(Clone)]
pub struct BackendIo {
    pub out: TerminalOut,
    pub transcript: Arc<dyn TranscriptSink>,
}

impl BackendIo {
    pub fn new(out: TerminalOut, transcript: Arc<dyn TranscriptSink>) -> Self {
        Self { out, transcript }
    }

    /// Copy a chunk to the terminal and the transcript; failures of either
    /// are logged and otherwise ignored.
    pub fn emit(&self, stream: &str, terminal_bytes: &[u8], raw: &[u8]) {
        if let Err(e) = self.out.write_bytes(terminal_bytes) {
            tracing::trace!(error = %e, "terminal passthrough write failed");
        }
        if let Err(e) = self.transcript.append(stream, raw) {
            tracing::debug!(stream, error = %e, "transcript append failed");
        }
    }
}

/// A way of executing jobs of one backend type.
///
/// Implementations must be object-safe so the registry can hold
/// `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend type name matched against [`Job::backend_type`].
    fn name(&self) -> &str;

    /// Setup-time check that the backend can start at all.
    async fn preflight(&self) -> Result<(), LaunchError>;

    /// Run one job to completion, failure, timeout or cancellation.
    async fn execute(&self, job: &Job, ctx: ExecutionContext) -> JobOutcome;

    /// Stop any long-lived processes. Called once during shutdown.
    async fn shutdown(&self, _grace: Duration) -> Termination {
        Termination::AlreadyExited
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn Backend) {}
};
