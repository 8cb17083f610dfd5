//! Claimed jobs and the payloads reported back for them.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One claimed unit of work.
///
/// Owned exclusively by the job loop from claim until it is reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Backend type the job was queued for (e.g. `"interactive"`).
    #[serde(alias = "backend")]
    pub backend_type: String,
    /// Instruction already rendered by the remote side.
    #[serde(default)]
    pub instruction: Option<String>,
    /// Structured input; `command` and `prompt` fields are understood.
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    /// Raw script body.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Job {
    /// Create a job with only an id and a backend type.
    pub fn new(id: impl Into<String>, backend_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            backend_type: backend_type.into(),
            instruction: None,
            input: None,
            script: None,
            timeout_ms: None,
            timeout_seconds: None,
            working_dir: None,
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Declared timeout, if any. `timeout_ms` wins over `timeout_seconds`;
    /// zero means "not declared".
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .or_else(|| {
                self.timeout_seconds
                    .filter(|s| *s > 0)
                    .map(Duration::from_secs)
            })
    }

    /// Execution deadline: the declared timeout or `default`.
    pub fn deadline(&self, default: Duration) -> Duration {
        self.timeout().unwrap_or(default)
    }

    /// Non-empty string field of the structured input.
    pub fn input_field(&self, field: &str) -> Option<&str> {
        self.input
            .as_ref()
            .and_then(|v| v.get(field))
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    /// Non-empty rendered instruction.
    pub fn rendered_instruction(&self) -> Option<&str> {
        non_empty(self.instruction.as_deref())
    }

    /// Non-empty raw script.
    pub fn raw_script(&self) -> Option<&str> {
        non_empty(self.script.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

/// Successful job report: `{output, stdout, stderr, exit_code, duration_ms}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Why a job failed. Serialized as the `kind` field of a failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Claimed job names a backend this harness does not run.
    UnsupportedBackend,
    /// Nothing executable could be derived from the payload.
    MalformedPayload,
    /// The process exited with a non-zero status.
    ExitCode,
    /// The execution deadline expired.
    Timeout,
    /// The operator interrupted the job.
    Interrupted,
    /// The backend process died while the job was in flight.
    BackendExited,
    /// The backend could not be started for this harness run.
    BackendUnavailable,
    /// The harness is shutting down.
    Cancelled,
    /// Any other backend-side error.
    Backend,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnsupportedBackend => "unsupported_backend",
            Self::MalformedPayload => "malformed_payload",
            Self::ExitCode => "exit_code",
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
            Self::BackendExited => "backend_exited",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Cancelled => "cancelled",
            Self::Backend => "backend",
        };
        f.write_str(s)
    }
}

/// Failed job: the payload of a `fail-job` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    #[serde(rename = "error")]
    pub message: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Whatever was captured before the failure.
    #[serde(default)]
    pub report: Option<JobReport>,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            report: None,
        }
    }

    pub fn with_report(mut self, report: JobReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

/// Result of running one job on a backend.
pub type JobOutcome = Result<JobReport, JobFailure>;
