//! Already-resolved harness settings.
//!
//! The core never reads configuration files; the CLI resolves flags, env
//! vars and the config file into a [`HarnessConfig`] before start.

use std::time::Duration;

/// Intervals, timeouts and UI preferences for one harness run.
///
/// Three timeout scopes are kept apart on purpose: `remote_call_timeout`
/// bounds a single queue API call, `default_job_timeout` bounds one job's
/// execution, and `shutdown_grace` bounds the graceful phase of process
/// termination at exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Base wait between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Upper bound of the random jitter added to `poll_interval`.
    pub poll_jitter: Duration,
    /// Cap for exponential backoff after remote failures.
    pub max_backoff: Duration,
    /// Period of the liveness report.
    pub heartbeat_interval: Duration,
    /// Bound for any single remote queue call.
    pub remote_call_timeout: Duration,
    /// Execution deadline for jobs that do not declare their own.
    pub default_job_timeout: Duration,
    /// Time a backend process group gets between SIGTERM and SIGKILL.
    pub shutdown_grace: Duration,
    /// Redraw tick for the status overlay (also advances the clock).
    pub render_tick: Duration,
    /// Attempts for complete/fail reports before giving up.
    pub report_attempts: u32,
    /// Whether the sidebar panel is shown when it fits.
    pub sidebar_enabled: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            poll_jitter: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            remote_call_timeout: Duration::from_secs(10),
            default_job_timeout: Duration::from_secs(30 * 60),
            shutdown_grace: Duration::from_secs(5),
            render_tick: Duration::from_secs(1),
            report_attempts: 3,
            sidebar_enabled: true,
        }
    }
}
