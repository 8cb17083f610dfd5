//! Setup-class failures: the only errors that end the harness.

use crate::backend::LaunchError;

/// Exit status used for setup failures (`EX_USAGE` from sysexits.h).
pub const EX_USAGE: i32 = 64;

/// A failure that prevents the harness from starting at all.
///
/// Everything else (remote hiccups, failed jobs, misbehaving processes) is
/// scoped to a single call or job and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("roost requires an interactive terminal (stdin and stdout must be a TTY)")]
    NotATerminal,

    #[error("no execution backends are registered")]
    NoBackends,

    #[error("backend {backend:?} cannot start: {source}")]
    BackendUnavailable {
        backend: String,
        #[source]
        source: LaunchError,
    },

    #[error("worker registration rejected: authentication required (status {status})")]
    Unauthorized { status: u16 },

    #[error("worker registration failed: {0}")]
    Registration(String),

    #[error("terminal setup failed: {0}")]
    Terminal(#[source] std::io::Error),
}

impl HarnessError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        EX_USAGE
    }
}
