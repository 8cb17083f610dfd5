//! Log subscriber setup.
//!
//! The terminal belongs to the backend while roost runs, so logs go to a
//! file instead of stderr.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

use crate::config;

/// Default log file: `$XDG_STATE_HOME/roost/roost.log`.
pub fn default_log_path() -> PathBuf {
    config::state_dir().join("roost.log")
}

/// Install the global subscriber writing to `path` (or the default log
/// file). `RUST_LOG` controls the filter; the default level is `info`.
pub fn init(path: Option<&Path>) -> Result<PathBuf> {
    let path = path.map_or_else(default_log_path, Path::to_path_buf);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))?;
    Ok(path)
}

/// Subscriber for commands that keep the terminal (`init`, `check`).
pub fn init_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_path_is_under_state_dir() {
        let _lock = crate::test_util::lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let orig = std::env::var("XDG_STATE_HOME").ok();
        unsafe { std::env::set_var("XDG_STATE_HOME", tmp.path()) };

        let path = default_log_path();

        match orig {
            Some(v) => unsafe { std::env::set_var("XDG_STATE_HOME", v) },
            None => unsafe { std::env::remove_var("XDG_STATE_HOME") },
        }
        assert_eq!(path, tmp.path().join("roost").join("roost.log"));
    }
}
