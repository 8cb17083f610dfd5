//! `roost check`: preflight without claiming work.

use std::fmt;

use roost_core::backend::{BackendIo, BackendRegistry};
use roost_core::terminal::{self, Layout, TerminalOut, Viewport};
use roost_core::transcript::NullTranscript;

use crate::config::RoostConfig;
use crate::run_cmd;

/// Result of one preflight check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl Check {
    fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.ok { "ok  " } else { "FAIL" };
        write!(f, "[{mark}] {:<12} {}", self.name, self.detail)
    }
}

fn terminal_check(interactive: bool, size: Option<Viewport>, sidebar_enabled: bool) -> Check {
    if !interactive {
        return Check::fail("terminal", "stdin/stdout is not a TTY; `roost run` needs an interactive terminal");
    }
    match Layout::compute(size, sidebar_enabled) {
        Layout::Passthrough { viewport: Some(vp) } => Check::pass(
            "terminal",
            format!("{}x{}: too small for the status bar, output will be passthrough", vp.cols, vp.rows),
        ),
        Layout::Passthrough { viewport: None } => {
            Check::pass("terminal", "size unknown, output will be passthrough")
        }
        Layout::Overlay { viewport, sidebar } => Check::pass(
            "terminal",
            format!(
                "{}x{}, status bar{}",
                viewport.cols,
                viewport.rows,
                if sidebar.is_some() { " and sidebar" } else { "" }
            ),
        ),
    }
}

async fn backend_checks(registry: &BackendRegistry) -> Vec<Check> {
    if registry.is_empty() {
        return vec![Check::fail("backends", "no backends enabled")];
    }
    let mut checks = Vec::with_capacity(registry.len());
    for backend in registry.iter() {
        let name = format!("backend:{}", backend.name());
        checks.push(match backend.preflight().await {
            Ok(()) => Check::pass(name, "ready"),
            Err(e) => Check::fail(name, e.to_string()),
        });
    }
    checks
}

/// Run every check against resolved config and an explicit terminal state.
pub async fn checks(config: &RoostConfig, interactive: bool, size: Option<Viewport>) -> Vec<Check> {
    let mut out = vec![Check::pass(
        "queue",
        format!(
            "{} (habitat {}, queue {})",
            config.queue.base_url, config.session.habitat_id, config.session.queue_id
        ),
    )];
    out.push(terminal_check(interactive, size, config.harness.sidebar_enabled));

    out.push(match run_cmd::load_bundle(config) {
        Ok(bundle) if bundle.name.is_empty() => Check::pass("bundle", "none configured"),
        Ok(bundle) => Check::pass("bundle", format!("{} {}", bundle.name, bundle.version)),
        Err(e) => Check::fail("bundle", format!("{e:#}")),
    });

    let io = BackendIo::new(TerminalOut::null(), std::sync::Arc::new(NullTranscript));
    let registry = run_cmd::build_registry(config, io);
    out.extend(backend_checks(&registry).await);
    out
}

/// Print the checks; returns whether all passed.
pub async fn run_check(config: &RoostConfig) -> bool {
    let results = checks(config, terminal::is_interactive(), terminal::probe_size()).await;
    for check in &results {
        println!("{check}");
    }
    results.iter().all(|c| c.ok)
}
