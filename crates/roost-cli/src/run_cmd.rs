//! `roost run`: wire the core together and run until shut down.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use roost_core::backend::interactive::{InteractiveBackend, InteractiveConfig};
use roost_core::backend::subprocess::SubprocessBackend;
use roost_core::backend::{BackendIo, BackendRegistry};
use roost_core::bundle::BundleSummary;
use roost_core::queue::HttpQueue;
use roost_core::shutdown::ShutdownReport;
use roost_core::terminal::TerminalOut;
use roost_core::transcript::{JsonlTranscript, TranscriptSink};
use roost_core::Harness;

use crate::config::RoostConfig;

/// Build the backend registry from resolved config.
///
/// The subprocess backend is always present; the interactive backend
/// only when enabled.
pub fn build_registry(config: &RoostConfig, io: BackendIo) -> BackendRegistry {
    let mut builder = BackendRegistry::builder()
        .register(SubprocessBackend::new(io.clone()).with_grace(config.harness.shutdown_grace));
    if let Some(interactive) = &config.interactive {
        let interactive = InteractiveConfig {
            grace: config.harness.shutdown_grace,
            ..interactive.clone()
        };
        builder = builder.register(InteractiveBackend::new(interactive, io));
    }
    builder.build()
}

/// Load the bundle summary, or an empty one when no asset dir is set.
pub fn load_bundle(config: &RoostConfig) -> Result<BundleSummary> {
    match &config.asset_dir {
        Some(dir) => BundleSummary::load(dir),
        None => Ok(BundleSummary::default()),
    }
}

/// Run the harness against the real terminal.
pub async fn run(config: RoostConfig) -> Result<ShutdownReport> {
    let bundle = load_bundle(&config)?;
    let transcript: Arc<dyn TranscriptSink> = Arc::new(JsonlTranscript::open(&config.transcript)?);
    let out = TerminalOut::stdout();
    let registry = build_registry(&config, BackendIo::new(out.clone(), transcript));
    let queue = HttpQueue::new(config.queue.clone()).context("failed to set up queue client")?;

    info!(
        worker_id = %config.session.worker_id,
        habitat = %config.session.habitat_id,
        queue = %config.session.queue_id,
        backends = ?registry.names(),
        transcript = %config.transcript.display(),
        "starting roost"
    );

    let mut harness = Harness::new(
        config.harness.clone(),
        Arc::new(queue),
        registry,
        bundle,
        config.session.clone(),
    )
    .with_output(out);
    if let Ok(host) = std::env::var("HOSTNAME") {
        harness = harness.with_hostname(host);
    }

    let report = harness.run(CancellationToken::new()).await?;
    Ok(report)
}

/// One-line summary printed after the terminal is restored.
pub fn summary(report: &ShutdownReport) -> String {
    let mut line = format!(
        "roost stopped ({}): {} completed, {} failed",
        report.reason, report.counters.jobs_completed, report.counters.jobs_failed
    );
    if !report.deregistered {
        line.push_str("; worker was not deregistered");
    }
    line
}
