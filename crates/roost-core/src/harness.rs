//! Top-level owner of a harness run.
//!
//! [`Harness::run`] takes over the terminal, registers the worker, starts
//! the job loop, heartbeat, input router and render loop as independent
//! tasks, then waits for a shutdown trigger and hands everything to the
//! [`ShutdownCoordinator`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::BackendRegistry;
use crate::bundle::BundleSummary;
use crate::config::HarnessConfig;
use crate::display::Display;
use crate::error::HarnessError;
use crate::foreground::Foreground;
use crate::heartbeat::HeartbeatTask;
use crate::input::{self, InputRouter};
use crate::job_loop::{Backoff, JobLoop};
use crate::queue::types::BundleRef;
use crate::queue::{QueueError, RemoteQueue, WorkerRegistration, call_with_timeout};
use crate::shutdown::{RunningTasks, ShutdownCoordinator, ShutdownReason, ShutdownReport, ShutdownTrigger};
use crate::snapshot::{self, HarnessStatus, SessionInfo, StatusSnapshot};
use crate::terminal::{TerminalController, TerminalOut};

const REGISTER_RETRY_BASE: Duration = Duration::from_secs(1);

pub struct Harness {
    config: HarnessConfig,
    queue: Arc<dyn RemoteQueue>,
    registry: BackendRegistry,
    bundle: BundleSummary,
    session: SessionInfo,
    out: TerminalOut,
    foreground: Foreground,
    hostname: Option<String>,
}

impl Harness {
    pub fn new(
        config: HarnessConfig,
        queue: Arc<dyn RemoteQueue>,
        registry: BackendRegistry,
        bundle: BundleSummary,
        session: SessionInfo,
    ) -> Self {
        Self {
            config,
            queue,
            registry,
            bundle,
            session,
            out: TerminalOut::stdout(),
            foreground: Foreground::new(),
            hostname: None,
        }
    }

    /// Where backend passthrough and the overlay are written.
    pub fn with_output(mut self, out: TerminalOut) -> Self {
        self.out = out;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn foreground(&self) -> &Foreground {
        &self.foreground
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Check every registered backend can start.
    pub async fn preflight(&self) -> Result<(), HarnessError> {
        if self.registry.is_empty() {
            return Err(HarnessError::NoBackends);
        }
        for backend in self.registry.iter() {
            backend
                .preflight()
                .await
                .map_err(|source| HarnessError::BackendUnavailable {
                    backend: backend.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    fn registration(&self) -> WorkerRegistration {
        let bundle = (!self.bundle.name.is_empty()).then(|| BundleRef {
            name: self.bundle.name.clone(),
            version: self.bundle.version.clone(),
        });
        WorkerRegistration {
            worker_id: self.session.worker_id.clone(),
            habitat_id: self.session.habitat_id.clone(),
            queue_id: self.session.queue_id.clone(),
            backend_types: self.registry.names(),
            hostname: self.hostname.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            bundle,
        }
    }

    /// Register the worker, retrying transient failures until cancelled.
    pub async fn register(&self, cancel: &CancellationToken) -> Result<(), HarnessError> {
        let registration = self.registration();
        let mut backoff = Backoff::new(REGISTER_RETRY_BASE, self.config.max_backoff);
        loop {
            let result = call_with_timeout(
                self.config.remote_call_timeout,
                self.queue.register_worker(&registration),
            )
            .await;
            match result {
                Ok(()) => {
                    info!(worker_id = %registration.worker_id, "worker registered");
                    return Ok(());
                }
                Err(QueueError::Unauthorized { status }) => {
                    return Err(HarnessError::Unauthorized { status });
                }
                Err(e) if e.is_transient() => {
                    let wait = backoff.next_delay();
                    warn!(error = %e, wait_ms = wait.as_millis() as u64, "registration failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(HarnessError::Registration("cancelled before registration completed".into()));
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => return Err(HarnessError::Registration(e.to_string())),
            }
        }
    }

    /// Run against the real terminal until shut down.
    pub async fn run(self, cancel: CancellationToken) -> Result<ShutdownReport, HarnessError> {
        self.preflight().await?;
        let controller = TerminalController::enter(self.out.clone(), self.config.sidebar_enabled)?;
        let input = input::spawn_stdin_reader();
        self.run_with(controller, input, cancel).await
    }

    /// Run with an already-entered terminal and an input source.
    ///
    /// The overlay, input router and signal watcher start before
    /// registration, so the quit chord and signals work while the queue
    /// is unreachable.
    pub async fn run_with(
        self,
        controller: TerminalController,
        input: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<ShutdownReport, HarnessError> {
        let initial = StatusSnapshot::new(
            self.bundle.clone(),
            self.session.clone(),
            self.registry.names(),
            controller.layout(),
            self.config.sidebar_enabled,
            Utc::now(),
        );
        let (owner, handle, reader) = snapshot::channel(initial);
        let owner = tokio::spawn(owner.run());

        let trigger = ShutdownTrigger::new(cancel.clone());
        let (display_tx, display_rx) = mpsc::unbounded_channel();

        let display = Display::new(
            controller,
            reader.clone(),
            handle.clone(),
            self.foreground.clone(),
            display_rx,
            self.config.render_tick,
        );
        let display = tokio::spawn(display.run(cancel.clone()));
        let router = InputRouter::new(self.foreground.clone(), handle.clone(), display_tx, trigger.clone());

        let mut tasks = vec![
            ("input", tokio::spawn(router.run(input, cancel.clone()))),
            ("signals", tokio::spawn(watch_signals(trigger.clone()))),
        ];

        let registered = match self.register(&cancel).await {
            Ok(()) => true,
            Err(_) if trigger.is_fired() => {
                info!("shutdown requested before registration completed");
                false
            }
            Err(e) => {
                cancel.cancel();
                for (_, task) in tasks {
                    task.abort();
                }
                // Dropping the controller restores the terminal.
                drop(display.await);
                owner.abort();
                return Err(e);
            }
        };

        if registered {
            handle.status(HarnessStatus::Idle);
            let job_loop = JobLoop::new(
                Arc::clone(&self.queue),
                self.registry.clone(),
                self.config.clone(),
                self.session.clone(),
                handle.clone(),
                self.foreground.clone(),
            )
            .with_view(reader.clone());
            let heartbeat = HeartbeatTask::new(
                Arc::clone(&self.queue),
                self.session.worker_id.clone(),
                self.config.heartbeat_interval,
                self.config.remote_call_timeout,
                handle.clone(),
                reader.clone(),
            );
            tasks.push(("job_loop", tokio::spawn(job_loop.run(cancel.clone()))));
            tasks.push(("heartbeat", tokio::spawn(heartbeat.run(cancel.clone()))));
            info!(
                worker_id = %self.session.worker_id,
                backends = ?self.registry.names(),
                "harness running"
            );
        }

        trigger.cancelled().await;

        let coordinator = ShutdownCoordinator::new(
            trigger,
            self.foreground.clone(),
            self.registry.clone(),
            Arc::clone(&self.queue),
            self.session.worker_id.clone(),
        )
        .with_grace(self.config.shutdown_grace)
        .with_remote_call_timeout(self.config.remote_call_timeout)
        .with_registered(registered);

        Ok(coordinator
            .run(RunningTasks {
                tasks,
                display: Some(display),
                owner,
                snapshot: handle,
                reader,
            })
            .await)
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("session", &self.session)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

/// Turn SIGTERM, SIGHUP and SIGINT into a shutdown.
#[cfg(unix)]
async fn watch_signals(trigger: ShutdownTrigger) {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut term), Ok(mut hup), Ok(mut int)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
        signal(SignalKind::interrupt()),
    ) else {
        warn!("cannot install signal handlers; only the quit chord will stop roost");
        return;
    };
    let name = tokio::select! {
        _ = trigger.cancelled() => return,
        _ = term.recv() => "SIGTERM",
        _ = hup.recv() => "SIGHUP",
        _ = int.recv() => "SIGINT",
    };
    trigger.fire(ShutdownReason::Signal(name.to_string()));
}

#[cfg(not(unix))]
async fn watch_signals(trigger: ShutdownTrigger) {
    tokio::select! {
        _ = trigger.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if result.is_ok() {
                trigger.fire(ShutdownReason::Signal("ctrl-c".to_string()));
            }
        }
    }
}
