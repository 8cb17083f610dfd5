//! Ordered teardown of a running harness.
//!
//! Whatever triggers it (a signal, the quit chord, a double interrupt),
//! shutdown runs the same sequence: cancel every task, escalate the
//! foreground backend from SIGTERM to SIGKILL, join tasks, stop
//! long-lived backends, restore the terminal, then deregister with the
//! final counters. Everything after the cancel is best-effort.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendRegistry;
use crate::foreground::Foreground;
use crate::process::Termination;
use crate::queue::{RemoteQueue, call_with_timeout};
use crate::snapshot::{Counters, HarnessStatus, SnapshotHandle, StatusSnapshot};
use crate::terminal::TerminalController;

/// Extra time on top of the grace period for tasks to wind down.
const JOIN_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM, SIGHUP or SIGINT delivered to the harness.
    Signal(String),
    /// Cancelled by the embedding program.
    External,
    Quit,
    DoubleInterrupt,
    IdleInterrupt,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "received {name}"),
            Self::External => f.write_str("cancelled"),
            Self::Quit => f.write_str("quit chord"),
            Self::DoubleInterrupt => f.write_str("interrupt pressed twice"),
            Self::IdleInterrupt => f.write_str("interrupt while idle"),
        }
    }
}

/// Cloneable "stop now" switch. The first reason recorded wins.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownTrigger {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn fire(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                info!(%reason, "shutdown requested");
                *slot = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_fired(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Outcome of a shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    /// How the foreground backend's process group went away.
    pub termination: Termination,
    pub counters: Counters,
    pub terminal_restored: bool,
    pub deregistered: bool,
}

/// Handles of everything the harness started.
pub struct RunningTasks {
    pub tasks: Vec<(&'static str, JoinHandle<()>)>,
    pub display: Option<JoinHandle<TerminalController>>,
    pub owner: JoinHandle<StatusSnapshot>,
    pub snapshot: SnapshotHandle,
    pub reader: watch::Receiver<Arc<StatusSnapshot>>,
}

pub struct ShutdownCoordinator {
    trigger: ShutdownTrigger,
    foreground: Foreground,
    registry: BackendRegistry,
    queue: Arc<dyn RemoteQueue>,
    worker_id: String,
    grace: Duration,
    remote_call_timeout: Duration,
    registered: bool,
}

impl ShutdownCoordinator {
    pub fn new(
        trigger: ShutdownTrigger,
        foreground: Foreground,
        registry: BackendRegistry,
        queue: Arc<dyn RemoteQueue>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            trigger,
            foreground,
            registry,
            queue,
            worker_id: worker_id.into(),
            grace: Duration::from_secs(5),
            remote_call_timeout: Duration::from_secs(10),
            registered: true,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_remote_call_timeout(mut self, timeout: Duration) -> Self {
        self.remote_call_timeout = timeout;
        self
    }

    /// Whether the worker ever registered. An unregistered worker is not
    /// deregistered.
    pub fn with_registered(mut self, registered: bool) -> Self {
        self.registered = registered;
        self
    }

    /// Run the teardown sequence.
    pub async fn run(self, running: RunningTasks) -> ShutdownReport {
        let RunningTasks {
            tasks,
            display,
            owner,
            snapshot,
            reader,
        } = running;

        // 1. Cancel everything.
        if !self.trigger.is_fired() {
            self.trigger.fire(ShutdownReason::External);
        }
        let reason = self.trigger.reason().unwrap_or(ShutdownReason::External);
        snapshot.status(HarnessStatus::ShuttingDown);

        // 2-4. Escalate the foreground process group.
        let termination = self.foreground.terminate(self.grace).await;
        if termination == Termination::Forced {
            warn!("foreground backend ignored SIGTERM and was killed");
        }

        // 5. Join tasks, bounded.
        let join_limit = self.grace + JOIN_SLACK;
        for (name, mut task) in tasks {
            match tokio::time::timeout(join_limit, &mut task).await {
                Ok(Ok(())) => debug!(task = name, "task finished"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task failed"),
                Err(_) => {
                    warn!(task = name, "task did not stop in time, aborting");
                    task.abort();
                }
            }
        }
        for backend in self.registry.iter() {
            let outcome = backend.shutdown(self.grace).await;
            debug!(backend = backend.name(), ?outcome, "backend shut down");
        }

        // 6. Restore the terminal.
        let terminal_restored = match display {
            Some(mut task) => match tokio::time::timeout(join_limit, &mut task).await {
                Ok(Ok(mut controller)) => {
                    controller.restore();
                    controller.is_restored()
                }
                Ok(Err(e)) => {
                    // The controller's Drop ran while the task unwound.
                    warn!(error = %e, "display task failed");
                    true
                }
                Err(_) => {
                    warn!("display task did not stop in time, aborting");
                    task.abort();
                    let _ = task.await;
                    true
                }
            },
            None => false,
        };

        // 7. Final counters, then deregister.
        drop(snapshot);
        let counters = match tokio::time::timeout(JOIN_SLACK, owner).await {
            Ok(Ok(final_snapshot)) => final_snapshot.counters,
            _ => {
                debug!("snapshot owner still running, using last published counters");
                reader.borrow().counters
            }
        };
        let deregistered = if !self.registered {
            false
        } else {
            match call_with_timeout(
                self.remote_call_timeout,
                self.queue.deregister_worker(&self.worker_id, &counters),
            )
            .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "deregistration failed");
                    false
                }
            }
        };

        info!(
            %reason,
            ?termination,
            jobs_completed = counters.jobs_completed,
            jobs_failed = counters.jobs_failed,
            deregistered,
            "harness stopped"
        );
        ShutdownReport {
            reason,
            termination,
            counters,
            terminal_restored,
            deregistered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins() {
        let trigger = ShutdownTrigger::new(CancellationToken::new());
        assert!(!trigger.is_fired());
        trigger.fire(ShutdownReason::Quit);
        trigger.fire(ShutdownReason::Signal("SIGTERM".into()));
        assert!(trigger.is_fired());
        assert_eq!(trigger.reason(), Some(ShutdownReason::Quit));
    }

    #[tokio::test]
    async fn clones_share_the_token() {
        let trigger = ShutdownTrigger::new(CancellationToken::new());
        let other = trigger.clone();
        tokio::spawn(async move { other.fire(ShutdownReason::IdleInterrupt) });
        tokio::time::timeout(Duration::from_secs(1), trigger.cancelled())
            .await
            .unwrap();
        assert_eq!(trigger.reason(), Some(ShutdownReason::IdleInterrupt));
    }

    #[test]
    fn reasons_read_well_in_logs() {
        assert_eq!(ShutdownReason::Signal("SIGHUP".into()).to_string(), "received SIGHUP");
        assert_eq!(ShutdownReason::DoubleInterrupt.to_string(), "interrupt pressed twice");
    }
}
