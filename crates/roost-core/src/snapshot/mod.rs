//! The status snapshot and its single owner.
//!
//! Tasks never mutate the snapshot directly. They send [`SnapshotDelta`]
//! messages through a [`SnapshotHandle`]; the [`SnapshotOwner`] applies
//! them one at a time in arrival order and publishes a fresh
//! `Arc<StatusSnapshot>` on a watch channel after each batch.

pub mod mcp;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::bundle::{BundleSummary, McpServerConfig};
use crate::terminal::layout::Layout;

pub use mcp::{McpServerStatus, derive_statuses};

/// Colour family for a status label; the renderer picks the actual SGR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Neutral,
    Good,
    Busy,
    Warn,
    Bad,
}

/// Short harness state shown in the bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessStatus {
    Starting,
    Idle,
    Polling,
    Running,
    Reporting,
    Error,
    ShuttingDown,
}

impl HarnessStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Running => "running",
            Self::Reporting => "reporting",
            Self::Error => "error",
            Self::ShuttingDown => "shutting down",
        }
    }

    pub fn tone(&self) -> Tone {
        match self {
            Self::Starting | Self::ShuttingDown => Tone::Neutral,
            Self::Idle | Self::Polling => Tone::Good,
            Self::Running | Self::Reporting => Tone::Busy,
            Self::Error => Tone::Bad,
        }
    }
}

/// Identifiers of this worker's remote session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub habitat_id: String,
    pub queue_id: String,
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveJob {
    pub id: String,
    pub backend_type: String,
    pub started_at: DateTime<Utc>,
}

/// Monotonic counters; also the body of the deregistration call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Everything the renderer reads. Immutable once published.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub layout: Layout,
    /// Operator preference; the layout decides whether it fits.
    pub sidebar_enabled: bool,
    pub bundle: BundleSummary,
    pub session: SessionInfo,
    /// Supported backend type names, sorted.
    pub backends: Vec<String>,
    pub status: HarnessStatus,
    pub copy_mode: bool,
    pub active_job: Option<ActiveJob>,
    pub counters: Counters,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
    pub mcp: Vec<McpServerStatus>,
    pub now: DateTime<Utc>,
    mcp_source: Vec<McpServerConfig>,
}

impl StatusSnapshot {
    pub fn new(
        bundle: BundleSummary,
        session: SessionInfo,
        mut backends: Vec<String>,
        layout: Layout,
        sidebar_enabled: bool,
        now: DateTime<Utc>,
    ) -> Self {
        backends.sort();
        let mcp_source = bundle.mcp_servers.clone();
        let mcp = derive_statuses(&mcp_source, now);
        Self {
            layout,
            sidebar_enabled,
            bundle,
            session,
            backends,
            status: HarnessStatus::Starting,
            copy_mode: false,
            active_job: None,
            counters: Counters::default(),
            last_heartbeat: None,
            last_error: None,
            mcp,
            now,
            mcp_source,
        }
    }

    /// Whether the sidebar is actually drawn.
    pub fn sidebar_available(&self) -> bool {
        self.layout.sidebar().is_some()
    }

    /// Apply one delta. Pure apart from `self`.
    pub fn apply(&mut self, delta: SnapshotDelta) {
        match delta {
            SnapshotDelta::Clock(now) => {
                self.now = now;
                self.mcp = derive_statuses(&self.mcp_source, now);
            }
            SnapshotDelta::Layout(layout) => self.layout = layout,
            SnapshotDelta::Status(status) => self.status = status,
            SnapshotDelta::CopyMode(on) => self.copy_mode = on,
            SnapshotDelta::JobStarted {
                id,
                backend_type,
                at,
            } => {
                self.active_job = Some(ActiveJob {
                    id,
                    backend_type,
                    started_at: at,
                });
                self.status = HarnessStatus::Running;
            }
            SnapshotDelta::JobFinished { succeeded } => {
                self.active_job = None;
                if succeeded {
                    self.counters.jobs_completed += 1;
                } else {
                    self.counters.jobs_failed += 1;
                }
            }
            SnapshotDelta::HeartbeatSent(at) => {
                self.counters.heartbeats_sent += 1;
                self.last_heartbeat = Some(at);
            }
            SnapshotDelta::HeartbeatFailed { message, at } => {
                self.counters.heartbeats_failed += 1;
                self.last_error = Some(LastError { message, at });
            }
            SnapshotDelta::Error { message, at } => {
                self.last_error = Some(LastError { message, at });
            }
            SnapshotDelta::ClearError => self.last_error = None,
            SnapshotDelta::McpConfig(configs) => {
                self.mcp = derive_statuses(&configs, self.now);
                self.mcp_source = configs;
            }
        }
    }
}

/// A single change to the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotDelta {
    Clock(DateTime<Utc>),
    Layout(Layout),
    Status(HarnessStatus),
    CopyMode(bool),
    JobStarted {
        id: String,
        backend_type: String,
        at: DateTime<Utc>,
    },
    /// Clears the active job and bumps the matching counter.
    JobFinished { succeeded: bool },
    HeartbeatSent(DateTime<Utc>),
    HeartbeatFailed { message: String, at: DateTime<Utc> },
    Error { message: String, at: DateTime<Utc> },
    ClearError,
    McpConfig(Vec<McpServerConfig>),
}

/// Cloneable sender side used by every task.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    tx: mpsc::UnboundedSender<SnapshotDelta>,
}

impl SnapshotHandle {
    /// Queue a delta. Deltas sent after the owner stopped are dropped.
    pub fn send(&self, delta: SnapshotDelta) {
        if self.tx.send(delta).is_err() {
            debug!("snapshot owner gone, dropping delta");
        }
    }

    /// Record an error message stamped with the current time.
    pub fn error(&self, message: impl Into<String>) {
        self.send(SnapshotDelta::Error {
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn status(&self, status: HarnessStatus) {
        self.send(SnapshotDelta::Status(status));
    }
}

/// The only writer of the snapshot.
pub struct SnapshotOwner {
    rx: mpsc::UnboundedReceiver<SnapshotDelta>,
    publish: watch::Sender<Arc<StatusSnapshot>>,
    current: StatusSnapshot,
}

impl SnapshotOwner {
    /// Apply deltas until every [`SnapshotHandle`] is dropped, then return
    /// the final snapshot.
    pub async fn run(mut self) -> StatusSnapshot {
        while let Some(delta) = self.rx.recv().await {
            self.current.apply(delta);
            // Fold whatever else is already queued into one publication.
            while let Ok(delta) = self.rx.try_recv() {
                self.current.apply(delta);
            }
            self.publish.send_replace(Arc::new(self.current.clone()));
        }
        self.current
    }
}

/// Create the owner, a handle and a reader for `initial`.
pub fn channel(
    initial: StatusSnapshot,
) -> (
    SnapshotOwner,
    SnapshotHandle,
    watch::Receiver<Arc<StatusSnapshot>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (publish, reader) = watch::channel(Arc::new(initial.clone()));
    (
        SnapshotOwner {
            rx,
            publish,
            current: initial,
        },
        SnapshotHandle { tx },
        reader,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::McpCredential;
    use crate::terminal::layout::Viewport;
    use chrono::TimeZone;

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot::new(
            BundleSummary::default(),
            SessionInfo::default(),
            vec!["subprocess".into(), "interactive".into()],
            Layout::compute(Some(Viewport::new(100, 30)), true),
            true,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn backends_are_sorted() {
        assert_eq!(snapshot().backends, vec!["interactive", "subprocess"]);
    }

    #[test]
    fn job_lifecycle_updates_counters() {
        let mut snap = snapshot();
        snap.apply(SnapshotDelta::JobStarted {
            id: "j1".into(),
            backend_type: "subprocess".into(),
            at: snap.now,
        });
        assert_eq!(snap.status, HarnessStatus::Running);
        assert_eq!(snap.active_job.as_ref().unwrap().id, "j1");

        snap.apply(SnapshotDelta::JobFinished { succeeded: true });
        snap.apply(SnapshotDelta::JobFinished { succeeded: false });
        assert!(snap.active_job.is_none());
        assert_eq!(snap.counters.jobs_completed, 1);
        assert_eq!(snap.counters.jobs_failed, 1);
    }

    #[test]
    fn clock_recomputes_mcp_expiry() {
        let mut snap = snapshot();
        let expiry = snap.now + chrono::Duration::seconds(10);
        snap.apply(SnapshotDelta::McpConfig(vec![McpServerConfig {
            name: "gh".into(),
            loaded: true,
            requires_auth: true,
            credential: Some(McpCredential {
                expires_at: Some(expiry),
            }),
        }]));
        assert!(snap.mcp[0].authenticated);

        snap.apply(SnapshotDelta::Clock(expiry));
        assert!(snap.mcp[0].expired);
        assert!(!snap.mcp[0].authenticated);
    }

    #[test]
    fn heartbeat_failure_records_error() {
        let mut snap = snapshot();
        let at = snap.now;
        snap.apply(SnapshotDelta::HeartbeatSent(at));
        snap.apply(SnapshotDelta::HeartbeatFailed {
            message: "timeout".into(),
            at,
        });
        assert_eq!(snap.counters.heartbeats_sent, 1);
        assert_eq!(snap.counters.heartbeats_failed, 1);
        assert_eq!(snap.last_error.as_ref().unwrap().message, "timeout");

        snap.apply(SnapshotDelta::ClearError);
        assert!(snap.last_error.is_none());
    }

    #[tokio::test]
    async fn owner_applies_in_order_and_returns_final_state() {
        let (owner, handle, mut reader) = channel(snapshot());
        let task = tokio::spawn(owner.run());

        handle.status(HarnessStatus::Polling);
        handle.status(HarnessStatus::Idle);
        handle.send(SnapshotDelta::JobFinished { succeeded: true });

        reader.changed().await.unwrap();
        // The last published value always reflects a prefix of the deltas.
        let seen = reader.borrow().clone();
        assert!(seen.status == HarnessStatus::Polling || seen.status == HarnessStatus::Idle);

        drop(handle);
        let last = task.await.unwrap();
        assert_eq!(last.status, HarnessStatus::Idle);
        assert_eq!(last.counters.jobs_completed, 1);
        assert_eq!(reader.borrow().counters.jobs_completed, 1);
    }
}
