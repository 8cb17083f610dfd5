//! Render loop: paints the status overlay on a tick and after every
//! snapshot change, and owns the terminal controller while it runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::foreground::Foreground;
use crate::render::render;
use crate::snapshot::{SnapshotDelta, SnapshotHandle, StatusSnapshot};
use crate::terminal::TerminalController;

/// Requests other tasks can make of the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayRequest {
    /// Re-read the terminal size and redo the layout.
    Reprobe,
}

pub struct Display {
    controller: TerminalController,
    snapshots: watch::Receiver<Arc<StatusSnapshot>>,
    handle: SnapshotHandle,
    foreground: Foreground,
    requests: mpsc::UnboundedReceiver<DisplayRequest>,
    tick: Duration,
}

impl Display {
    pub fn new(
        controller: TerminalController,
        snapshots: watch::Receiver<Arc<StatusSnapshot>>,
        handle: SnapshotHandle,
        foreground: Foreground,
        requests: mpsc::UnboundedReceiver<DisplayRequest>,
        tick: Duration,
    ) -> Self {
        Self {
            controller,
            snapshots,
            handle,
            foreground,
            requests,
            tick,
        }
    }

    fn draw(&mut self) {
        let snapshot = Arc::clone(&self.snapshots.borrow_and_update());
        let frame = render(&snapshot);
        if frame.is_empty() {
            return;
        }
        if let Err(e) = self.controller.out().write_bytes(&frame) {
            debug!(error = %e, "status overlay write failed");
        }
    }

    fn reprobe(&mut self) {
        let layout = self.controller.reprobe();
        self.handle.send(SnapshotDelta::Layout(layout));
        if let Some(content) = layout.content_size() {
            self.foreground.resize(content.cols, content.rows);
        }
    }

    /// Run until cancelled, then hand the controller back for restoring.
    pub async fn run(mut self, cancel: CancellationToken) -> TerminalController {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut resized = window_changes();
        self.draw();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = self.snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.draw();
                }
                _ = tick.tick() => self.handle.send(SnapshotDelta::Clock(Utc::now())),
                Some(request) = self.requests.recv() => match request {
                    DisplayRequest::Reprobe => self.reprobe(),
                },
                _ = next_window_change(&mut resized) => self.reprobe(),
            }
        }
        self.controller
    }
}

#[cfg(unix)]
type WindowChanges = Option<tokio::signal::unix::Signal>;
#[cfg(not(unix))]
type WindowChanges = Option<()>;

#[cfg(unix)]
fn window_changes() -> WindowChanges {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::window_change()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "cannot watch for terminal resizes");
            None
        }
    }
}

#[cfg(not(unix))]
fn window_changes() -> WindowChanges {
    None
}

#[cfg(unix)]
async fn next_window_change(resized: &mut WindowChanges) {
    match resized {
        Some(s) => {
            if s.recv().await.is_none() {
                *resized = None;
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn next_window_change(_resized: &mut WindowChanges) {
    std::future::pending().await
}
