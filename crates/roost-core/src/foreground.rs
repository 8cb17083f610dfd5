//! The foreground slot: who owns the keyboard and which process group
//! gets signalled.
//!
//! A backend installs a [`ForegroundControl`] for the duration of a job
//! and clears it afterwards. The input router forwards keystrokes through
//! the slot; the job loop and shutdown coordinator use it to interrupt or
//! terminate whatever is running.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use crate::process::{self, Signal, Termination};

/// Handle a running backend exposes to the rest of the harness.
pub trait ForegroundControl: Send + Sync {
    /// Backend type name, for logging.
    fn backend(&self) -> &str;

    /// Deliver operator keystrokes to the backend's input.
    fn write_input(&self, bytes: &[u8]) -> io::Result<()>;

    /// Process group to signal.
    fn process_group(&self) -> Option<u32>;

    /// Whether the foreground process has exited (and been reaped).
    fn has_exited(&self) -> bool;

    /// The content area changed size.
    fn resize(&self, _cols: u16, _rows: u16) -> io::Result<()> {
        Ok(())
    }

    /// Soft interrupt. Defaults to SIGINT on the process group.
    fn interrupt(&self) -> io::Result<()> {
        match self.process_group() {
            Some(pgid) => process::signal_group(pgid, Signal::Interrupt),
            None => Ok(()),
        }
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn ForegroundControl) {}
};

/// Shared slot holding at most one [`ForegroundControl`].
#[derive(Clone, Default)]
pub struct Foreground {
    slot: Arc<Mutex<Option<Arc<dyn ForegroundControl>>>>,
}

impl Foreground {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<dyn ForegroundControl>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> Option<Arc<dyn ForegroundControl>> {
        self.lock().clone()
    }

    pub fn install(&self, control: Arc<dyn ForegroundControl>) {
        debug!(backend = control.backend(), "foreground installed");
        *self.lock() = Some(control);
    }

    /// Install `control` until the returned guard is dropped.
    #[must_use = "the foreground is cleared when the guard drops"]
    pub fn scoped(&self, control: Arc<dyn ForegroundControl>) -> ForegroundGuard {
        self.install(control);
        ForegroundGuard {
            foreground: self.clone(),
        }
    }

    pub fn clear(&self) {
        if let Some(prev) = self.lock().take() {
            debug!(backend = prev.backend(), "foreground cleared");
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Forward keystrokes. Returns `false` when nothing is in the
    /// foreground and the bytes were discarded.
    pub fn forward(&self, bytes: &[u8]) -> bool {
        let Some(control) = self.current() else {
            return false;
        };
        if let Err(e) = control.write_input(bytes) {
            debug!(backend = control.backend(), error = %e, "keystroke forward failed");
        }
        true
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        if let Some(control) = self.current() {
            if let Err(e) = control.resize(cols, rows) {
                debug!(backend = control.backend(), error = %e, "resize failed");
            }
        }
    }

    /// Soft-interrupt the foreground backend. Returns `false` when idle.
    pub fn interrupt(&self) -> bool {
        let Some(control) = self.current() else {
            return false;
        };
        if let Err(e) = control.interrupt() {
            warn!(backend = control.backend(), error = %e, "interrupt failed");
        }
        true
    }

    /// Terminate the foreground process group: SIGTERM, `grace`, SIGKILL.
    pub async fn terminate(&self, grace: Duration) -> Termination {
        let Some(control) = self.current() else {
            return Termination::AlreadyExited;
        };
        let Some(pgid) = control.process_group() else {
            return Termination::AlreadyExited;
        };
        let outcome = process::terminate_group(pgid, grace, || control.has_exited()).await;
        debug!(backend = control.backend(), pgid, ?outcome, "foreground terminated");
        outcome
    }
}

/// Clears the foreground slot on drop.
pub struct ForegroundGuard {
    foreground: Foreground,
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        self.foreground.clear();
    }
}

impl std::fmt::Debug for Foreground {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = self.current().map(|c| c.backend().to_string());
        f.debug_struct("Foreground").field("backend", &backend).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        input: Mutex<Vec<u8>>,
        interrupts: AtomicUsize,
        resized: Mutex<Option<(u16, u16)>>,
    }

    impl ForegroundControl for Recorder {
        fn backend(&self) -> &str {
            "fake"
        }
        fn write_input(&self, bytes: &[u8]) -> io::Result<()> {
            self.input.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }
        fn process_group(&self) -> Option<u32> {
            None
        }
        fn has_exited(&self) -> bool {
            true
        }
        fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
            *self.resized.lock().unwrap() = Some((cols, rows));
            Ok(())
        }
        fn interrupt(&self) -> io::Result<()> {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn idle_slot_discards_input() {
        let fg = Foreground::new();
        assert!(!fg.is_active());
        assert!(!fg.forward(b"ls\r"));
        assert!(!fg.interrupt());
    }

    #[test]
    fn installed_control_receives_input_and_interrupts() {
        let fg = Foreground::new();
        let rec = Arc::new(Recorder::default());
        fg.install(rec.clone());

        assert!(fg.forward(b"abc"));
        assert!(fg.interrupt());
        fg.resize(90, 20);
        assert_eq!(&*rec.input.lock().unwrap(), b"abc");
        assert_eq!(rec.interrupts.load(Ordering::SeqCst), 1);
        assert_eq!(*rec.resized.lock().unwrap(), Some((90, 20)));

        fg.clear();
        assert!(!fg.forward(b"x"));
        assert_eq!(&*rec.input.lock().unwrap(), b"abc");
    }

    #[test]
    fn scoped_guard_clears_on_drop() {
        let fg = Foreground::new();
        {
            let _guard = fg.scoped(Arc::new(Recorder::default()));
            assert!(fg.is_active());
        }
        assert!(!fg.is_active());
    }

    #[tokio::test]
    async fn terminate_without_process_group_is_a_no_op() {
        let fg = Foreground::new();
        assert_eq!(fg.terminate(Duration::from_millis(10)).await, Termination::AlreadyExited);
        fg.install(Arc::new(Recorder::default()));
        assert_eq!(fg.terminate(Duration::from_millis(10)).await, Termination::AlreadyExited);
    }
}
