//! Terminal controller: raw mode, scroll region and guaranteed restore.
//!
//! While the harness runs, the top rows of the screen are reserved for the
//! status overlay with a DECSTBM scroll region (`ESC[top;bottomr`) and the
//! backend's output scrolls underneath. Every exit path puts the terminal
//! back: [`TerminalController::restore`] on the normal path, `Drop` when a
//! task unwinds, and a process-wide panic hook as the last resort.

pub mod layout;
pub mod out;

use std::io::{self, IsTerminal, Write};
use std::sync::Once;

use crossterm::cursor;
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::{debug, warn};

use crate::error::HarnessError;

pub use layout::{Layout, Viewport};
pub use out::TerminalOut;

/// Resets the scroll region and all character attributes.
pub const RESET_SEQUENCE: &str = "\x1b[r\x1b[0m";

type SizeProbe = Box<dyn Fn() -> Option<Viewport> + Send>;

/// Owns the terminal modes for the lifetime of a harness run.
pub struct TerminalController {
    out: TerminalOut,
    sidebar_enabled: bool,
    layout: Layout,
    probe: SizeProbe,
    raw_mode: bool,
    restored: bool,
}

impl TerminalController {
    /// Take over the real terminal.
    ///
    /// Fails with [`HarnessError::NotATerminal`] unless both stdin and
    /// stdout are terminals.
    pub fn enter(out: TerminalOut, sidebar_enabled: bool) -> Result<Self, HarnessError> {
        if !is_interactive() {
            return Err(HarnessError::NotATerminal);
        }
        install_panic_hook();
        enable_raw_mode().map_err(HarnessError::Terminal)?;

        let mut controller = Self {
            out,
            sidebar_enabled,
            layout: Layout::Passthrough { viewport: None },
            probe: Box::new(probe_size),
            raw_mode: true,
            restored: false,
        };
        controller.reprobe();
        Ok(controller)
    }

    /// Controller over an arbitrary writer with a caller-supplied size
    /// probe. Never touches raw mode.
    pub fn detached(
        out: TerminalOut,
        sidebar_enabled: bool,
        probe: impl Fn() -> Option<Viewport> + Send + 'static,
    ) -> Self {
        let mut controller = Self {
            out,
            sidebar_enabled,
            layout: Layout::Passthrough { viewport: None },
            probe: Box::new(probe),
            raw_mode: false,
            restored: false,
        };
        controller.reprobe();
        controller
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn out(&self) -> &TerminalOut {
        &self.out
    }

    /// Re-read the terminal size, recompute the layout and reinstall the
    /// scroll region.
    pub fn reprobe(&mut self) -> Layout {
        let viewport = (self.probe)();
        self.layout = Layout::compute(viewport, self.sidebar_enabled);
        debug!(layout = ?self.layout, "terminal layout computed");
        if let Err(e) = self.install_region() {
            warn!(error = %e, "failed to install scroll region");
        }
        self.layout
    }

    fn install_region(&self) -> io::Result<()> {
        let seq = match self.layout.scroll_region() {
            // Setting the region homes the cursor; park it at the top of
            // the scrolling area instead so backend output lands there.
            Some((top, bottom)) => format!("\x1b[{top};{bottom}r\x1b[{top};1H"),
            None => "\x1b[r".to_string(),
        };
        self.out.write_bytes(seq.as_bytes())
    }

    /// Put the terminal back the way it was found. Idempotent.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;

        let mut seq = String::from(RESET_SEQUENCE);
        if let Some(vp) = self.layout.viewport() {
            seq.push_str(&format!("\x1b[{};1H", vp.rows));
        }
        if let Err(e) = self.out.write_bytes(seq.as_bytes()) {
            warn!(error = %e, "failed to reset scroll region");
        }
        let mut out = self.out.clone();
        if let Err(e) = execute!(out, cursor::Show) {
            warn!(error = %e, "failed to show cursor");
        }
        if self.raw_mode {
            if let Err(e) = disable_raw_mode() {
                warn!(error = %e, "failed to leave raw mode");
            }
        }
        debug!("terminal restored");
    }

    pub fn is_restored(&self) -> bool {
        self.restored
    }
}

impl Drop for TerminalController {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Whether stdin and stdout are both terminals.
pub fn is_interactive() -> bool {
    io::stdin().is_terminal() && io::stdout().is_terminal()
}

/// Current size of the real terminal, if it can be read.
pub fn probe_size() -> Option<Viewport> {
    match crossterm::terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => Some(Viewport::new(cols, rows)),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "terminal size probe failed");
            None
        }
    }
}

/// Best-effort restore straight onto stdout, for paths that cannot reach
/// the controller (panics, signal handlers).
pub fn emergency_restore() {
    let mut stdout = io::stdout();
    let _ = stdout.write_all(RESET_SEQUENCE.as_bytes());
    let _ = execute!(stdout, cursor::Show);
    let _ = disable_raw_mode();
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            emergency_restore();
            previous(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn installs_region_below_overlay() {
        let cap = Capture::default();
        let ctl = TerminalController::detached(TerminalOut::new(cap.clone()), true, || {
            Some(Viewport::new(100, 30))
        });
        assert_eq!(ctl.layout().reserved_rows(), 8);
        assert!(cap.text().contains("\x1b[9;30r"));
    }

    #[test]
    fn passthrough_resets_region() {
        let cap = Capture::default();
        let ctl = TerminalController::detached(TerminalOut::new(cap.clone()), true, || None);
        assert!(ctl.layout().is_passthrough());
        assert_eq!(cap.text(), "\x1b[r");
    }

    #[test]
    fn reprobe_follows_size_changes() {
        let size = Arc::new(Mutex::new(Viewport::new(100, 30)));
        let probe_size = Arc::clone(&size);
        let cap = Capture::default();
        let mut ctl = TerminalController::detached(TerminalOut::new(cap.clone()), true, move || {
            Some(*probe_size.lock().unwrap())
        });
        assert!(ctl.layout().sidebar().is_some());

        *size.lock().unwrap() = Viewport::new(100, 12);
        let layout = ctl.reprobe();
        assert!(layout.sidebar().is_none());
        assert!(cap.text().contains("\x1b[2;12r"));
    }

    #[test]
    fn restore_is_idempotent_and_shows_cursor() {
        let cap = Capture::default();
        let mut ctl = TerminalController::detached(TerminalOut::new(cap.clone()), false, || {
            Some(Viewport::new(80, 24))
        });
        ctl.restore();
        let after_first = cap.text();
        assert!(after_first.contains(RESET_SEQUENCE));
        assert!(after_first.contains("\x1b[?25h"));

        ctl.restore();
        drop(ctl);
        assert_eq!(cap.text(), after_first);
    }

    #[test]
    fn drop_restores() {
        let cap = Capture::default();
        {
            let _ctl = TerminalController::detached(TerminalOut::new(cap.clone()), false, || {
                Some(Viewport::new(80, 24))
            });
        }
        assert!(cap.text().contains(RESET_SEQUENCE));
    }
}
