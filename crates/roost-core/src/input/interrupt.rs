//! Double-press interrupt protocol.

use std::time::{Duration, Instant};

/// Second interrupt within this window shuts the harness down.
pub const DOUBLE_PRESS_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Soft-interrupt the foreground backend and open the window.
    SignalBackend,
    /// Stop the whole harness.
    Shutdown,
}

/// Tracks interrupt presses to tell "stop this job" from "stop roost".
#[derive(Debug, Clone)]
pub struct InterruptTracker {
    first_press: Option<Instant>,
    window: Duration,
}

impl Default for InterruptTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptTracker {
    pub fn new() -> Self {
        Self::with_window(DOUBLE_PRESS_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            first_press: None,
            window,
        }
    }

    /// Handle one press. With nothing running there is nothing to
    /// interrupt, so the harness stops straight away.
    pub fn press(&mut self, backend_running: bool, now: Instant) -> InterruptAction {
        if !backend_running {
            self.first_press = None;
            return InterruptAction::Shutdown;
        }
        match self.first_press {
            Some(first) if now.saturating_duration_since(first) < self.window => {
                self.first_press = None;
                InterruptAction::Shutdown
            }
            _ => {
                self.first_press = Some(now);
                InterruptAction::SignalBackend
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_press_shuts_down() {
        let mut t = InterruptTracker::new();
        assert_eq!(t.press(false, Instant::now()), InterruptAction::Shutdown);
    }

    #[test]
    fn single_press_only_signals() {
        let mut t = InterruptTracker::new();
        assert_eq!(t.press(true, Instant::now()), InterruptAction::SignalBackend);
    }

    #[test]
    fn double_press_within_window_shuts_down() {
        let mut t = InterruptTracker::new();
        let now = Instant::now();
        assert_eq!(t.press(true, now), InterruptAction::SignalBackend);
        assert_eq!(
            t.press(true, now + Duration::from_millis(1500)),
            InterruptAction::Shutdown
        );
    }

    #[test]
    fn presses_outside_window_restart_it() {
        let mut t = InterruptTracker::new();
        let now = Instant::now();
        assert_eq!(t.press(true, now), InterruptAction::SignalBackend);
        let later = now + DOUBLE_PRESS_WINDOW + Duration::from_millis(1);
        assert_eq!(t.press(true, later), InterruptAction::SignalBackend);
        assert_eq!(
            t.press(true, later + Duration::from_millis(100)),
            InterruptAction::Shutdown
        );
    }
}
