//! Keyboard routing: harness chords versus keystrokes for the backend.
//!
//! A blocking reader thread feeds raw stdin chunks into a channel; the
//! router decodes each chunk and acts on it before reading the next, so
//! a chord always takes effect within one read cycle.

pub mod decoder;
pub mod interrupt;

use std::io::Read;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::display::DisplayRequest;
use crate::foreground::Foreground;
use crate::shutdown::{ShutdownReason, ShutdownTrigger};
use crate::snapshot::{SnapshotDelta, SnapshotHandle};

pub use decoder::{Chord, InputDecoder, InputEvent};
pub use interrupt::{DOUBLE_PRESS_WINDOW, InterruptAction, InterruptTracker};

const READ_BUF: usize = 4096;

/// What the router did with one decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Bytes delivered to the foreground backend.
    Forwarded(usize),
    /// Bytes dropped because nothing was running.
    Discarded(usize),
    /// The foreground backend was soft-interrupted.
    Interrupted,
    CopyMode(bool),
    Reprobe,
    Shutdown(ShutdownReason),
}

pub struct InputRouter {
    decoder: InputDecoder,
    interrupts: InterruptTracker,
    foreground: Foreground,
    snapshot: SnapshotHandle,
    display: mpsc::UnboundedSender<DisplayRequest>,
    shutdown: ShutdownTrigger,
}

impl InputRouter {
    pub fn new(
        foreground: Foreground,
        snapshot: SnapshotHandle,
        display: mpsc::UnboundedSender<DisplayRequest>,
        shutdown: ShutdownTrigger,
    ) -> Self {
        Self {
            decoder: InputDecoder::new(),
            interrupts: InterruptTracker::new(),
            foreground,
            snapshot,
            display,
            shutdown,
        }
    }

    pub fn with_interrupt_tracker(mut self, tracker: InterruptTracker) -> Self {
        self.interrupts = tracker;
        self
    }

    /// Decode and act on one chunk read at `now`.
    pub fn handle_chunk(&mut self, chunk: &[u8], now: Instant) -> Vec<Routed> {
        let mut routed = Vec::new();
        for event in self.decoder.decode(chunk) {
            let outcome = match event {
                InputEvent::Forward(bytes) => {
                    if self.foreground.forward(&bytes) {
                        Routed::Forwarded(bytes.len())
                    } else {
                        Routed::Discarded(bytes.len())
                    }
                }
                InputEvent::CopyMode(on) => {
                    debug!(on, "copy mode");
                    self.snapshot.send(SnapshotDelta::CopyMode(on));
                    Routed::CopyMode(on)
                }
                InputEvent::Chord(Chord::Reprobe) => {
                    let _ = self.display.send(DisplayRequest::Reprobe);
                    Routed::Reprobe
                }
                InputEvent::Chord(Chord::Quit) => self.stop(ShutdownReason::Quit),
                InputEvent::Chord(Chord::Interrupt) => {
                    let running = self.foreground.is_active();
                    match self.interrupts.press(running, now) {
                        InterruptAction::SignalBackend => {
                            info!("interrupt: signalling backend (press again to quit)");
                            self.foreground.interrupt();
                            Routed::Interrupted
                        }
                        InterruptAction::Shutdown if running => self.stop(ShutdownReason::DoubleInterrupt),
                        InterruptAction::Shutdown => self.stop(ShutdownReason::IdleInterrupt),
                    }
                }
            };
            let done = matches!(outcome, Routed::Shutdown(_));
            routed.push(outcome);
            if done {
                break;
            }
        }
        routed
    }

    fn stop(&self, reason: ShutdownReason) -> Routed {
        self.shutdown.fire(reason.clone());
        Routed::Shutdown(reason)
    }

    /// Route chunks from `input` until cancelled, a shutdown chord, or
    /// end of input.
    pub async fn run(mut self, mut input: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return,
                chunk = input.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                debug!("terminal input closed");
                return;
            };
            let routed = self.handle_chunk(&chunk, Instant::now());
            if routed.iter().any(|r| matches!(r, Routed::Shutdown(_))) {
                return;
            }
        }
    }
}

/// Read `reader` on a dedicated thread, delivering chunks over a channel.
///
/// The thread ends at EOF, on a read error, or once the receiver is gone
/// (noticed at the next completed read).
pub fn spawn_reader<R>(mut reader: R) -> mpsc::Receiver<Vec<u8>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUF];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "terminal read failed");
                    break;
                }
            }
        }
    });
    rx
}

pub fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    spawn_reader(std::io::stdin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreground::ForegroundControl;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Sink {
        input: Mutex<Vec<u8>>,
        interrupts: AtomicUsize,
    }

    impl ForegroundControl for Sink {
        fn backend(&self) -> &str {
            "sink"
        }
        fn write_input(&self, bytes: &[u8]) -> io::Result<()> {
            self.input.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }
        fn process_group(&self) -> Option<u32> {
            None
        }
        fn has_exited(&self) -> bool {
            false
        }
        fn interrupt(&self) -> io::Result<()> {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        router: InputRouter,
        foreground: Foreground,
        trigger: ShutdownTrigger,
        display_rx: mpsc::UnboundedReceiver<DisplayRequest>,
    }

    fn fixture() -> Fixture {
        let foreground = Foreground::new();
        let trigger = ShutdownTrigger::new(CancellationToken::new());
        let (display_tx, display_rx) = mpsc::unbounded_channel();
        let initial = crate::snapshot::StatusSnapshot::new(
            Default::default(),
            Default::default(),
            Vec::new(),
            crate::terminal::Layout::compute(None, false),
            false,
            chrono::Utc::now(),
        );
        let (_owner, handle, _reader) = crate::snapshot::channel(initial);
        let router = InputRouter::new(foreground.clone(), handle, display_tx, trigger.clone());
        Fixture {
            router,
            foreground,
            trigger,
            display_rx,
        }
    }

    #[test]
    fn keystrokes_reach_the_foreground_backend() {
        let mut f = fixture();
        let sink = Arc::new(Sink::default());
        f.foreground.install(sink.clone());

        let routed = f.router.handle_chunk(b"y\r\x1b[A", Instant::now());
        assert_eq!(routed, vec![Routed::Forwarded(5)]);
        assert_eq!(&*sink.input.lock().unwrap(), b"y\r\x1b[A");
    }

    #[test]
    fn keystrokes_are_discarded_when_idle() {
        let mut f = fixture();
        assert_eq!(f.router.handle_chunk(b"abc", Instant::now()), vec![Routed::Discarded(3)]);
        assert!(!f.trigger.is_fired());
    }

    #[test]
    fn idle_interrupt_shuts_down_immediately() {
        let mut f = fixture();
        let routed = f.router.handle_chunk(b"\x03", Instant::now());
        assert_eq!(routed, vec![Routed::Shutdown(ShutdownReason::IdleInterrupt)]);
        assert_eq!(f.trigger.reason(), Some(ShutdownReason::IdleInterrupt));
        assert!(f.trigger.token().is_cancelled());
    }

    #[test]
    fn single_interrupt_signals_and_double_shuts_down() {
        let mut f = fixture();
        let sink = Arc::new(Sink::default());
        f.foreground.install(sink.clone());
        let now = Instant::now();

        assert_eq!(f.router.handle_chunk(b"\x03", now), vec![Routed::Interrupted]);
        assert_eq!(sink.interrupts.load(Ordering::SeqCst), 1);
        assert!(!f.trigger.is_fired());

        let routed = f.router.handle_chunk(b"\x03", now + Duration::from_millis(500));
        assert_eq!(routed, vec![Routed::Shutdown(ShutdownReason::DoubleInterrupt)]);
        assert_eq!(sink.interrupts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quit_stops_processing_the_rest_of_the_chunk() {
        let mut f = fixture();
        let sink = Arc::new(Sink::default());
        f.foreground.install(sink.clone());
        let routed = f.router.handle_chunk(b"a\x1cb", Instant::now());
        assert_eq!(routed, vec![Routed::Forwarded(1), Routed::Shutdown(ShutdownReason::Quit)]);
        assert_eq!(&*sink.input.lock().unwrap(), b"a");
    }

    #[test]
    fn reprobe_chord_asks_the_display() {
        let mut f = fixture();
        assert_eq!(f.router.handle_chunk(b"\x1e", Instant::now()), vec![Routed::Reprobe]);
        assert_eq!(f.display_rx.try_recv().unwrap(), DisplayRequest::Reprobe);
    }

    #[tokio::test]
    async fn reader_thread_delivers_chunks() {
        let mut rx = spawn_reader(io::Cursor::new(b"hello".to_vec()));
        assert_eq!(rx.recv().await.unwrap(), b"hello");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn run_returns_on_quit() {
        let f = fixture();
        let (tx, rx) = mpsc::channel(4);
        tx.send(b"\x1c".to_vec()).await.unwrap();
        let trigger = f.trigger.clone();
        tokio::time::timeout(Duration::from_secs(1), f.router.run(rx, CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(trigger.reason(), Some(ShutdownReason::Quit));
    }
}
