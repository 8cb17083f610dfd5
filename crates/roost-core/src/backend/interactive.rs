//! Interactive backend: a conversational CLI kept alive in a
//! pseudo-terminal across jobs.
//!
//! Each job injects its prompt into the pty and waits for a turn-complete
//! marker file. The CLI learns the marker path from `ROOST_TURN_MARKER`;
//! for Claude Code a settings file with a `Stop` hook that touches the
//! marker is generated and passed via `--settings`.
//!
//! ```text
//! NotStarted -> Starting -> Ready -> Executing -> AwaitingCompletion -> Ready
//!                               \                      |
//!                                `---- Interrupting <--+--> Terminated
//! ```

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::launch::{LaunchError, classify_spawn_error, resolve_binary};
use super::{Backend, BackendIo, ExecutionContext};
use crate::foreground::ForegroundControl;
use crate::job::{FailureKind, Job, JobFailure, JobOutcome, JobReport};
use crate::process::{self, Termination};
use crate::terminal::Viewport;

/// Backend type name.
pub const NAME: &str = "interactive";
/// Environment variable carrying the marker path to the child.
pub const MARKER_ENV: &str = "ROOST_TURN_MARKER";
/// Transcript stream name for pty output.
pub const STREAM: &str = "interactive";

const MARKER_FILE: &str = "turn-complete";
const SETTINGS_FILE: &str = "settings.json";
const ETX: u8 = 0x03;
const STARTUP_POLL: Duration = Duration::from_millis(50);
const DEFAULT_SIZE: Viewport = Viewport { cols: 80, rows: 24 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractiveState {
    NotStarted,
    Starting,
    Ready,
    Executing,
    AwaitingCompletion,
    Interrupting,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    /// Backend type name this instance registers under.
    pub backend_type: String,
    pub binary: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Directory the CLI runs in; the current directory when unset.
    pub working_dir: Option<PathBuf>,
    /// Generate a Claude Code settings file with a `Stop` hook.
    pub settings_hook: bool,
    /// Keystroke that submits a prompt.
    pub submit: Vec<u8>,
    /// Pause between the prompt text and the submit keystroke.
    pub submit_delay: Duration,
    /// Sent after every completed turn to reset the conversation.
    pub reset_command: Option<String>,
    pub marker_poll_interval: Duration,
    /// Output silence that counts as "startup finished".
    pub startup_quiet: Duration,
    pub startup_timeout: Duration,
    /// Output silence after an operator interrupt before the job is
    /// reported as interrupted.
    pub interrupt_settle: Duration,
    /// SIGTERM-to-SIGKILL grace when tearing the session down.
    pub grace: Duration,
}

impl Default for InteractiveConfig {
    fn default() -> Self {
        Self {
            backend_type: NAME.to_string(),
            binary: "claude".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            settings_hook: true,
            submit: b"\r".to_vec(),
            submit_delay: Duration::from_millis(100),
            reset_command: Some("/clear".to_string()),
            marker_poll_interval: Duration::from_millis(250),
            startup_quiet: Duration::from_millis(750),
            startup_timeout: Duration::from_secs(20),
            interrupt_settle: Duration::from_secs(1),
            grace: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Session: one running CLI in one pty
// ---------------------------------------------------------------------------

/// State shared with the session's reader and wait threads.
struct Shared {
    exited: AtomicBool,
    interrupted: AtomicBool,
    /// Output captured for the current job, if one is running.
    capture: Mutex<Option<Vec<u8>>>,
    last_output: Mutex<std::time::Instant>,
}

impl Shared {
    fn capture(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.capture.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn touch(&self) {
        *self.last_output.lock().unwrap_or_else(|p| p.into_inner()) = std::time::Instant::now();
    }

    fn quiet_for(&self) -> Duration {
        self.last_output
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }
}

struct Session {
    pgid: Option<u32>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    shared: Arc<Shared>,
    marker: PathBuf,
    _run_dir: TempDir,
}

impl Session {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.input
            .send(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pty writer closed"))
    }

    fn has_exited(&self) -> bool {
        self.shared.exited.load(Ordering::SeqCst)
    }

    fn control(&self) -> Arc<PtyControl> {
        Arc::new(PtyControl {
            pgid: self.pgid,
            input: self.input.clone(),
            master: Arc::clone(&self.master),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Graceful-then-forceful termination of the whole process group.
    async fn terminate(&self, grace: Duration) -> Termination {
        let Some(pgid) = self.pgid else {
            return Termination::AlreadyExited;
        };
        let shared = Arc::clone(&self.shared);
        process::terminate_group(pgid, grace, move || shared.exited.load(Ordering::SeqCst)).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.has_exited() {
            let _ = self.killer.kill();
        }
    }
}

fn start_session(config: &InteractiveConfig, size: Viewport, io: BackendIo) -> Result<Session, LaunchError> {
    let binary = resolve_binary(&config.binary)?;
    let run_dir = tempfile::Builder::new()
        .prefix("roost-run-")
        .tempdir()
        .map_err(LaunchError::RunDir)?;
    let marker = run_dir.path().join(MARKER_FILE);

    let mut cmd = CommandBuilder::new(&binary);
    cmd.args(&config.args);
    if config.settings_hook {
        let settings = write_settings(run_dir.path()).map_err(LaunchError::RunDir)?;
        cmd.arg("--settings");
        cmd.arg(settings);
    }
    cmd.env(MARKER_ENV, &marker);
    for (k, v) in &config.env {
        cmd.env(k, v);
    }
    let cwd = match &config.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().map_err(LaunchError::RunDir)?,
    };
    cmd.cwd(cwd);

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| LaunchError::Pty(e.to_string()))?;

    // The pty slave makes the child a session leader, so pid == pgid.
    let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
        match e.downcast::<io::Error>() {
            Ok(io_err) => classify_spawn_error(&config.binary, io_err),
            Err(other) => LaunchError::Pty(other.to_string()),
        }
    })?;
    drop(pair.slave);

    let pgid = child.process_id();
    let killer = child.clone_killer();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| LaunchError::Pty(e.to_string()));
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| LaunchError::Pty(e.to_string()));
    let (reader, writer) = match (reader, writer) {
        (Ok(r), Ok(w)) => (r, w),
        (Err(e), _) | (_, Err(e)) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
    };

    let shared = Arc::new(Shared {
        exited: AtomicBool::new(false),
        interrupted: AtomicBool::new(false),
        capture: Mutex::new(None),
        last_output: Mutex::new(std::time::Instant::now()),
    });

    let (input, input_rx) = mpsc::unbounded_channel();
    spawn_reader(reader, Arc::clone(&shared), io);
    spawn_writer(writer, input_rx);

    let waited = Arc::clone(&shared);
    std::thread::spawn(move || {
        let status = child.wait();
        debug!(?status, "interactive backend process exited");
        waited.exited.store(true, Ordering::SeqCst);
    });

    info!(binary = %binary.display(), pgid, "interactive backend started");
    Ok(Session {
        pgid,
        input,
        master: Arc::new(Mutex::new(pair.master)),
        killer,
        shared,
        marker,
        _run_dir: run_dir,
    })
}

fn write_settings(dir: &Path) -> io::Result<PathBuf> {
    let settings = serde_json::json!({
        "hooks": {
            "Stop": [{
                "hooks": [{
                    "type": "command",
                    "command": format!("touch \"${MARKER_ENV}\""),
                }]
            }]
        }
    });
    let path = dir.join(SETTINGS_FILE);
    std::fs::write(&path, serde_json::to_vec_pretty(&settings)?)?;
    Ok(path)
}

fn spawn_reader(mut reader: Box<dyn Read + Send>, shared: Arc<Shared>, io: BackendIo) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    // Passthrough is byte-for-byte; the overlay lives
                    // outside the scroll region so nothing is rewritten.
                    io.emit(STREAM, chunk, chunk);
                    if let Some(capture) = shared.capture().as_mut() {
                        capture.extend_from_slice(chunk);
                    }
                    shared.touch();
                }
                // EIO once the child side closes.
                Err(e) => {
                    debug!(error = %e, "pty read ended");
                    break;
                }
            }
        }
    });
}

fn spawn_writer(mut writer: Box<dyn Write + Send>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    std::thread::spawn(move || {
        while let Some(bytes) = rx.blocking_recv() {
            if bytes.is_empty() {
                continue;
            }
            if writer.write_all(&bytes).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Foreground handle
// ---------------------------------------------------------------------------

struct PtyControl {
    pgid: Option<u32>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    shared: Arc<Shared>,
}

impl ForegroundControl for PtyControl {
    fn backend(&self) -> &str {
        NAME
    }

    fn write_input(&self, bytes: &[u8]) -> io::Result<()> {
        self.input
            .send(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pty writer closed"))
    }

    fn process_group(&self) -> Option<u32> {
        self.pgid
    }

    fn has_exited(&self) -> bool {
        self.shared.exited.load(Ordering::SeqCst)
    }

    fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let master = self.master.lock().unwrap_or_else(|p| p.into_inner());
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| io::Error::other(e.to_string()))
    }

    /// ETX through the pty: the line discipline (or the CLI itself, in
    /// raw mode) turns it into SIGINT for the foreground group.
    fn interrupt(&self) -> io::Result<()> {
        self.shared.interrupted.store(true, Ordering::SeqCst);
        self.write_input(&[ETX])
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct InteractiveBackend {
    config: InteractiveConfig,
    io: BackendIo,
    state: Mutex<InteractiveState>,
    session: tokio::sync::Mutex<Option<Session>>,
    /// Set when a launch failed; later jobs fail fast with this reason.
    disabled: Mutex<Option<String>>,
}

enum Turn {
    Completed,
    Interrupted,
    Exited,
    TimedOut,
    Cancelled,
}

impl InteractiveBackend {
    pub fn new(config: InteractiveConfig, io: BackendIo) -> Self {
        Self {
            config,
            io,
            state: Mutex::new(InteractiveState::NotStarted),
            session: tokio::sync::Mutex::new(None),
            disabled: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &InteractiveConfig {
        &self.config
    }

    pub fn state(&self) -> InteractiveState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: InteractiveState) {
        let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *current != state {
            debug!(from = ?*current, to = ?state, "interactive state");
            *current = state;
        }
    }

    fn disabled_reason(&self) -> Option<String> {
        self.disabled.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn disable(&self, reason: String) {
        *self.disabled.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason);
    }

    /// Prompt text for `job`: rendered instruction, `input.prompt`, script.
    pub fn prompt_for(job: &Job) -> Option<&str> {
        job.rendered_instruction()
            .or_else(|| job.input_field("prompt"))
            .or_else(|| job.raw_script())
    }

    async fn launch(&self, size: Viewport) -> Result<Session, LaunchError> {
        let config = self.config.clone();
        let io = self.io.clone();
        match tokio::task::spawn_blocking(move || start_session(&config, size, io)).await {
            Ok(result) => result,
            Err(e) => Err(LaunchError::Pty(format!("launch task failed: {e}"))),
        }
    }

    /// Wait until the freshly started CLI goes quiet.
    async fn await_startup(&self, session: &Session, ctx: &ExecutionContext) -> Result<(), JobFailure> {
        let started = Instant::now();
        loop {
            if session.has_exited() {
                return Err(JobFailure::new(
                    FailureKind::BackendExited,
                    "interactive backend exited during startup",
                ));
            }
            let elapsed = started.elapsed();
            if elapsed >= self.config.startup_quiet && session.shared.quiet_for() >= self.config.startup_quiet {
                return Ok(());
            }
            if elapsed >= self.config.startup_timeout {
                warn!("interactive backend still busy after startup timeout, continuing");
                return Ok(());
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(JobFailure::new(FailureKind::Cancelled, "harness shutting down"));
                }
                _ = sleep(STARTUP_POLL) => {}
            }
        }
    }

    async fn await_turn(&self, session: &Session, ctx: &ExecutionContext, deadline: Instant) -> Turn {
        let mut poll = tokio::time::interval(self.config.marker_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Turn::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return Turn::TimedOut,
                _ = poll.tick() => {
                    if session.marker.exists() {
                        // Let trailing output land before closing the capture.
                        sleep(self.config.marker_poll_interval).await;
                        return Turn::Completed;
                    }
                    if session.has_exited() {
                        return Turn::Exited;
                    }
                    if session.shared.interrupted.load(Ordering::SeqCst)
                        && session.shared.quiet_for() >= self.config.interrupt_settle
                    {
                        return Turn::Interrupted;
                    }
                }
            }
        }
    }

    fn take_capture(session: &Session) -> String {
        let bytes = session.shared.capture().take().unwrap_or_default();
        let stripped = strip_ansi_escapes::strip(&bytes);
        String::from_utf8_lossy(&stripped).into_owned()
    }

    fn report(output: String, started: Instant) -> JobReport {
        JobReport {
            stdout: output.clone(),
            output,
            stderr: String::new(),
            exit_code: 0,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl std::fmt::Debug for InteractiveBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveBackend")
            .field("backend_type", &self.config.backend_type)
            .field("binary", &self.config.binary)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl Backend for InteractiveBackend {
    fn name(&self) -> &str {
        &self.config.backend_type
    }

    async fn preflight(&self) -> Result<(), LaunchError> {
        resolve_binary(&self.config.binary).map(|_| ())
    }

    async fn execute(&self, job: &Job, ctx: ExecutionContext) -> JobOutcome {
        if let Some(reason) = self.disabled_reason() {
            return Err(JobFailure::new(FailureKind::BackendUnavailable, reason));
        }
        let Some(prompt) = Self::prompt_for(job) else {
            return Err(JobFailure::new(
                FailureKind::MalformedPayload,
                "job has no instruction, input.prompt or script to send",
            ));
        };

        let started = Instant::now();
        let deadline = started + ctx.deadline;
        let mut slot = self.session.lock().await;

        if slot.as_ref().is_some_and(Session::has_exited) {
            debug!("previous interactive session is gone, restarting");
            *slot = None;
            self.set_state(InteractiveState::NotStarted);
        }

        if slot.is_none() {
            self.set_state(InteractiveState::Starting);
            let session = match self.launch(ctx.size.unwrap_or(DEFAULT_SIZE)).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "interactive backend failed to launch, disabling it");
                    let reason = format!("{} cannot start: {e}", self.config.backend_type);
                    self.disable(reason.clone());
                    self.set_state(InteractiveState::Terminated);
                    return Err(JobFailure::new(FailureKind::BackendUnavailable, reason));
                }
            };
            let session = slot.insert(session);
            if let Err(failure) = self.await_startup(session, &ctx).await {
                let _ = session.terminate(self.config.grace).await;
                *slot = None;
                self.set_state(InteractiveState::Terminated);
                return Err(failure);
            }
            self.set_state(InteractiveState::Ready);
        }

        let Some(session) = slot.as_ref() else {
            return Err(JobFailure::new(FailureKind::Backend, "interactive session missing"));
        };

        // Executing: fresh capture, no stale marker, then the prompt.
        self.set_state(InteractiveState::Executing);
        let _ = std::fs::remove_file(&session.marker);
        session.shared.interrupted.store(false, Ordering::SeqCst);
        *session.shared.capture() = Some(Vec::new());
        let guard = ctx.foreground.scoped(session.control());

        if let Some(size) = ctx.size {
            let _ = session.control().resize(size.cols, size.rows);
        }
        let sent = session.send(prompt.as_bytes());
        if sent.is_ok() {
            sleep(self.config.submit_delay).await;
        }
        if let Err(e) = sent.and_then(|()| session.send(&self.config.submit)) {
            drop(guard);
            *slot = None;
            self.set_state(InteractiveState::Terminated);
            return Err(JobFailure::new(
                FailureKind::BackendExited,
                format!("failed to send prompt: {e}"),
            ));
        }
        info!(job_id = %job.id, "prompt injected, awaiting turn completion");

        self.set_state(InteractiveState::AwaitingCompletion);
        let turn = self.await_turn(session, &ctx, deadline).await;

        let outcome = match turn {
            Turn::Completed => {
                let _ = std::fs::remove_file(&session.marker);
                let output = Self::take_capture(session);
                self.set_state(InteractiveState::Ready);
                if let Some(reset) = &self.config.reset_command {
                    let _ = session
                        .send(reset.as_bytes())
                        .and_then(|()| session.send(&self.config.submit));
                }
                Ok(Self::report(output, started))
            }
            Turn::Interrupted => {
                let output = Self::take_capture(session);
                self.set_state(InteractiveState::Ready);
                Err(JobFailure::new(FailureKind::Interrupted, "interrupted by operator")
                    .with_report(Self::report(output, started)))
            }
            Turn::Exited => {
                let output = Self::take_capture(session);
                self.set_state(InteractiveState::Terminated);
                Err(JobFailure::new(
                    FailureKind::BackendExited,
                    "interactive backend exited while the job was running",
                )
                .with_report(Self::report(output, started)))
            }
            Turn::TimedOut => {
                self.set_state(InteractiveState::Interrupting);
                let _ = session.send(&[ETX]);
                let termination = session.terminate(self.config.grace).await;
                warn!(job_id = %job.id, ?termination, "interactive job timed out, session torn down");
                let output = Self::take_capture(session);
                self.set_state(InteractiveState::Terminated);
                Err(JobFailure::new(
                    FailureKind::Timeout,
                    format!("no turn completion within {}ms", ctx.deadline.as_millis()),
                )
                .with_report(Self::report(output, started)))
            }
            Turn::Cancelled => {
                self.set_state(InteractiveState::Interrupting);
                let _ = session.send(&[ETX]);
                // Give the coordinator's escalation a chance first.
                let waited = tokio::time::timeout(self.config.grace, async {
                    while !session.has_exited() {
                        sleep(STARTUP_POLL).await;
                    }
                })
                .await;
                if waited.is_err() {
                    let _ = session.terminate(self.config.grace).await;
                }
                let output = Self::take_capture(session);
                self.set_state(InteractiveState::Terminated);
                Err(JobFailure::new(FailureKind::Cancelled, "harness shutting down")
                    .with_report(Self::report(output, started)))
            }
        };

        drop(guard);
        if self.state() == InteractiveState::Terminated {
            *slot = None;
        }
        outcome
    }

    async fn shutdown(&self, grace: Duration) -> Termination {
        let Ok(mut slot) = tokio::time::timeout(grace, self.session.lock()).await else {
            warn!("interactive session busy at shutdown");
            return Termination::AlreadyExited;
        };
        let Some(session) = slot.take() else {
            return Termination::AlreadyExited;
        };
        let outcome = session.terminate(grace).await;
        self.set_state(InteractiveState::Terminated);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prefers_rendered_instruction() {
        let job = Job::new("j", NAME)
            .with_instruction("fix the bug")
            .with_input(serde_json::json!({"prompt": "other"}));
        assert_eq!(InteractiveBackend::prompt_for(&job), Some("fix the bug"));

        let job = Job::new("j", NAME).with_input(serde_json::json!({"prompt": "from input"}));
        assert_eq!(InteractiveBackend::prompt_for(&job), Some("from input"));

        assert!(InteractiveBackend::prompt_for(&Job::new("j", NAME)).is_none());
    }

    #[test]
    fn settings_hook_touches_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_settings(tmp.path()).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        let command = v["hooks"]["Stop"][0]["hooks"][0]["command"].as_str().unwrap();
        assert_eq!(command, "touch \"$ROOST_TURN_MARKER\"");
    }

    #[test]
    fn defaults_match_claude_code() {
        let cfg = InteractiveConfig::default();
        assert_eq!(cfg.binary, "claude");
        assert_eq!(cfg.submit, b"\r");
        assert_eq!(cfg.reset_command.as_deref(), Some("/clear"));
        assert_eq!(cfg.marker_poll_interval, Duration::from_millis(250));
        assert!(cfg.settings_hook);
    }
}
