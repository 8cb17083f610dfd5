//! Subprocess backend: one `sh -c` per job, under a deadline.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::launch::{LaunchError, classify_spawn_error, resolve_binary};
use super::{Backend, BackendIo, ExecutionContext};
use crate::foreground::ForegroundControl;
use crate::job::{FailureKind, Job, JobFailure, JobOutcome, JobReport};
use crate::process::{self, Signal};

/// Backend type name.
pub const NAME: &str = "subprocess";

const DEFAULT_SHELL: &str = "sh";
const DEFAULT_GRACE: Duration = Duration::from_secs(5);
/// How long output pumps may linger after the process exits (a detached
/// grandchild can keep the pipes open).
const PUMP_DRAIN: Duration = Duration::from_millis(500);

pub struct SubprocessBackend {
    io: BackendIo,
    shell: String,
    grace: Duration,
}

impl SubprocessBackend {
    pub fn new(io: BackendIo) -> Self {
        Self {
            io,
            shell: DEFAULT_SHELL.to_string(),
            grace: DEFAULT_GRACE,
        }
    }

    /// Time between SIGTERM and SIGKILL when a job overruns.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl std::fmt::Debug for SubprocessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessBackend")
            .field("shell", &self.shell)
            .field("grace", &self.grace)
            .finish()
    }
}

/// Command text for `job`: rendered instruction, then `input.command`,
/// then the raw script.
pub fn resolve_command(job: &Job) -> Option<&str> {
    job.rendered_instruction()
        .or_else(|| job.input_field("command"))
        .or_else(|| job.raw_script())
}

/// Raw-mode terminals need CRLF; the process only ever writes LF.
pub fn lf_to_crlf(chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunk.len() + chunk.len() / 16);
    let mut prev = 0u8;
    for &b in chunk {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

// ---------------------------------------------------------------------------
// Foreground handle
// ---------------------------------------------------------------------------

enum StdinEvent {
    Data(Vec<u8>),
    Eof,
}

struct SubprocessControl {
    pgid: Option<u32>,
    stdin: mpsc::UnboundedSender<StdinEvent>,
    exited: Arc<AtomicBool>,
}

impl ForegroundControl for SubprocessControl {
    fn backend(&self) -> &str {
        NAME
    }

    fn write_input(&self, bytes: &[u8]) -> io::Result<()> {
        // The terminal is raw, so emulate the line discipline the child
        // would have had: Enter becomes newline and Ctrl-D closes stdin.
        let mut data = Vec::with_capacity(bytes.len());
        let mut eof = false;
        for &b in bytes {
            match b {
                b'\r' => data.push(b'\n'),
                0x04 => {
                    eof = true;
                    break;
                }
                _ => data.push(b),
            }
        }
        let closed = || io::Error::new(io::ErrorKind::BrokenPipe, "subprocess stdin closed");
        if !data.is_empty() {
            self.stdin.send(StdinEvent::Data(data)).map_err(|_| closed())?;
        }
        if eof {
            self.stdin.send(StdinEvent::Eof).map_err(|_| closed())?;
        }
        Ok(())
    }

    fn process_group(&self) -> Option<u32> {
        self.pgid
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

fn spawn_stdin_writer(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<StdinEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                StdinEvent::Data(bytes) => {
                    if stdin.write_all(&bytes).await.is_err() || stdin.flush().await.is_err() {
                        break;
                    }
                }
                StdinEvent::Eof => break,
            }
        }
    })
}

fn spawn_pump<R>(mut reader: R, stream: &'static str, io: BackendIo) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut captured = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    io.emit(stream, &lf_to_crlf(chunk), chunk);
                    captured.extend_from_slice(chunk);
                }
                Err(e) => {
                    debug!(stream, error = %e, "subprocess pipe read failed");
                    break;
                }
            }
        }
        captured
    })
}

async fn drain(pump: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(mut pump) = pump else {
        return Vec::new();
    };
    match tokio::time::timeout(PUMP_DRAIN, &mut pump).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            warn!(error = %e, "output pump panicked");
            Vec::new()
        }
        Err(_) => {
            pump.abort();
            Vec::new()
        }
    }
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

enum Ending {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl SubprocessBackend {
    /// SIGTERM the group, give it `grace`, then SIGKILL; always reaps.
    async fn stop(&self, child: &mut Child, pgid: Option<u32>) -> Option<ExitStatus> {
        if let Some(pgid) = pgid {
            if let Err(e) = process::signal_group(pgid, Signal::Terminate) {
                debug!(pgid, error = %e, "SIGTERM failed");
            }
        }
        if let Ok(Ok(status)) = tokio::time::timeout(self.grace, child.wait()).await {
            return Some(status);
        }
        warn!(pgid, "subprocess ignored SIGTERM, sending SIGKILL");
        if let Some(pgid) = pgid {
            let _ = process::signal_group(pgid, Signal::Kill);
        }
        let _ = child.start_kill();
        child.wait().await.ok()
    }
}

#[async_trait]
impl Backend for SubprocessBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn preflight(&self) -> Result<(), LaunchError> {
        resolve_binary(&self.shell).map(|_| ())
    }

    async fn execute(&self, job: &Job, ctx: ExecutionContext) -> JobOutcome {
        let Some(command) = resolve_command(job) else {
            return Err(JobFailure::new(
                FailureKind::MalformedPayload,
                "job has no instruction, input.command or script to run",
            ));
        };

        let started = Instant::now();
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &job.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = classify_spawn_error(&self.shell, e);
                return Err(JobFailure::new(FailureKind::Backend, err.to_string()));
            }
        };
        let pgid = child.id();
        info!(job_id = %job.id, pgid, "subprocess started");

        let stdout = child.stdout.take().map(|r| spawn_pump(r, "stdout", self.io.clone()));
        let stderr = child.stderr.take().map(|r| spawn_pump(r, "stderr", self.io.clone()));

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let stdin_task = child.stdin.take().map(|s| spawn_stdin_writer(s, stdin_rx));

        let exited = Arc::new(AtomicBool::new(false));
        let control = Arc::new(SubprocessControl {
            pgid,
            stdin: stdin_tx,
            exited: Arc::clone(&exited),
        });
        let guard = ctx.foreground.scoped(control);

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status),
            _ = tokio::time::sleep(ctx.deadline) => Ending::TimedOut,
            _ = ctx.cancel.cancelled() => Ending::Cancelled,
        };

        let status = match &ending {
            Ending::Exited(Ok(status)) => Some(*status),
            Ending::Exited(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "failed to wait on subprocess");
                None
            }
            Ending::TimedOut => {
                warn!(job_id = %job.id, deadline_ms = ctx.deadline.as_millis() as u64, "subprocess timed out");
                self.stop(&mut child, pgid).await
            }
            Ending::Cancelled => {
                // The coordinator is already escalating; this is the
                // backstop in case nobody else does.
                match tokio::time::timeout(self.grace, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => self.stop(&mut child, pgid).await,
                }
            }
        };
        exited.store(true, Ordering::SeqCst);
        drop(guard);
        if let Some(task) = stdin_task {
            task.abort();
        }

        let stdout = String::from_utf8_lossy(&drain(stdout).await).into_owned();
        let stderr = String::from_utf8_lossy(&drain(stderr).await).into_owned();
        let code = status.as_ref().map(exit_code).unwrap_or(-1);
        let report = JobReport {
            output: format!("{stdout}{stderr}"),
            stdout,
            stderr,
            exit_code: code,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        debug!(job_id = %job.id, exit_code = code, duration_ms = report.duration_ms, "subprocess finished");

        match ending {
            Ending::Exited(Ok(_)) if code == 0 => Ok(report),
            Ending::Exited(Ok(_)) => Err(JobFailure::new(
                FailureKind::ExitCode,
                format!("command exited with status {code}"),
            )
            .with_exit_code(code)
            .with_report(report)),
            Ending::Exited(Err(e)) => Err(JobFailure::new(
                FailureKind::Backend,
                format!("failed to wait on command: {e}"),
            )
            .with_report(report)),
            Ending::TimedOut => Err(JobFailure::new(
                FailureKind::Timeout,
                format!("command timed out after {}ms", ctx.deadline.as_millis()),
            )
            .with_report(report)),
            Ending::Cancelled => Err(JobFailure::new(
                FailureKind::Cancelled,
                "harness shutting down",
            )
            .with_report(report)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_resolution_order() {
        let job = Job::new("j", NAME)
            .with_instruction("echo instr")
            .with_input(serde_json::json!({"command": "echo input"}))
            .with_script("echo script");
        assert_eq!(resolve_command(&job), Some("echo instr"));

        let job = Job::new("j", NAME)
            .with_instruction("  ")
            .with_input(serde_json::json!({"command": "echo input"}))
            .with_script("echo script");
        assert_eq!(resolve_command(&job), Some("echo input"));

        let job = Job::new("j", NAME).with_script("echo script");
        assert_eq!(resolve_command(&job), Some("echo script"));

        assert_eq!(resolve_command(&Job::new("j", NAME)), None);
    }

    #[test]
    fn lf_becomes_crlf_once() {
        assert_eq!(lf_to_crlf(b"a\nb\r\nc"), b"a\r\nb\r\nc".to_vec());
        assert_eq!(lf_to_crlf(b"\n\n"), b"\r\n\r\n".to_vec());
        assert_eq!(lf_to_crlf(b"plain"), b"plain".to_vec());
    }

    #[tokio::test]
    async fn keystrokes_get_line_discipline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let control = SubprocessControl {
            pgid: None,
            stdin: tx,
            exited: Arc::new(AtomicBool::new(false)),
        };
        control.write_input(b"yes\r").unwrap();
        control.write_input(b"ab\x04cd").unwrap();

        match rx.recv().await.unwrap() {
            StdinEvent::Data(d) => assert_eq!(d, b"yes\n"),
            StdinEvent::Eof => panic!("unexpected eof"),
        }
        match rx.recv().await.unwrap() {
            StdinEvent::Data(d) => assert_eq!(d, b"ab"),
            StdinEvent::Eof => panic!("unexpected eof"),
        }
        assert!(matches!(rx.recv().await.unwrap(), StdinEvent::Eof));
    }
}
