//! Interactive backend driving a fake conversational CLI in a real pty.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use roost_core::backend::interactive::{InteractiveBackend, InteractiveConfig, InteractiveState, NAME, STREAM};
use roost_core::backend::{Backend, BackendIo, ExecutionContext, LaunchError};
use roost_core::foreground::Foreground;
use roost_core::job::{FailureKind, Job};
use roost_core::terminal::TerminalOut;
use roost_test_utils::{RecordingTranscript, SharedBuffer};

/// Answers every non-slash line and signals the turn through the marker.
/// The line `quit-now` makes it exit; `hang` answers without a marker.
const FAKE_CLI: &str = r#"#!/bin/sh
echo "fake cli ready"
while IFS= read -r line; do
  case "$line" in
    /*) ;;
    quit-now) exit 3 ;;
    hang) echo "thinking forever" ;;
    *) echo "answer: $line"; touch "$ROOST_TURN_MARKER" ;;
  esac
done
"#;

/// Never signals a turn; reports SIGINT and keeps reading.
const TRAPPING_CLI: &str = r#"#!/bin/sh
trap 'echo "caught interrupt"' INT
echo "fake cli ready"
while :; do
  if IFS= read -r line; then
    case "$line" in
      /*) ;;
      *) echo "thinking about: $line" ;;
    esac
  fi
done
"#;

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-cli");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(binary: &Path) -> InteractiveConfig {
    InteractiveConfig {
        binary: binary.to_string_lossy().into_owned(),
        settings_hook: false,
        submit_delay: Duration::from_millis(20),
        marker_poll_interval: Duration::from_millis(50),
        startup_quiet: Duration::from_millis(200),
        startup_timeout: Duration::from_secs(5),
        interrupt_settle: Duration::from_millis(200),
        grace: Duration::from_millis(500),
        ..InteractiveConfig::default()
    }
}

fn backend(config: InteractiveConfig) -> (InteractiveBackend, Arc<RecordingTranscript>) {
    let transcript = RecordingTranscript::new();
    let io = BackendIo::new(TerminalOut::new(SharedBuffer::new()), transcript.clone());
    (InteractiveBackend::new(config, io), transcript)
}

fn ctx(deadline: Duration) -> ExecutionContext {
    ExecutionContext::new(CancellationToken::new(), deadline, Foreground::new())
}

#[tokio::test]
async fn session_persists_across_jobs() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), FAKE_CLI);
    let (backend, transcript) = backend(config(&script));
    assert_eq!(backend.state(), InteractiveState::NotStarted);
    backend.preflight().await.unwrap();

    let first = backend
        .execute(&Job::new("j1", NAME).with_instruction("first question"), ctx(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(first.output.contains("answer: first question"), "{:?}", first.output);
    assert_eq!(first.exit_code, 0);
    assert_eq!(backend.state(), InteractiveState::Ready);

    let second = backend
        .execute(
            &Job::new("j2", NAME).with_input(serde_json::json!({"prompt": "second question"})),
            ctx(Duration::from_secs(10)),
        )
        .await
        .unwrap();
    assert!(second.output.contains("answer: second question"), "{:?}", second.output);
    assert!(!second.output.contains("first question"), "{:?}", second.output);
    assert!(!second.output.contains('\x1b'));

    assert!(transcript.text(STREAM).contains("fake cli ready"));
    assert!(matches!(
        backend.shutdown(Duration::from_millis(500)).await,
        roost_core::process::Termination::Graceful | roost_core::process::Termination::Forced
    ));
    assert_eq!(backend.state(), InteractiveState::Terminated);
}

#[tokio::test]
async fn missing_binary_disables_the_backend() {
    let tmp = tempfile::tempdir().unwrap();
    let (backend, _) = backend(config(&tmp.path().join("no-such-cli")));

    let err = backend.preflight().await.unwrap_err();
    assert!(matches!(err, LaunchError::BinaryNotFound { .. }), "{err:?}");

    for id in ["a", "b"] {
        let failure = backend
            .execute(&Job::new(id, NAME).with_instruction("hi"), ctx(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::BackendUnavailable);
    }
}

#[tokio::test]
async fn missing_prompt_is_malformed() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), FAKE_CLI);
    let (backend, _) = backend(config(&script));
    let failure = backend
        .execute(&Job::new("empty", NAME), ctx(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::MalformedPayload);
    assert_eq!(backend.state(), InteractiveState::NotStarted);
}

#[tokio::test]
async fn backend_exit_fails_the_job_and_restarts_next_time() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), FAKE_CLI);
    let (backend, _) = backend(config(&script));

    let failure = backend
        .execute(&Job::new("die", NAME).with_instruction("quit-now"), ctx(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::BackendExited);
    assert_eq!(backend.state(), InteractiveState::Terminated);

    let report = backend
        .execute(&Job::new("again", NAME).with_instruction("still there"), ctx(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(report.output.contains("answer: still there"));
}

#[tokio::test]
async fn missing_marker_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), FAKE_CLI);
    let (backend, _) = backend(config(&script));

    let failure = backend
        .execute(&Job::new("stuck", NAME).with_instruction("hang"), ctx(Duration::from_millis(800)))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert_eq!(backend.state(), InteractiveState::Terminated);
}

#[tokio::test]
async fn operator_interrupt_reaches_the_cli_and_keeps_the_session() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), TRAPPING_CLI);
    let (backend, transcript) = backend(config(&script));
    let backend = Arc::new(backend);
    let foreground = Foreground::new();

    let run = tokio::spawn({
        let backend = Arc::clone(&backend);
        let ctx = ExecutionContext::new(CancellationToken::new(), Duration::from_secs(10), foreground.clone());
        async move {
            backend
                .execute(&Job::new("long", NAME).with_instruction("a long question"), ctx)
                .await
        }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.state() != InteractiveState::AwaitingCompletion
            || !transcript.text(STREAM).contains("thinking about")
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(foreground.interrupt());

    let failure = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Interrupted);
    // The pty turns the interrupt byte into SIGINT for the CLI.
    assert!(transcript.text(STREAM).contains("caught interrupt"));
    assert_eq!(backend.state(), InteractiveState::Ready);
    backend.shutdown(Duration::from_millis(500)).await;
}
