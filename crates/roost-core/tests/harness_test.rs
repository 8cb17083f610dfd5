//! End-to-end harness runs over a detached terminal and fake queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use roost_core::backend::BackendRegistry;
use roost_core::bundle::BundleSummary;
use roost_core::config::HarnessConfig;
use roost_core::error::HarnessError;
use roost_core::job::{FailureKind, Job};
use roost_core::process::Termination;
use roost_core::queue::QueueError;
use roost_core::shutdown::ShutdownReason;
use roost_core::snapshot::SessionInfo;
use roost_core::terminal::{TerminalController, TerminalOut, Viewport};
use roost_core::Harness;
use roost_test_utils::{FakeQueue, ScriptedBackend, SharedBuffer};

fn config() -> HarnessConfig {
    HarnessConfig {
        poll_interval: Duration::from_millis(20),
        poll_jitter: Duration::ZERO,
        max_backoff: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(50),
        remote_call_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_millis(300),
        render_tick: Duration::from_millis(50),
        ..HarnessConfig::default()
    }
}

fn session() -> SessionInfo {
    SessionInfo {
        habitat_id: "hab".into(),
        queue_id: "main".into(),
        worker_id: "worker-7".into(),
    }
}

fn controller(screen: &SharedBuffer) -> TerminalController {
    TerminalController::detached(TerminalOut::new(screen.clone()), true, || Some(Viewport::new(120, 40)))
}

fn harness(queue: &FakeQueue, registry: BackendRegistry, screen: &SharedBuffer) -> Harness {
    Harness::new(config(), Arc::new(queue.clone()), registry, BundleSummary::default(), session())
        .with_output(TerminalOut::new(screen.clone()))
}

#[tokio::test]
async fn quit_chord_shuts_down_cleanly() {
    let queue = FakeQueue::new();
    queue.push_job(Job::new("j1", "subprocess").with_instruction("true"));
    let registry = BackendRegistry::builder()
        .register(ScriptedBackend::new("subprocess"))
        .build();
    let screen = SharedBuffer::new();
    let h = harness(&queue, registry, &screen);

    let (tx, rx) = mpsc::channel(8);
    let run = tokio::spawn(h.run_with(controller(&screen), rx, CancellationToken::new()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.completions().is_empty() || queue.heartbeats() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tx.send(b"\x1c".to_vec()).await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.reason, ShutdownReason::Quit);
    assert_eq!(report.termination, Termination::AlreadyExited);
    assert_eq!(report.counters.jobs_completed, 1);
    assert!(report.counters.heartbeats_sent >= 1);
    assert!(report.terminal_restored);
    assert!(report.deregistered);

    let deregs = queue.deregistrations();
    assert_eq!(deregs.len(), 1);
    assert_eq!(deregs[0].0, "worker-7");
    assert_eq!(deregs[0].1.jobs_completed, 1);

    let out = screen.contents();
    assert!(out.contains("\x1b[9;40r"), "scroll region below bar and sidebar");
    assert!(out.contains("roost"));
    assert!(out.contains("\x1b[r\x1b[0m"));
    assert!(out.ends_with("\x1b[?25h"));
}

#[tokio::test]
async fn idle_interrupt_terminates_immediately() {
    let queue = FakeQueue::new();
    let registry = BackendRegistry::builder()
        .register(ScriptedBackend::new("subprocess"))
        .build();
    let screen = SharedBuffer::new();
    let (tx, rx) = mpsc::channel(8);
    let run = tokio::spawn(harness(&queue, registry, &screen).run_with(
        controller(&screen),
        rx,
        CancellationToken::new(),
    ));

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.claims() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tx.send(b"\x03".to_vec()).await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.reason, ShutdownReason::IdleInterrupt);
    assert_eq!(report.counters.jobs_completed, 0);
}

#[tokio::test]
async fn external_cancellation_stops_the_harness() {
    let queue = FakeQueue::new();
    let registry = BackendRegistry::builder()
        .register(ScriptedBackend::new("subprocess"))
        .build();
    let screen = SharedBuffer::new();
    let cancel = CancellationToken::new();
    let (_tx, rx) = mpsc::channel(8);
    let run = tokio::spawn(harness(&queue, registry, &screen).run_with(controller(&screen), rx, cancel.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.reason, ShutdownReason::External);
    assert!(report.deregistered);
}

#[tokio::test]
async fn unauthorized_registration_is_fatal_and_restores_terminal() {
    let queue = FakeQueue::new();
    queue.fail_next_register(QueueError::Unauthorized { status: 401 });
    let registry = BackendRegistry::builder()
        .register(ScriptedBackend::new("subprocess"))
        .build();
    let screen = SharedBuffer::new();
    let (_tx, rx) = mpsc::channel(8);

    let err = harness(&queue, registry, &screen)
        .run_with(controller(&screen), rx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Unauthorized { status: 401 }));
    assert_eq!(err.exit_code(), 64);
    assert!(screen.contents().ends_with("\x1b[?25h"));
    assert_eq!(queue.claims(), 0);
}

#[tokio::test]
async fn transient_registration_failure_is_retried() {
    let queue = FakeQueue::new();
    queue.fail_next_register(QueueError::Transient("503".into()));
    let registry = BackendRegistry::builder()
        .register(ScriptedBackend::new("subprocess"))
        .build();
    let screen = SharedBuffer::new();
    let h = harness(&queue, registry, &screen);

    h.register(&CancellationToken::new()).await.unwrap();
    let registrations = queue
        .calls()
        .into_iter()
        .filter(|c| matches!(c, roost_test_utils::QueueCall::Register(_)))
        .count();
    assert_eq!(registrations, 2);
}

#[tokio::test]
async fn preflight_requires_a_backend() {
    let queue = FakeQueue::new();
    let screen = SharedBuffer::new();
    let err = harness(&queue, BackendRegistry::default(), &screen)
        .preflight()
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::NoBackends));
}

#[tokio::test]
async fn unsupported_job_never_executes() {
    let queue = FakeQueue::new();
    queue.push_job(Job::new("odd", "quantum").with_instruction("?"));
    let backend = ScriptedBackend::new("subprocess");
    let registry = BackendRegistry::builder().register(backend.clone()).build();
    let screen = SharedBuffer::new();
    let (tx, rx) = mpsc::channel(8);
    let run = tokio::spawn(harness(&queue, registry, &screen).run_with(
        controller(&screen),
        rx,
        CancellationToken::new(),
    ));

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.failures().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tx.send(b"\x1c".to_vec()).await.unwrap();
    let report = run.await.unwrap().unwrap();

    assert_eq!(backend.executions(), 0);
    assert_eq!(queue.failures()[0].1.kind, FailureKind::UnsupportedBackend);
    assert_eq!(report.counters.jobs_failed, 1);
}

#[tokio::test]
async fn quit_chord_works_while_registration_keeps_failing() {
    let queue = FakeQueue::new();
    for _ in 0..1000 {
        queue.fail_next_register(QueueError::Transient("connection refused".into()));
    }
    let registry = BackendRegistry::builder()
        .register(ScriptedBackend::new("subprocess"))
        .build();
    let screen = SharedBuffer::new();
    let (tx, rx) = mpsc::channel(8);
    let run = tokio::spawn(harness(&queue, registry, &screen).run_with(
        controller(&screen),
        rx,
        CancellationToken::new(),
    ));

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tx.send(b"\x1c".to_vec()).await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("harness kept retrying registration after quit")
        .unwrap()
        .unwrap();
    assert_eq!(report.reason, ShutdownReason::Quit);
    assert!(report.terminal_restored);
    assert!(!report.deregistered);
    assert!(queue.deregistrations().is_empty());
    assert_eq!(queue.claims(), 0);
    assert!(screen.contents().ends_with("\x1b[?25h"));
}
