//! Process-group signalling and graceful-then-forceful termination.
//!
//! Every backend child is a session (and therefore process-group) leader,
//! so signalling `-pgid` reaches the CLI and everything it spawned.

use std::io;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

/// Poll period while waiting for a group to exit after SIGTERM.
const EXIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Send `signal` to every process in group `pgid`.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: Signal) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pgid out of range"))?;
    if pgid <= 1 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pgid <= 1"));
    }
    // SAFETY: killpg has no memory-safety preconditions; pgid is a group
    // we created and is never 0 or 1.
    let ret = unsafe { libc::killpg(pgid, signal.raw()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pgid: u32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "process groups require unix"))
}

/// Whether any member of group `pgid` still exists (zombies included).
pub fn group_alive(pgid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pgid) = libc::pid_t::try_from(pgid) else {
            return false;
        };
        // SAFETY: signal 0 only performs the existence/permission check.
        unsafe { libc::killpg(pgid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
        false
    }
}

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing was running.
    AlreadyExited,
    /// The group exited within the grace period after SIGTERM.
    Graceful,
    /// SIGKILL was needed.
    Forced,
}

/// SIGTERM the group, wait up to `grace` for `exited()` to report true,
/// then SIGKILL.
pub async fn terminate_group(pgid: u32, grace: Duration, exited: impl Fn() -> bool) -> Termination {
    if exited() {
        return Termination::AlreadyExited;
    }

    match signal_group(pgid, Signal::Terminate) {
        Ok(()) => debug!(pgid, "sent SIGTERM to process group"),
        Err(e) if e.raw_os_error() == Some(esrch()) => return Termination::AlreadyExited,
        Err(e) => warn!(pgid, error = %e, "SIGTERM failed, escalating"),
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if exited() {
            debug!(pgid, "process group exited after SIGTERM");
            return Termination::Graceful;
        }
        sleep(EXIT_POLL).await;
    }
    if exited() {
        return Termination::Graceful;
    }

    warn!(pgid, grace_ms = grace.as_millis() as u64, "process group ignored SIGTERM, sending SIGKILL");
    if let Err(e) = signal_group(pgid, Signal::Kill) {
        debug!(pgid, error = %e, "SIGKILL failed");
    }
    Termination::Forced
}

fn esrch() -> i32 {
    #[cfg(unix)]
    {
        libc::ESRCH
    }
    #[cfg(not(unix))]
    {
        3
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn spawn_group(script: &str) -> std::process::Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .process_group(0)
            .spawn()
            .unwrap()
    }

    /// Reap the child on a thread and expose its exit as a flag.
    fn watch_exit(mut child: std::process::Child) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        std::thread::spawn(move || {
            let _ = child.wait();
            f.store(true, Ordering::SeqCst);
        });
        flag
    }

    #[tokio::test]
    async fn cooperative_group_exits_gracefully() {
        let child = spawn_group("sleep 30");
        let pgid = child.id();
        let exited = watch_exit(child);

        let outcome = terminate_group(pgid, Duration::from_secs(2), || exited.load(Ordering::SeqCst)).await;
        assert_eq!(outcome, Termination::Graceful);
    }

    #[tokio::test]
    async fn stubborn_group_is_killed() {
        let child = spawn_group("trap '' TERM; while true; do sleep 0.05; done");
        let pgid = child.id();
        let exited = watch_exit(child);
        // Let the shell install its trap.
        sleep(Duration::from_millis(200)).await;

        let outcome = terminate_group(pgid, Duration::from_millis(200), || exited.load(Ordering::SeqCst)).await;
        assert_eq!(outcome, Termination::Forced);

        let start = std::time::Instant::now();
        while !exited.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(2) {
            sleep(Duration::from_millis(20)).await;
        }
        assert!(exited.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn already_exited_is_reported() {
        let outcome = terminate_group(999_999, Duration::from_millis(10), || true).await;
        assert_eq!(outcome, Termination::AlreadyExited);
    }

    #[test]
    fn refuses_init_and_own_group_ids() {
        assert!(signal_group(0, Signal::Interrupt).is_err());
        assert!(signal_group(1, Signal::Interrupt).is_err());
    }
}
