//! Integration tests for the `roost` binary's setup paths.
//!
//! Each test points XDG config and state dirs at a temp directory and runs
//! the binary with stdin detached, so the terminal checks always fail.

use std::path::Path;
use std::process::{Command, Output, Stdio};

fn roost(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_roost"))
        .args(args)
        .env("XDG_CONFIG_HOME", home.join("config"))
        .env("XDG_STATE_HOME", home.join("state"))
        .env("HOME", home)
        .env_remove("ROOST_QUEUE_URL")
        .env_remove("ROOST_HABITAT")
        .env_remove("ROOST_TOKEN")
        .env_remove("ROOST_SIDEBAR")
        .env_remove("ROOST_INTERACTIVE")
        .stdin(Stdio::null())
        .output()
        .expect("failed to run roost binary")
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn init_writes_config_and_refuses_to_overwrite() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = roost(
        tmp.path(),
        &["init", "--queue-url", "http://queue.test/api", "--habitat", "hab-1"],
    );
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let path = tmp.path().join("config").join("roost").join("config.toml");
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("http://queue.test/api"), "{contents}");
    assert!(contents.contains("hab-1"), "{contents}");

    let again = roost(
        tmp.path(),
        &["init", "--queue-url", "http://other", "--habitat", "hab-2"],
    );
    assert_eq!(again.status.code(), Some(1));
    assert!(stderr(&again).contains("already exists"), "{}", stderr(&again));

    let forced = roost(
        tmp.path(),
        &["init", "--force", "--queue-url", "http://other", "--habitat", "hab-2"],
    );
    assert!(forced.status.success());
    assert!(std::fs::read_to_string(&path).unwrap().contains("hab-2"));
}

#[test]
fn run_without_queue_url_is_a_usage_error() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = roost(tmp.path(), &["run"]);
    assert_eq!(out.status.code(), Some(64));
    assert!(stderr(&out).contains("queue URL not set"), "{}", stderr(&out));
}

#[test]
fn run_without_terminal_is_a_usage_error() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = roost(
        tmp.path(),
        &[
            "--queue-url",
            "http://127.0.0.1:9",
            "--habitat",
            "hab",
            "--no-interactive",
        ],
    );
    assert_eq!(out.status.code(), Some(64), "stderr: {}", stderr(&out));
    assert!(stderr(&out).contains("interactive terminal"), "{}", stderr(&out));
    assert!(tmp.path().join("state").join("roost").join("roost.log").exists());
}

#[test]
fn run_with_missing_interactive_binary_is_a_usage_error() {
    let tmp = tempfile::TempDir::new().unwrap();
    let missing = tmp.path().join("no-such-cli");
    let out = roost(
        tmp.path(),
        &[
            "run",
            "--queue-url",
            "http://127.0.0.1:9",
            "--habitat",
            "hab",
            "--interactive-binary",
            missing.to_str().unwrap(),
        ],
    );
    assert_eq!(out.status.code(), Some(64), "stderr: {}", stderr(&out));
    assert!(stderr(&out).contains("interactive"), "{}", stderr(&out));
}

#[test]
fn check_reports_each_item() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = roost(
        tmp.path(),
        &[
            "check",
            "--queue-url",
            "http://127.0.0.1:9",
            "--habitat",
            "hab",
            "--no-interactive",
        ],
    );
    let text = stdout(&out);
    assert!(text.contains("[FAIL] terminal"), "{text}");
    assert!(text.contains("backend:subprocess"), "{text}");
    assert_eq!(out.status.code(), Some(64));
}
