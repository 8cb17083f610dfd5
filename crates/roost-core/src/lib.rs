//! Core of the `roost` interactive execution harness.
//!
//! The harness claims jobs from a remote queue, runs each one through a
//! pluggable [`backend::Backend`] (an interactive CLI inside a
//! pseudo-terminal, or a shell subprocess), and paints a status overlay
//! above the backend's raw terminal output.
//!
//! # Architecture
//!
//! ```text
//! Harness (shutdown coordinator)
//!     |
//!     +-- TerminalController  raw mode, scroll region, restore-on-exit
//!     +-- SnapshotOwner       applies SnapshotDelta messages serially
//!     +-- Display             render(snapshot) on tick / change
//!     +-- JobLoop             claim -> start -> execute -> report
//!     +-- HeartbeatTask       periodic liveness
//!     +-- InputRouter         chords vs. passthrough keystrokes
//! ```

pub mod backend;
pub mod bundle;
pub mod config;
pub mod display;
pub mod error;
pub mod foreground;
pub mod harness;
pub mod heartbeat;
pub mod input;
pub mod job;
pub mod job_loop;
pub mod process;
pub mod queue;
pub mod render;
pub mod shutdown;
pub mod snapshot;
pub mod terminal;
pub mod transcript;

pub use config::HarnessConfig;
pub use error::HarnessError;
pub use harness::Harness;
