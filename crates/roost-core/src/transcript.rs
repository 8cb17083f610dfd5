//! Append-only transcript of backend output.
//!
//! The harness only ever calls [`TranscriptSink::append`]; sinks are
//! called from blocking reader threads as well as async tasks, so the
//! trait is synchronous.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

pub trait TranscriptSink: Send + Sync {
    /// Record one output chunk from `stream`.
    fn append(&self, stream: &str, bytes: &[u8]) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTranscript;

impl TranscriptSink for NullTranscript {
    fn append(&self, _stream: &str, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct Line<'a> {
    ts: String,
    stream: &'a str,
    len: usize,
    text: String,
}

/// One JSON object per chunk: `{"ts", "stream", "len", "text"}`.
pub struct JsonlTranscript {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlTranscript {
    /// Open (or create) `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create transcript dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open transcript {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TranscriptSink for JsonlTranscript {
    fn append(&self, stream: &str, bytes: &[u8]) -> Result<()> {
        let line = Line {
            ts: Utc::now().to_rfc3339(),
            stream,
            len: bytes.len(),
            text: String::from_utf8_lossy(bytes).into_owned(),
        };
        let mut json = serde_json::to_vec(&line).context("failed to encode transcript line")?;
        json.push(b'\n');

        let mut w = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        w.write_all(&json)
            .and_then(|()| w.flush())
            .with_context(|| format!("failed to append to transcript {}", self.path.display()))
    }
}

impl std::fmt::Debug for JsonlTranscript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlTranscript").field("path", &self.path).finish()
    }
}
