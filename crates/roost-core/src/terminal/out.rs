//! Shared handle to the real terminal output.
//!
//! Backend passthrough, the renderer and the controller all write here.
//! Each `write` holds the lock for one complete sequence, so a status
//! redraw is never interleaved with half of a backend chunk.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct TerminalOut {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl TerminalOut {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Handle on the process's stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// A sink that discards everything.
    pub fn null() -> Self {
        Self::new(io::sink())
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write `bytes` in full and flush.
    pub fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut w = self.lock();
        w.write_all(bytes)?;
        w.flush()
    }
}

impl Write for TerminalOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

impl std::fmt::Debug for TerminalOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalOut").finish_non_exhaustive()
    }
}
