//! Guarded writer over a process's standard input.

use std::io;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;

use crate::error::{ExecError, Result};

/// Line terminator of the host platform.
#[cfg(windows)]
pub const LINE_ENDING: &str = "\r\n";
/// Line terminator of the host platform.
#[cfg(not(windows))]
pub const LINE_ENDING: &str = "\n";

/// Line-oriented writer shared by callers and interactive handlers.
///
/// Every write holds the lock for its whole duration, so two writers never interleave
/// inside a line. Writes after [`StdinInjector::close`] fail with a broken pipe error.
#[derive(Clone)]
pub struct StdinInjector {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

impl StdinInjector {
    pub(crate) fn new(stdin: ChildStdin) -> Self {
        Self {
            stdin: Arc::new(Mutex::new(Some(stdin))),
        }
    }

    /// Writes raw bytes and flushes.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(closed());
        };
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Writes `text`, then the platform line terminator, then flushes.
    pub async fn write_line(&self, text: &str) -> Result<()> {
        self.write_line_bytes(text.as_bytes()).await
    }

    /// Writes already encoded text, then the platform line terminator, then flushes.
    pub async fn write_line_bytes(&self, encoded: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(closed());
        };
        stdin.write_all(encoded).await?;
        stdin.write_all(LINE_ENDING.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Closes the stream, the process reads end of input.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        if let Some(mut stdin) = guard.take() {
            stdin.shutdown().await?;
        }
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.stdin.lock().await.is_none()
    }
}

fn closed() -> ExecError {
    ExecError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "standard input is closed"))
}

impl std::fmt::Debug for StdinInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinInjector").finish_non_exhaustive()
    }
}
