//! Termination primitives for process trees.
//!
//! Graceful termination is SIGTERM on Unix and CTRL_BREAK on Windows, forceful is SIGKILL
//! and `taskkill /F /T`. The supervisor sequences them: descendants first, then the root.

use std::io;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{ExecError, Result};
use crate::procinfo;

/// How long killed processes get to disappear after a forceful termination.
pub const FORCE_SETTLE: Duration = Duration::from_millis(500);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Termination strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forceful,
}

/// Sends a termination request to `pid`. A process already gone is not an error.
pub fn terminate(pid: u32, termination: Termination) -> Result<()> {
    debug!(pid = %pid, ?termination, "Terminating process");
    send_termination(pid, termination).map_err(|source| ExecError::Signal { pid, source })
}

#[cfg(unix)]
fn send_termination(pid: u32, termination: Termination) -> io::Result<()> {
    let signal = match termination {
        Termination::Graceful => libc::SIGTERM,
        Termination::Forceful => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(windows)]
fn send_termination(pid: u32, termination: Termination) -> io::Result<()> {
    match termination {
        Termination::Graceful => {
            use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
            // The process was created as the root of its own console process group.
            unsafe {
                GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
            }
            Ok(())
        }
        Termination::Forceful => {
            let status = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()?;
            if status.success() || !procinfo::is_alive(pid) {
                Ok(())
            } else {
                Err(io::Error::other(format!("taskkill exited with {}", status)))
            }
        }
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_termination(_pid: u32, _termination: Termination) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process termination is not supported on this platform",
    ))
}

/// Waits until every pid in `pids` is gone or `within` elapsed; returns the survivors.
pub async fn wait_gone(pids: &[u32], within: Duration) -> Vec<u32> {
    let deadline = Instant::now() + within;
    loop {
        let survivors: Vec<u32> = pids
            .iter()
            .copied()
            .filter(|pid| procinfo::is_alive(*pid))
            .collect();
        if survivors.is_empty() || Instant::now() >= deadline {
            return survivors;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Graceful then forceful termination of `pids`, each visited at most once per stage.
///
/// Returns the processes still alive after the forceful stage.
pub async fn terminate_all(pids: &[u32], grace: Duration) -> Vec<u32> {
    if pids.is_empty() {
        return Vec::new();
    }
    for pid in pids {
        if let Err(err) = terminate(*pid, Termination::Graceful) {
            debug!(pid = %pid, error = %err, "Graceful termination refused");
        }
    }
    let stubborn = wait_gone(pids, grace).await;
    if stubborn.is_empty() {
        return stubborn;
    }
    for pid in &stubborn {
        if let Err(err) = terminate(*pid, Termination::Forceful) {
            debug!(pid = %pid, error = %err, "Forceful termination refused");
        }
    }
    wait_gone(&stubborn, FORCE_SETTLE).await
}
