//! Execution events for consumers driven by a channel.
//!
//! This module defines the `ExecEvent` enum and the `EventForwarder`, which plugs into a
//! capture layer as a line observer and into a supervisor as an end listener, and forwards
//! both as events on a `tokio::sync::mpsc` channel.

use tokio::sync::mpsc;

use crate::capture::LineObserver;
use crate::output::CapturedLine;
use crate::process::EndStatus;
use crate::supervisor::{EndListener, Supervisor};

/// Represents something that happened to a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    /// A line of output (stdout or stderr) was captured.
    Output(CapturedLine),
    /// The process ended; `exit_code` is `None` when it was ended by a signal.
    Ended {
        pid: Option<u32>,
        status: EndStatus,
        exit_code: Option<i32>,
    },
}

/// Forwards lines and the end of execution to a channel.
///
/// A dropped receiver is not an error, events are discarded.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<ExecEvent>,
}

impl EventForwarder {
    pub fn new(tx: mpsc::UnboundedSender<ExecEvent>) -> Self {
        Self { tx }
    }

    /// Creates a forwarder and the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl LineObserver for EventForwarder {
    fn on_line(&self, line: &CapturedLine) -> anyhow::Result<()> {
        let _ = self.tx.send(ExecEvent::Output(line.clone()));
        Ok(())
    }
}

impl EndListener for EventForwarder {
    fn on_end(&self, process: &Supervisor) -> anyhow::Result<()> {
        let _ = self.tx.send(ExecEvent::Ended {
            pid: process.pid(),
            status: process.end_status(),
            exit_code: process.exit_code(),
        });
        Ok(())
    }
}
