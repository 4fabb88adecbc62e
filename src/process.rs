//! Data structures for tracking process state.
//!
//! This module defines the lifecycle phase of a supervised process (`Phase`), the post hoc
//! classification of how it ended (`EndStatus`) and the recorded cause of a kill (`KillCause`).

use std::fmt;

/// Lifecycle phase of a supervised process.
///
/// Transitions only move forward: `Unstarted -> Starting -> Running -> Finished`, or
/// `Starting -> Finished` when the OS refuses to spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// `start` has not been called.
    Unstarted,
    /// The start step is scheduled or in progress.
    Starting,
    /// The OS process is alive.
    Running,
    /// The OS process has exited, or never started.
    Finished,
}

impl Phase {
    /// Whether the start step has completed, successfully or not.
    pub fn is_started(self) -> bool {
        self >= Phase::Running
    }
}

/// How a process execution concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndStatus {
    /// The process has not finished yet.
    NotYetDone,
    /// The process exited, and with code zero if the launch spec demanded it.
    CorrectlyDone,
    /// The process exited with a non-zero code while zero was required.
    DoneWithError,
    /// The process tree was killed by the caller.
    Killed,
    /// The process tree was killed by the watchdog.
    TooLongExecutionTime,
    /// The OS refused to launch the process.
    CantStart,
}

impl EndStatus {
    /// Whether this status describes a finished execution.
    pub fn is_done(self) -> bool {
        self != EndStatus::NotYetDone
    }
}

impl fmt::Display for EndStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EndStatus::NotYetDone => "not yet done",
            EndStatus::CorrectlyDone => "correctly done",
            EndStatus::DoneWithError => "done with error",
            EndStatus::Killed => "killed",
            EndStatus::TooLongExecutionTime => "too long execution time",
            EndStatus::CantStart => "can't start",
        };
        f.write_str(label)
    }
}

/// Who asked for the process tree to be killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillCause {
    Caller,
    Timeout,
}
