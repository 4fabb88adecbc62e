//! Error types for procrack.
//!
//! Configuration, resolution and teardown failures are raised synchronously as [`ExecError`].
//! A failed spawn is never raised: it is recorded as [`EndStatus::CantStart`] and observed
//! through the supervisor's status queries.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::process::EndStatus;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum ExecError {
    /// A prefix, tag or other setting is malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The working directory is missing or unusable.
    #[error("invalid working directory {path}: {reason}")]
    WorkingDirectory { path: PathBuf, reason: String },

    /// No valid executable matched the requested name.
    #[error("executable not found: {name} (searched {} directories)", searched.len())]
    NotFound { name: String, searched: Vec<PathBuf> },

    /// `start` was called on a supervisor that was already started.
    #[error("process already started: {command}")]
    AlreadyStarted { command: String },

    /// No tokio runtime was configured or current when the process had to be driven.
    #[error("no tokio runtime available to drive the process")]
    NoRuntime,

    /// Some processes of the tree survived forceful termination.
    #[error("process tree of {root} could not be terminated, survivors: {survivors:?}")]
    Unkillable { root: u32, survivors: Vec<u32> },

    /// The OS refused a termination request.
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// The process ran but did not end correctly.
    #[error("{command} ended with {status} (exit code {exit_code:?})")]
    InvalidExecution {
        command: String,
        status: EndStatus,
        exit_code: Option<i32>,
        stderr: Vec<String>,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ExecError>;
