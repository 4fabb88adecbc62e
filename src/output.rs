//! Captured output lines and their retention.
//!
//! This module defines the captured line record (`CapturedLine`), the concurrency-safe store
//! that retains lines in arrival order (`LineBuffer`) and text sanitization for captured
//! content.

use std::collections::VecDeque;
use std::sync::Mutex;

use strip_ansi_escapes::strip;

/// Indicates the source stream of a captured line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// A single line read from a process stream, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLine {
    /// The content of the line.
    pub text: String,
    /// The stream it originated from.
    pub stream: StreamKind,
}

impl CapturedLine {
    pub fn new(text: impl Into<String>, stream: StreamKind) -> Self {
        Self {
            text: text.into(),
            stream,
        }
    }

    pub fn is_stdout(&self) -> bool {
        self.stream == StreamKind::Stdout
    }

    pub fn is_stderr(&self) -> bool {
        self.stream == StreamKind::Stderr
    }

    /// Whether the line holds only whitespace.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Order-preserving line store shared by stream readers and readers of the results.
///
/// Appends and snapshots may happen concurrently. With a capacity, the oldest lines are
/// dropped first.
#[derive(Debug, Default)]
pub struct LineBuffer {
    max_lines: Option<usize>,
    lines: Mutex<VecDeque<CapturedLine>>,
}

impl LineBuffer {
    /// Creates an unbounded buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer keeping at most `max_lines` lines.
    pub fn bounded(max_lines: usize) -> Self {
        Self {
            max_lines: Some(max_lines),
            lines: Mutex::new(VecDeque::with_capacity(max_lines.min(1024))),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, VecDeque<CapturedLine>> {
        match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&self, line: CapturedLine) -> bool {
        let mut lines = self.guard();
        lines.push_back(line);
        let mut dropped = false;
        if let Some(max_lines) = self.max_lines {
            while lines.len() > max_lines {
                lines.pop_front();
                dropped = true;
            }
        }
        dropped
    }

    /// Returns the number of lines currently in the buffer.
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    /// Copies the retained lines, in arrival order.
    pub fn snapshot(&self) -> Vec<CapturedLine> {
        self.guard().iter().cloned().collect()
    }
}

/// Sanitizes captured text, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
