//! Interactive feedback from captured output into standard input.
//!
//! An [`InteractiveHandler`] sees every captured line and may answer with a [`Reply`]; the
//! capture layer writes replies to the process, in order, while it is still running.

use regex::Regex;

use crate::error::{ExecError, Result};
use crate::output::{CapturedLine, StreamKind};

/// What to send back to the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Write a line to standard input.
    Line(String),
    /// Close standard input so the process reads end of input.
    Close,
    /// Write a line, then close standard input.
    LineThenClose(String),
}

/// Reacts to captured lines.
pub trait InteractiveHandler: Send + Sync {
    /// Returns the reply for `line`, `None` to stay silent.
    fn on_line(&self, line: &CapturedLine) -> anyhow::Result<Option<Reply>>;
}

impl<F> InteractiveHandler for F
where
    F: Fn(&CapturedLine) -> anyhow::Result<Option<Reply>> + Send + Sync,
{
    fn on_line(&self, line: &CapturedLine) -> anyhow::Result<Option<Reply>> {
        self(line)
    }
}

#[derive(Debug, Clone)]
enum Action {
    Line(String),
    Close,
    LineThenClose(String),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: Regex,
    action: Action,
}

/// Regex-driven handler: the first rule matching a line decides the reply.
///
/// Reply templates may reference capture groups (`$1`, `${name}`).
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponder {
    rules: Vec<Rule>,
    stream: Option<StreamKind>,
}

impl ScriptedResponder {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(mut self, pattern: &str, action: Action) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|err| ExecError::Config(format!("invalid reply pattern {}: {}", pattern, err)))?;
        self.rules.push(Rule { pattern, action });
        Ok(self)
    }

    /// Answers lines matching `pattern` with `template`.
    pub fn reply_to(self, pattern: &str, template: impl Into<String>) -> Result<Self> {
        self.rule(pattern, Action::Line(template.into()))
    }

    /// Closes standard input on lines matching `pattern`.
    pub fn close_on(self, pattern: &str) -> Result<Self> {
        self.rule(pattern, Action::Close)
    }

    /// Answers lines matching `pattern`, then closes standard input.
    pub fn reply_then_close(self, pattern: &str, template: impl Into<String>) -> Result<Self> {
        self.rule(pattern, Action::LineThenClose(template.into()))
    }

    /// Only reacts to lines of `stream`.
    pub fn only(mut self, stream: StreamKind) -> Self {
        self.stream = Some(stream);
        self
    }

    fn expand(pattern: &Regex, text: &str, template: &str) -> String {
        let mut out = String::new();
        if let Some(captures) = pattern.captures(text) {
            captures.expand(template, &mut out);
        }
        out
    }
}

impl InteractiveHandler for ScriptedResponder {
    fn on_line(&self, line: &CapturedLine) -> anyhow::Result<Option<Reply>> {
        if self.stream.is_some_and(|stream| stream != line.stream) {
            return Ok(None);
        }
        let Some(rule) = self.rules.iter().find(|rule| rule.pattern.is_match(&line.text)) else {
            return Ok(None);
        };
        let reply = match &rule.action {
            Action::Line(template) => Reply::Line(Self::expand(&rule.pattern, &line.text, template)),
            Action::Close => Reply::Close,
            Action::LineThenClose(template) => {
                Reply::LineThenClose(Self::expand(&rule.pattern, &line.text, template))
            }
        };
        Ok(Some(reply))
    }
}
