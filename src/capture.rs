//! Line capture over a supervised process's output streams.
//!
//! A [`CaptureLayer`] attached to a supervisor runs one reader per captured stream. Each line
//! is retained (when asked to), handed to every [`LineObserver`], and passed to the
//! interactive handler, whose replies are written back to standard input in order.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::interactive::{InteractiveHandler, Reply};
use crate::output::{sanitize_text, CapturedLine, LineBuffer, StreamKind};
use crate::scheduler::{run_guarded, InlineScheduler, Scheduler};
use crate::supervisor::Supervisor;

/// What to do with one output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    /// The stream is not piped, its output is discarded.
    Off,
    /// Lines are handed to observers and the interactive handler only.
    Observe,
    /// Lines are also retained for later retrieval.
    #[default]
    Keep,
}

/// Receives every captured line.
pub trait LineObserver: Send + Sync {
    fn on_line(&self, line: &CapturedLine) -> anyhow::Result<()>;
}

impl<F> LineObserver for F
where
    F: Fn(&CapturedLine) -> anyhow::Result<()> + Send + Sync,
{
    fn on_line(&self, line: &CapturedLine) -> anyhow::Result<()> {
        self(line)
    }
}

struct Interactive {
    handler: Arc<dyn InteractiveHandler>,
    scheduler: Arc<dyn Scheduler>,
}

/// Capture configuration and the lines retained so far.
pub struct CaptureLayer {
    stdout: CaptureMode,
    stderr: CaptureMode,
    strip_ansi: bool,
    buffer: LineBuffer,
    observers: Vec<Arc<dyn LineObserver>>,
    observer_scheduler: Arc<dyn Scheduler>,
    interactive: Option<Interactive>,
}

impl Default for CaptureLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureLayer {
    /// Keeps both streams, unbounded, with inline callbacks.
    pub fn new() -> Self {
        Self {
            stdout: CaptureMode::Keep,
            stderr: CaptureMode::Keep,
            strip_ansi: false,
            buffer: LineBuffer::new(),
            observers: Vec::new(),
            observer_scheduler: Arc::new(InlineScheduler),
            interactive: None,
        }
    }

    pub fn stdout(mut self, mode: CaptureMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn stderr(mut self, mode: CaptureMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Retains at most `max_lines` lines across both streams, dropping the oldest first.
    pub fn keep_lines(mut self, max_lines: usize) -> Self {
        self.buffer = LineBuffer::bounded(max_lines);
        self
    }

    /// Removes ANSI escape sequences from captured text.
    pub fn strip_ansi(mut self, strip: bool) -> Self {
        self.strip_ansi = strip;
        self
    }

    pub fn observer(mut self, observer: impl LineObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Scheduler for observer calls. Inline by default.
    pub fn observer_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.observer_scheduler = scheduler;
        self
    }

    /// Feeds every line to `handler`, inline.
    pub fn interactive(self, handler: impl InteractiveHandler + 'static) -> Self {
        self.interactive_on(handler, Arc::new(InlineScheduler))
    }

    /// Feeds every line to `handler` through `scheduler`.
    ///
    /// Replies keep their order only if the scheduler runs the handler calls in order.
    pub fn interactive_on(
        mut self,
        handler: impl InteractiveHandler + 'static,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        self.interactive = Some(Interactive {
            handler: Arc::new(handler),
            scheduler,
        });
        self
    }

    fn mode(&self, stream: StreamKind) -> CaptureMode {
        match stream {
            StreamKind::Stdout => self.stdout,
            StreamKind::Stderr => self.stderr,
        }
    }

    /// Whether `stream` must be piped.
    pub(crate) fn captures(&self, stream: StreamKind) -> bool {
        self.mode(stream) != CaptureMode::Off
    }

    /// Starts the readers for a freshly started process and returns their handles.
    pub(crate) fn attach(
        self: &Arc<Self>,
        process: &Supervisor,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        runtime: &Handle,
    ) -> Vec<JoinHandle<()>> {
        let replies = self.interactive.as_ref().map(|_| {
            let (tx, rx) = mpsc::unbounded_channel();
            runtime.spawn(pump_replies(process.clone(), rx));
            tx
        });

        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(runtime.spawn(self.clone().read_lines(
                StreamKind::Stdout,
                stdout,
                replies.clone(),
            )));
        }
        if let Some(stderr) = stderr {
            readers.push(runtime.spawn(self.clone().read_lines(
                StreamKind::Stderr,
                stderr,
                replies,
            )));
        }
        readers
    }

    async fn read_lines<R>(
        self: Arc<Self>,
        stream: StreamKind,
        reader: R,
        replies: Option<mpsc::UnboundedSender<Reply>>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let text = sanitize_text(&String::from_utf8_lossy(&buf), self.strip_ansi);
                    self.dispatch(CapturedLine::new(text, stream), replies.as_ref());
                }
                Err(err) if is_end_of_stream(&err) => break,
                Err(err) => {
                    warn!(%stream, error = %err, "Failed to read process output");
                    break;
                }
            }
        }
        debug!(%stream, "Output stream closed");
    }

    fn dispatch(&self, line: CapturedLine, replies: Option<&mpsc::UnboundedSender<Reply>>) {
        if self.mode(line.stream) == CaptureMode::Keep {
            self.buffer.push(line.clone());
        }
        for observer in &self.observers {
            let observer = observer.clone();
            let line = line.clone();
            self.observer_scheduler.schedule(Box::new(move || {
                run_guarded("line observer", || observer.on_line(&line));
            }));
        }
        if let (Some(interactive), Some(replies)) = (&self.interactive, replies) {
            let handler = interactive.handler.clone();
            let replies = replies.clone();
            interactive.scheduler.schedule(Box::new(move || {
                let reply = run_guarded("interactive handler", || handler.on_line(&line));
                if let Some(Some(reply)) = reply {
                    let _ = replies.send(reply);
                }
            }));
        }
    }

    /// Every retained line, in arrival order.
    pub fn lines(&self) -> Vec<CapturedLine> {
        self.buffer.snapshot()
    }

    /// Retained lines of both streams, optionally without blank ones.
    pub fn merged_lines(&self, keep_empty: bool) -> Vec<CapturedLine> {
        self.buffer
            .snapshot()
            .into_iter()
            .filter(|line| keep_empty || !line.is_blank())
            .collect()
    }

    fn stream_lines(&self, stream: StreamKind, keep_empty: bool) -> Vec<String> {
        self.merged_lines(keep_empty)
            .into_iter()
            .filter(|line| line.stream == stream)
            .map(|line| line.text)
            .collect()
    }

    pub fn stdout_lines(&self, keep_empty: bool) -> Vec<String> {
        self.stream_lines(StreamKind::Stdout, keep_empty)
    }

    pub fn stderr_lines(&self, keep_empty: bool) -> Vec<String> {
        self.stream_lines(StreamKind::Stderr, keep_empty)
    }

    pub fn stdout_text(&self, keep_empty: bool, separator: &str) -> String {
        self.stdout_lines(keep_empty).join(separator)
    }

    pub fn stderr_text(&self, keep_empty: bool, separator: &str) -> String {
        self.stderr_lines(keep_empty).join(separator)
    }

    pub fn merged_text(&self, keep_empty: bool, separator: &str) -> String {
        self.merged_lines(keep_empty)
            .into_iter()
            .map(|line| line.text)
            .collect::<Vec<_>>()
            .join(separator)
    }
}

impl std::fmt::Debug for CaptureLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureLayer")
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("strip_ansi", &self.strip_ansi)
            .field("retained", &self.buffer.len())
            .field("observers", &self.observers.len())
            .field("interactive", &self.interactive.is_some())
            .finish()
    }
}

fn is_end_of_stream(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    ) {
        return true;
    }
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EBADF) {
        return true;
    }
    false
}

// Writes interactive replies one after the other, only while the process runs.
async fn pump_replies(process: Supervisor, mut replies: mpsc::UnboundedReceiver<Reply>) {
    while let Some(reply) = replies.recv().await {
        if !process.is_running() {
            debug!(?reply, "Process no longer running, reply dropped");
            continue;
        }
        let Some(stdin) = process.stdin().await else {
            debug!(?reply, "Standard input not available, reply dropped");
            continue;
        };
        let written = match reply {
            Reply::Line(line) => stdin.write_line(&line).await,
            Reply::Close => stdin.close().await,
            Reply::LineThenClose(line) => match stdin.write_line(&line).await {
                Ok(()) => stdin.close().await,
                Err(err) => Err(err),
            },
        };
        if let Err(err) = written {
            warn!(pid = ?process.pid(), error = %err, "Failed to write interactive reply");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::error::ExecError;
    use crate::interactive::ScriptedResponder;
    use crate::launch::LaunchSpec;
    use crate::process::EndStatus;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::builder("/bin/sh").args(["-c", script]).build()
    }

    async fn run(script: &str, capture: CaptureLayer) -> Supervisor {
        let process = Supervisor::builder(sh(script))
            .capture(capture)
            .start()
            .unwrap();
        assert!(process.wait_finished(Some(Duration::from_secs(10))).await);
        process
    }

    #[tokio::test]
    async fn one_line_per_stream_is_tagged() {
        let process = run("echo out; echo err >&2", CaptureLayer::new()).await;
        let capture = process.capture().unwrap();
        assert_eq!(capture.stdout_lines(true), vec!["out"]);
        assert_eq!(capture.stderr_lines(true), vec!["err"]);
        assert_eq!(capture.stdout_lines(false), vec!["out"]);
        let lines = capture.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines.iter().filter(|l| l.is_stdout()).count(), 1);
        assert_eq!(lines.iter().filter(|l| l.is_stderr()).count(), 1);
    }

    #[tokio::test]
    async fn blank_lines_are_filtered_on_request() {
        let process = run("printf 'a\\n\\n  \\nb\\r\\nlast'", CaptureLayer::new()).await;
        let capture = process.capture().unwrap();
        assert_eq!(capture.stdout_lines(true), vec!["a", "", "  ", "b", "last"]);
        assert_eq!(capture.stdout_lines(false), vec!["a", "b", "last"]);
        assert_eq!(capture.stdout_text(false, "|"), "a|b|last");
        assert_eq!(capture.merged_text(false, ","), "a,b,last");
        assert!(capture.stderr_text(true, "\n").is_empty());
    }

    #[tokio::test]
    async fn retention_can_be_bounded_and_stripped() {
        let capture = CaptureLayer::new().keep_lines(3).strip_ansi(true);
        let process = run(
            "for i in 1 2 3 4; do echo $i; done; printf '\\033[31mred\\033[0m\\n'",
            capture,
        )
        .await;
        let capture = process.capture().unwrap();
        assert_eq!(capture.stdout_lines(true), vec!["3", "4", "red"]);
    }

    #[tokio::test]
    async fn observers_see_lines_that_are_not_kept() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let capture = CaptureLayer::new()
            .stdout(CaptureMode::Observe)
            .stderr(CaptureMode::Off)
            .observer(|_: &CapturedLine| -> anyhow::Result<()> { anyhow::bail!("ignored") })
            .observer(move |line: &CapturedLine| -> anyhow::Result<()> {
                sink.lock().unwrap().push(line.clone());
                Ok(())
            });
        let process = run("echo one; echo two; echo hidden >&2", capture).await;
        assert!(process.capture().unwrap().lines().is_empty());
        let seen = seen.lock().unwrap();
        let texts: Vec<&str> = seen.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn interactive_replies_drive_process_to_completion() {
        let responder = ScriptedResponder::new()
            .reply_to("^ready$", "ping")
            .unwrap()
            .close_on("^got:ping$")
            .unwrap();
        let capture = CaptureLayer::new().interactive(responder);
        let process = run(
            "echo ready; while read l; do echo \"got:$l\"; done; echo bye",
            capture,
        )
        .await;
        assert_eq!(process.end_status(), EndStatus::CorrectlyDone);
        assert!(!process.killed_by_caller());
        assert_eq!(
            process.capture().unwrap().stdout_lines(true),
            vec!["ready", "got:ping", "bye"]
        );
    }

    #[tokio::test]
    async fn failed_execution_reports_captured_stderr() {
        let process = run("echo boom >&2; exit 2", CaptureLayer::new()).await;
        match process.check_execution() {
            Err(ExecError::InvalidExecution {
                status,
                exit_code,
                stderr,
                ..
            }) => {
                assert_eq!(status, EndStatus::DoneWithError);
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr, vec!["boom"]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
