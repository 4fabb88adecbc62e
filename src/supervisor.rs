//! Process supervision.
//!
//! A `Supervisor` owns one launch spec and the lifecycle of the OS process started from it:
//! asynchronous start, watchdog, kill-tree, end-of-execution listeners and status queries.
//! Clones share the same process.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

use tokio::process::ChildStdin;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::CaptureLayer;
use crate::error::{ExecError, Result};
use crate::host::HostShutdown;
use crate::killtree::{self, Termination, FORCE_SETTLE};
use crate::launch::{LaunchSpec, StdioPlan};
use crate::output::StreamKind;
use crate::process::{EndStatus, KillCause, Phase};
use crate::procinfo;
use crate::scheduler::{run_guarded, ScheduledTask, Scheduler, Task};
use crate::stdin::StdinInjector;

/// How long stream readers may keep draining once the process has exited.
///
/// Readers still blocked afterwards, typically on a pipe inherited by a grandchild, are
/// aborted.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Called once the process has exited.
pub trait EndListener: Send + Sync {
    fn on_end(&self, process: &Supervisor) -> anyhow::Result<()>;
}

impl<F> EndListener for F
where
    F: Fn(&Supervisor) -> anyhow::Result<()> + Send + Sync,
{
    fn on_end(&self, process: &Supervisor) -> anyhow::Result<()> {
        self(process)
    }
}

#[derive(Default)]
struct Lifecycle {
    pid: Option<u32>,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    exit_status: Option<ExitStatus>,
    spawn_error: Option<String>,
    raw_stdin: Option<ChildStdin>,
    watchdog: Option<ScheduledTask>,
}

struct Inner {
    spec: LaunchSpec,
    listeners: Vec<Arc<dyn EndListener>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    runtime: Option<Handle>,
    capture: Option<Arc<CaptureLayer>>,
    shutdown: Option<Arc<dyn HostShutdown>>,
    pipe_stdin: bool,
    phase: watch::Sender<Phase>,
    exited: watch::Sender<bool>,
    state: Mutex<Lifecycle>,
    kill_gate: tokio::sync::Mutex<()>,
    kill_cause: OnceLock<KillCause>,
    killed_by_caller: AtomicBool,
    killed_by_timeout: AtomicBool,
    stdin: OnceLock<Option<StdinInjector>>,
}

/// Handle on a supervised process.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

/// Non-owning handle, see [`Supervisor::downgrade`].
#[derive(Clone)]
pub(crate) struct WeakSupervisor(Weak<Inner>);

impl WeakSupervisor {
    pub(crate) fn upgrade(&self) -> Option<Supervisor> {
        self.0.upgrade().map(|inner| Supervisor { inner })
    }
}

impl Supervisor {
    /// Starts configuring a supervisor for `spec`.
    pub fn builder(spec: LaunchSpec) -> SupervisorBuilder {
        SupervisorBuilder {
            spec,
            listeners: Vec::new(),
            scheduler: None,
            runtime: None,
            capture: None,
            shutdown: None,
            pipe_stdin: true,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakSupervisor {
        WeakSupervisor(Arc::downgrade(&self.inner))
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.inner.spec
    }

    /// The attached capture layer, if any.
    pub fn capture(&self) -> Option<&CaptureLayer> {
        self.inner.capture.as_deref()
    }

    /// Launches the process asynchronously.
    ///
    /// Returns once the start step is scheduled; spawn failures are reported as
    /// [`EndStatus::CantStart`], never as an error here.
    pub fn start(&self) -> Result<()> {
        let runtime = match &self.inner.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| ExecError::NoRuntime)?,
        };
        let claimed = self.inner.phase.send_if_modified(|phase| {
            if *phase == Phase::Unstarted {
                *phase = Phase::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ExecError::AlreadyStarted {
                command: self.inner.spec.command_line(),
            });
        }
        if let Some(shutdown) = &self.inner.shutdown {
            shutdown.register(self);
        }
        debug!(command = %self.inner.spec.command_line(), "Scheduling process start");
        runtime.spawn(self.clone().run(runtime.clone()));
        Ok(())
    }

    // Start step, then the completion continuation for the lifetime of the process.
    async fn run(self, runtime: Handle) {
        let inner = &self.inner;
        let capture = inner.capture.as_ref();
        let plan = StdioPlan {
            stdin: inner.pipe_stdin,
            stdout: capture.is_some_and(|c| c.captures(StreamKind::Stdout)),
            stderr: capture.is_some_and(|c| c.captures(StreamKind::Stderr)),
        };

        let mut child = match inner.spec.to_command(plan).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(command = %inner.spec.command_line(), error = %err, "Process can't start");
                self.lock().spawn_error = Some(err.to_string());
                inner.exited.send_replace(true);
                inner.phase.send_replace(Phase::Finished);
                self.fire_end_listeners();
                return;
            }
        };
        let pid = child.id().unwrap_or(0);
        info!(pid = %pid, command = %inner.spec.command_line(), "Process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        {
            let mut state = self.lock();
            state.pid = Some(pid);
            state.started_at = Some(Instant::now());
            state.raw_stdin = child.stdin.take();
            if let Some(max_duration) = inner.spec.max_duration() {
                state.watchdog = Some(self.arm_watchdog(max_duration, runtime.clone()));
            }
        }
        inner.phase.send_replace(Phase::Running);

        let readers = match capture {
            Some(capture) => capture.attach(&self, stdout, stderr, &runtime),
            None => Vec::new(),
        };

        let status = child.wait().await;
        let watchdog = {
            let mut state = self.lock();
            state.ended_at = Some(Instant::now());
            state.raw_stdin = None;
            match &status {
                Ok(status) => state.exit_status = Some(*status),
                Err(err) => warn!(pid = %pid, error = %err, "Failed to wait for process"),
            }
            state.watchdog.take()
        };
        if let Some(watchdog) = watchdog {
            watchdog.cancel();
        }
        inner.exited.send_replace(true);
        info!(pid = %pid, code = ?self.exit_code(), "Process exited");

        drain_readers(pid, readers).await;
        inner.phase.send_replace(Phase::Finished);
        self.fire_end_listeners();
    }

    // Without a caller scheduler the timer lives on the runtime driving the process.
    fn arm_watchdog(&self, max_duration: Duration, runtime: Handle) -> ScheduledTask {
        let process = self.downgrade();
        let kill_runtime = runtime.clone();
        let fire = move || {
            let Some(process) = process.upgrade() else {
                return;
            };
            kill_runtime.spawn(async move {
                if !process.is_running() {
                    return;
                }
                process.inner.killed_by_timeout.store(true, Ordering::SeqCst);
                warn!(pid = ?process.pid(), max = ?max_duration, "Max execution time reached");
                if let Err(err) = process.kill_tree(KillCause::Timeout).await {
                    error!(pid = ?process.pid(), error = %err, "Watchdog failed to kill process tree");
                }
            });
        };
        match &self.inner.scheduler {
            Some(scheduler) => scheduler.schedule_delayed(Box::new(fire), max_duration),
            None => {
                let timer = runtime.spawn(async move {
                    tokio::time::sleep(max_duration).await;
                    fire();
                });
                ScheduledTask::new(move || timer.abort())
            }
        }
    }

    fn schedule(&self, task: Task) {
        match &self.inner.scheduler {
            Some(scheduler) => scheduler.schedule(task),
            None => task(),
        }
    }

    fn fire_end_listeners(&self) {
        for listener in &self.inner.listeners {
            let listener = listener.clone();
            let process = self.clone();
            self.schedule(Box::new(move || {
                run_guarded("end listener", || listener.on_end(&process));
            }));
        }
    }

    /// Kills the process and all its live descendants.
    ///
    /// Idempotent: killing a finished or already killed process is a no-op. Fails with
    /// [`ExecError::Unkillable`] when part of the tree survives forceful termination.
    pub async fn kill(&self) -> Result<()> {
        self.inner.killed_by_caller.store(true, Ordering::SeqCst);
        self.kill_tree(KillCause::Caller).await
    }

    async fn kill_tree(&self, cause: KillCause) -> Result<()> {
        let _gate = self.inner.kill_gate.lock().await;
        if self.phase() == Phase::Unstarted {
            debug!("Kill requested before start, nothing to do");
            return Ok(());
        }
        self.wait_started().await;
        if *self.inner.exited.borrow() {
            return Ok(());
        }
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        let _ = self.inner.kill_cause.set(cause);
        let grace = self.inner.spec.kill_grace();
        debug!(pid = %pid, ?cause, "Killing process tree");

        let descendants = procinfo::descendants(pid);
        let mut survivors = killtree::terminate_all(&descendants, grace).await;

        if let Err(err) = killtree::terminate(pid, Termination::Graceful) {
            debug!(pid = %pid, error = %err, "Graceful termination refused");
        }
        if !self.wait_exited(grace).await {
            killtree::terminate(pid, Termination::Forceful)?;
            if !self.wait_exited(FORCE_SETTLE).await {
                survivors.push(pid);
            }
        }

        if survivors.is_empty() {
            debug!(pid = %pid, "Process tree killed");
            Ok(())
        } else {
            Err(ExecError::Unkillable {
                root: pid,
                survivors,
            })
        }
    }

    async fn wait_exited(&self, within: Duration) -> bool {
        wait_until(self.inner.exited.subscribe(), Some(within), |exited| *exited).await
    }

    /// Waits until the start step has completed, successfully or not.
    ///
    /// Returns whether the OS process was spawned. Waits indefinitely on an unstarted
    /// supervisor until someone starts it.
    pub async fn wait_started(&self) -> bool {
        wait_until(self.inner.phase.subscribe(), None, |phase| phase.is_started()).await;
        self.lock().pid.is_some()
    }

    /// Waits for the OS process to exit, at most `timeout` when given.
    ///
    /// Returns whether the process has ended. Neither kills nor judges the execution.
    /// Captured output may still be draining, see [`Supervisor::wait_finished`].
    pub async fn wait_for_end(&self, timeout: Option<Duration>) -> bool {
        wait_until(self.inner.exited.subscribe(), timeout, |exited| *exited).await
    }

    /// Waits for the process to end and its output streams to be drained, at most
    /// `timeout` when given.
    ///
    /// Once it returns `true` the retained lines are final and the end listeners have been
    /// dispatched.
    pub async fn wait_finished(&self, timeout: Option<Duration>) -> bool {
        let finished = |phase: &Phase| *phase == Phase::Finished;
        wait_until(self.inner.phase.subscribe(), timeout, finished).await
    }

    /// The process's standard input, once it is started.
    ///
    /// The injector is created once and shared by every caller. `None` when stdin is not
    /// piped, the process could not start or has already ended.
    pub async fn stdin(&self) -> Option<StdinInjector> {
        self.wait_started().await;
        self.inner
            .stdin
            .get_or_init(|| self.lock().raw_stdin.take().map(StdinInjector::new))
            .clone()
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    /// Whether the process is starting or alive.
    pub fn is_running(&self) -> bool {
        matches!(self.phase(), Phase::Starting | Phase::Running) && !*self.inner.exited.borrow()
    }

    pub fn end_status(&self) -> EndStatus {
        if !*self.inner.exited.borrow() {
            return EndStatus::NotYetDone;
        }
        let state = self.lock();
        if state.spawn_error.is_some() {
            return EndStatus::CantStart;
        }
        match self.inner.kill_cause.get() {
            Some(KillCause::Timeout) => return EndStatus::TooLongExecutionTime,
            Some(KillCause::Caller) => return EndStatus::Killed,
            None => {}
        }
        let code = state.exit_status.and_then(|status| status.code());
        if self.inner.spec.exit_code_must_be_zero() && code != Some(0) {
            EndStatus::DoneWithError
        } else {
            EndStatus::CorrectlyDone
        }
    }

    /// Whether the process has ended correctly, see [`EndStatus::CorrectlyDone`].
    pub fn is_correctly_done(&self) -> bool {
        self.end_status() == EndStatus::CorrectlyDone
    }

    /// Exit code, `None` while running or when ended by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_status.and_then(|status| status.code())
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.lock().exit_status
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    /// Reason the OS refused to spawn the process.
    pub fn spawn_error(&self) -> Option<String> {
        self.lock().spawn_error.clone()
    }

    /// Time since spawn, or total run time once ended.
    pub fn uptime(&self) -> Option<Duration> {
        let state = self.lock();
        let started_at = state.started_at?;
        Some(
            state
                .ended_at
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(started_at),
        )
    }

    /// CPU time consumed so far; only known while the process is alive.
    pub fn cpu_duration(&self) -> Option<Duration> {
        self.live_pid().and_then(procinfo::cpu_time)
    }

    /// User owning the process; only known while the process is alive.
    pub fn owner_user(&self) -> Option<String> {
        self.live_pid().and_then(procinfo::owner_user)
    }

    /// Live descendants of the process.
    pub fn descendants(&self) -> Vec<u32> {
        self.live_pid().map(procinfo::descendants).unwrap_or_default()
    }

    fn live_pid(&self) -> Option<u32> {
        if *self.inner.exited.borrow() {
            return None;
        }
        self.pid()
    }

    pub fn killed_by_caller(&self) -> bool {
        self.inner.killed_by_caller.load(Ordering::SeqCst)
    }

    pub fn killed_by_timeout(&self) -> bool {
        self.inner.killed_by_timeout.load(Ordering::SeqCst)
    }

    /// Fails unless the process ended correctly.
    ///
    /// The error carries the command line and, when captured, the standard error lines.
    pub fn check_execution(&self) -> Result<()> {
        let status = self.end_status();
        if status == EndStatus::CorrectlyDone {
            return Ok(());
        }
        let stderr = self
            .capture()
            .map(|capture| capture.stderr_lines(false))
            .unwrap_or_default();
        Err(ExecError::InvalidExecution {
            command: self.inner.spec.command_line(),
            status,
            exit_code: self.exit_code(),
            stderr,
        })
    }
}

async fn wait_until<T>(
    mut rx: watch::Receiver<T>,
    timeout: Option<Duration>,
    mut done: impl FnMut(&T) -> bool,
) -> bool {
    let reached = match timeout {
        Some(timeout) => matches!(
            tokio::time::timeout(timeout, rx.wait_for(&mut done)).await,
            Ok(Ok(_))
        ),
        None => rx.wait_for(&mut done).await.is_ok(),
    };
    reached
}

async fn drain_readers(pid: u32, readers: Vec<JoinHandle<()>>) {
    let deadline = tokio::time::Instant::now() + READER_DRAIN_TIMEOUT;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            warn!(pid = %pid, "Output stream still open after exit, reader aborted");
            reader.abort();
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("command", &self.inner.spec.command_line())
            .field("phase", &self.phase())
            .field("pid", &self.pid())
            .finish()
    }
}

/// Builder for [`Supervisor`].
pub struct SupervisorBuilder {
    spec: LaunchSpec,
    listeners: Vec<Arc<dyn EndListener>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    runtime: Option<Handle>,
    capture: Option<CaptureLayer>,
    shutdown: Option<Arc<dyn HostShutdown>>,
    pipe_stdin: bool,
}

impl SupervisorBuilder {
    /// Adds an end-of-execution listener.
    pub fn listener(mut self, listener: impl EndListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Scheduler for end listeners and the watchdog.
    ///
    /// By default listeners run inline and the watchdog is a timer on the process runtime.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Runtime driving the process. Defaults to the runtime current at `start`.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Attaches a capture layer to the output streams.
    pub fn capture(mut self, capture: CaptureLayer) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Ties the process to the host's shutdown.
    pub fn shutdown(mut self, shutdown: Arc<dyn HostShutdown>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Whether standard input is piped. Enabled by default; when disabled the process
    /// reads from the null device.
    pub fn pipe_stdin(mut self, pipe: bool) -> Self {
        self.pipe_stdin = pipe;
        self
    }

    pub fn build(self) -> Supervisor {
        let (phase, _) = watch::channel(Phase::Unstarted);
        let (exited, _) = watch::channel(false);
        Supervisor {
            inner: Arc::new(Inner {
                spec: self.spec,
                listeners: self.listeners,
                scheduler: self.scheduler,
                runtime: self.runtime,
                capture: self.capture.map(Arc::new),
                shutdown: self.shutdown,
                pipe_stdin: self.pipe_stdin,
                phase,
                exited,
                state: Mutex::new(Lifecycle::default()),
                kill_gate: tokio::sync::Mutex::new(()),
                kill_cause: OnceLock::new(),
                killed_by_caller: AtomicBool::new(false),
                killed_by_timeout: AtomicBool::new(false),
                stdin: OnceLock::new(),
            }),
        }
    }

    /// Builds the supervisor and starts it.
    pub fn start(self) -> Result<Supervisor> {
        let supervisor = self.build();
        supervisor.start()?;
        Ok(supervisor)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::scheduler::ThreadScheduler;
    use std::sync::atomic::AtomicUsize;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::builder("/bin/sh").args(["-c", script]).build()
    }

    #[tokio::test]
    async fn zero_exit_is_correctly_done() {
        let process = Supervisor::builder(sh("exit 0")).start().unwrap();
        assert!(process.wait_for_end(None).await);
        assert_eq!(process.end_status(), EndStatus::CorrectlyDone);
        assert!(process.is_correctly_done());
        assert_eq!(process.exit_code(), Some(0));
        assert!(process.check_execution().is_ok());
        assert!(process.uptime().is_some());
    }

    #[tokio::test]
    async fn non_zero_exit_is_done_with_error_only_when_required() {
        let strict = Supervisor::builder(sh("exit 1")).start().unwrap();
        strict.wait_for_end(None).await;
        assert_eq!(strict.end_status(), EndStatus::DoneWithError);
        assert!(matches!(
            strict.check_execution(),
            Err(ExecError::InvalidExecution { exit_code: Some(1), .. })
        ));

        let lenient = LaunchSpec::builder("/bin/sh")
            .args(["-c", "exit 1"])
            .exit_code_must_be_zero(false)
            .build();
        let lenient = Supervisor::builder(lenient).start().unwrap();
        lenient.wait_for_end(None).await;
        assert_eq!(lenient.end_status(), EndStatus::CorrectlyDone);
    }

    #[tokio::test]
    async fn spawn_failure_is_cant_start() {
        let spec = LaunchSpec::builder("/nonexistent/procrack-test-binary").build();
        let process = Supervisor::builder(spec).start().unwrap();
        assert!(!process.wait_started().await);
        assert!(process.wait_for_end(Some(Duration::from_secs(5))).await);
        assert_eq!(process.end_status(), EndStatus::CantStart);
        assert!(process.spawn_error().is_some());
        assert!(process.stdin().await.is_none());
        assert!(process.kill().await.is_ok());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let process = Supervisor::builder(sh("exit 0")).start().unwrap();
        assert!(matches!(process.start(), Err(ExecError::AlreadyStarted { .. })));
        process.wait_for_end(None).await;
    }

    #[tokio::test]
    async fn status_is_pending_while_running() {
        let process = Supervisor::builder(sh("sleep 30")).start().unwrap();
        assert!(process.is_running());
        assert!(process.wait_started().await);
        assert_eq!(process.end_status(), EndStatus::NotYetDone);
        assert!(!process.is_correctly_done());
        assert!(process.pid().is_some());
        assert!(process.owner_user().is_some());
        assert!(!process.wait_for_end(Some(Duration::from_millis(50))).await);
        process.kill().await.unwrap();
        process.wait_for_end(None).await;
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn watchdog_kills_long_runs() {
        let spec = LaunchSpec::builder("/bin/sh")
            .args(["-c", "sleep 30"])
            .max_duration(Duration::from_millis(300))
            .build();
        let started = Instant::now();
        let process = Supervisor::builder(spec).start().unwrap();
        assert!(process.wait_for_end(Some(Duration::from_secs(10))).await);
        assert_eq!(process.end_status(), EndStatus::TooLongExecutionTime);
        assert!(process.killed_by_timeout());
        assert!(!process.killed_by_caller());
        assert!(started.elapsed() < Duration::from_millis(300) + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn watchdog_is_cancelled_by_natural_exit() {
        let spec = LaunchSpec::builder("/bin/sh")
            .args(["-c", "exit 0"])
            .max_duration(Duration::from_millis(200))
            .build();
        let process = Supervisor::builder(spec).start().unwrap();
        process.wait_for_end(None).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(process.end_status(), EndStatus::CorrectlyDone);
        assert!(!process.killed_by_timeout());
    }

    #[tokio::test]
    async fn kill_takes_down_descendants() {
        let process = Supervisor::builder(sh("sleep 30 & sleep 30 & wait"))
            .start()
            .unwrap();
        process.wait_started().await;
        let mut descendants = Vec::new();
        for _ in 0..50 {
            descendants = process.descendants();
            if descendants.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(descendants.len() >= 2);

        process.kill().await.unwrap();
        assert!(process.wait_for_end(Some(Duration::from_secs(5))).await);
        assert_eq!(process.end_status(), EndStatus::Killed);
        assert!(descendants.iter().all(|pid| !procinfo::is_alive(*pid)));
        assert!(process.descendants().is_empty());
    }

    #[tokio::test]
    async fn concurrent_kills_are_idempotent() {
        let process = Supervisor::builder(sh("sleep 30")).start().unwrap();
        process.wait_started().await;
        let (a, b) = tokio::join!(process.kill(), process.kill());
        a.unwrap();
        b.unwrap();
        process.wait_for_end(None).await;
        assert_eq!(process.end_status(), EndStatus::Killed);
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn kill_after_natural_exit_keeps_status() {
        let process = Supervisor::builder(sh("exit 0")).start().unwrap();
        process.wait_for_end(None).await;
        process.kill().await.unwrap();
        assert!(process.killed_by_caller());
        assert_eq!(process.end_status(), EndStatus::CorrectlyDone);
    }

    #[tokio::test]
    async fn end_listeners_fire_once_after_exit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let process = Supervisor::builder(sh("exit 3"))
            .listener(|_: &Supervisor| -> anyhow::Result<()> { anyhow::bail!("listener failure") })
            .listener(move |process: &Supervisor| -> anyhow::Result<()> {
                assert_eq!(process.phase(), Phase::Finished);
                assert_eq!(process.exit_code(), Some(3));
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .start()
            .unwrap();
        process.wait_finished(None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn end_listeners_fire_on_cant_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let spec = LaunchSpec::builder("/nonexistent/procrack-test-binary").build();
        let process = Supervisor::builder(spec)
            .listener(move |process: &Supervisor| -> anyhow::Result<()> {
                assert_eq!(process.end_status(), EndStatus::CantStart);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .start()
            .unwrap();
        assert!(process.wait_finished(Some(Duration::from_secs(5))).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(process.end_status(), EndStatus::CantStart);
    }

    #[tokio::test]
    async fn end_is_prompt_when_a_grandchild_holds_the_pipes() {
        let process = Supervisor::builder(sh("(sleep 3 &); echo done"))
            .capture(CaptureLayer::new())
            .start()
            .unwrap();
        let started = Instant::now();
        assert!(process.wait_for_end(Some(Duration::from_secs(5))).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(process.end_status(), EndStatus::CorrectlyDone);

        assert!(process.wait_finished(Some(Duration::from_secs(5))).await);
        assert_eq!(process.capture().unwrap().stdout_lines(true), vec!["done"]);
    }

    const IGNORES_SIGTERM: &str = "trap '' TERM; while :; do sleep 1; done & wait";

    async fn wait_for_descendant(process: &Supervisor) -> Vec<u32> {
        let mut descendants = Vec::new();
        for _ in 0..50 {
            descendants = process.descendants();
            if !descendants.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        descendants
    }

    #[tokio::test]
    async fn kill_escalates_past_ignored_sigterm() {
        let grace = Duration::from_millis(200);
        let spec = LaunchSpec::builder("/bin/sh")
            .args(["-c", IGNORES_SIGTERM])
            .kill_grace(grace)
            .build();
        let process = Supervisor::builder(spec).start().unwrap();
        process.wait_started().await;
        let descendants = wait_for_descendant(&process).await;
        assert!(!descendants.is_empty());

        let started = Instant::now();
        process.kill().await.unwrap();
        assert!(started.elapsed() >= grace);
        assert!(process.wait_for_end(Some(Duration::from_secs(5))).await);
        assert_eq!(process.end_status(), EndStatus::Killed);
        assert!(descendants.iter().all(|pid| !procinfo::is_alive(*pid)));
    }

    #[tokio::test]
    async fn watchdog_escalates_past_ignored_sigterm() {
        let spec = LaunchSpec::builder("/bin/sh")
            .args(["-c", IGNORES_SIGTERM])
            .max_duration(Duration::from_millis(300))
            .kill_grace(Duration::from_millis(200))
            .build();
        let started = Instant::now();
        let process = Supervisor::builder(spec).start().unwrap();
        assert!(process.wait_for_end(Some(Duration::from_secs(10))).await);
        assert_eq!(process.end_status(), EndStatus::TooLongExecutionTime);
        assert!(process.killed_by_timeout());
        assert!(started.elapsed() < Duration::from_millis(300) + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn watchdog_runs_on_a_caller_scheduler() {
        let spec = LaunchSpec::builder("/bin/sh")
            .args(["-c", "sleep 30"])
            .max_duration(Duration::from_millis(200))
            .build();
        let process = Supervisor::builder(spec)
            .scheduler(Arc::new(ThreadScheduler::named("procrack-test")))
            .start()
            .unwrap();
        assert!(process.wait_for_end(Some(Duration::from_secs(10))).await);
        assert_eq!(process.end_status(), EndStatus::TooLongExecutionTime);
    }

    #[tokio::test]
    async fn stdin_is_shared_and_waits_for_start() {
        let process = Supervisor::builder(sh("read line; test \"$line\" = hello"))
            .start()
            .unwrap();
        let stdin = process.stdin().await.unwrap();
        let again = process.stdin().await.unwrap();
        stdin.write_line("hello").await.unwrap();
        again.close().await.unwrap();
        process.wait_for_end(None).await;
        assert_eq!(process.end_status(), EndStatus::CorrectlyDone);
    }

    #[tokio::test]
    async fn working_dir_and_env_reach_the_process() {
        let tmp = tempfile::TempDir::new().unwrap();
        let spec = LaunchSpec::builder("/bin/sh")
            .args(["-c", "test \"$(pwd -P)\" = \"$EXPECTED\""])
            .env("EXPECTED", tmp.path().canonicalize().unwrap().display().to_string())
            .working_dir(tmp.path())
            .unwrap()
            .build();
        let process = Supervisor::builder(spec).start().unwrap();
        process.wait_for_end(None).await;
        assert_eq!(process.end_status(), EndStatus::CorrectlyDone);
    }

    #[test]
    fn start_without_runtime_fails() {
        let process = Supervisor::builder(sh("exit 0")).build();
        assert!(matches!(process.start(), Err(ExecError::NoRuntime)));
        assert_eq!(process.phase(), Phase::Unstarted);
    }
}
