//! Task scheduling for caller callbacks and watchdogs.
//!
//! Every callback the engine runs on behalf of a caller (end listeners, line observers,
//! interactive handlers, the watchdog) goes through a [`Scheduler`], so the caller decides
//! whether it runs inline, on a dedicated thread or on a tokio blocking pool.

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::runtime::Handle;

/// A unit of work handed to a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks now, soon or after a delay.
pub trait Scheduler: Send + Sync {
    /// Runs `task` now or soon.
    fn schedule(&self, task: Task);

    /// Runs `task` once `delay` has elapsed, unless the returned guard cancels it first.
    fn schedule_delayed(&self, task: Task, delay: Duration) -> ScheduledTask;
}

/// Guard over a delayed task.
///
/// Dropping the guard, or calling [`ScheduledTask::cancel`], cancels the task if it has
/// not fired yet. [`ScheduledTask::detach`] releases the guard and lets the task run.
pub struct ScheduledTask {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ScheduledTask {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Runs a caller callback, logging its error or panic instead of propagating it.
pub(crate) fn run_guarded<T>(
    callback: &'static str,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Option<T> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            tracing::warn!(callback, error = %format!("{:#}", err), "Callback failed");
            None
        }
        Err(_) => {
            tracing::warn!(callback, "Callback panicked");
            None
        }
    }
}

// Waits on a channel so that cancelling wakes the timer thread right away.
fn delay_on_thread(task: Task, delay: Duration) -> ScheduledTask {
    let (cancel_tx, cancel_rx) = std_mpsc::channel::<()>();
    let spawned = std::thread::Builder::new()
        .name("procrack-timer".into())
        .spawn(move || {
            if let Err(std_mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(delay) {
                task();
            }
        });
    if let Err(err) = spawned {
        tracing::error!(error = %err, "Failed to spawn timer thread, delayed task dropped");
    }
    ScheduledTask::new(move || drop(cancel_tx))
}

/// Runs tasks on the calling thread.
///
/// Delayed tasks still need a timer, they fire on a short-lived timer thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, task: Task) {
        task();
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> ScheduledTask {
        delay_on_thread(task, delay)
    }
}

/// Runs every task on its own named OS thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadScheduler {
    name: Option<String>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, task: Task) {
        let name = self.name.clone().unwrap_or_else(|| "procrack-task".into());
        if let Err(err) = std::thread::Builder::new().name(name).spawn(task) {
            tracing::error!(error = %err, "Failed to spawn task thread, task dropped");
        }
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> ScheduledTask {
        delay_on_thread(task, delay)
    }
}

/// Runs tasks on the blocking pool of a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the current context.
    ///
    /// Returns `None` outside of a tokio runtime.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Task) {
        self.handle.spawn_blocking(task);
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> ScheduledTask {
        let handle = self.handle.clone();
        let timer = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            handle.spawn_blocking(task);
        });
        ScheduledTask::new(move || timer.abort())
    }
}
