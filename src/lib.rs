//! Procrack: an embeddable engine for running external executables.
//!
//! It tokenizes command lines, resolves executables, starts and supervises the OS process,
//! captures its output line by line, feeds its standard input and tears down the whole
//! process tree on timeout, on request or on host shutdown.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use procrack::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! let params = engine.parse_parameters("-c \"echo hello\"");
//! let process = engine.run("sh", &params)?;
//! process.wait_finished(None).await;
//! process.check_execution()?;
//! # Ok(())
//! # }
//! ```

mod capture;
mod config;
mod engine;
mod error;
mod events;
mod host;
mod interactive;
mod killtree;
mod launch;
mod output;
mod params;
mod process;
mod procinfo;
mod resolver;
mod scheduler;
mod stdin;
mod supervisor;

pub use capture::{CaptureLayer, CaptureMode, LineObserver};
pub use config::{load_config, EngineConfig};
pub use engine::Engine;
pub use error::{ExecError, Result};
pub use events::{EventForwarder, ExecEvent};
pub use host::{HostEnvironment, HostShutdown, ShutdownRegistry};
pub use interactive::{InteractiveHandler, Reply, ScriptedResponder};
pub use launch::{CommandHook, LaunchSpec, LaunchSpecBuilder, DEFAULT_KILL_GRACE};
pub use output::{CapturedLine, StreamKind};
pub use params::{tokenize, ParamSyntax, ParameterStore};
pub use process::{EndStatus, Phase};
pub use resolver::{is_valid_executable, ExecutableResolver};
pub use scheduler::{
    InlineScheduler, ScheduledTask, Scheduler, Task, ThreadScheduler, TokioScheduler,
};
pub use stdin::{StdinInjector, LINE_ENDING};
pub use supervisor::{EndListener, Supervisor, SupervisorBuilder};
