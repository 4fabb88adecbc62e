//! Host process state injected into supervisors.
//!
//! The environment of the host process and its shutdown notification are passed in
//! explicitly, so tests can substitute fakes for both.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ExecError;
use crate::process::Phase;
use crate::supervisor::{Supervisor, WeakSupervisor};

/// Snapshot of the host environment variables.
///
/// It seeds the environment of every launch spec built from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnvironment {
    vars: BTreeMap<String, String>,
}

impl HostEnvironment {
    /// Snapshots the current process environment.
    ///
    /// Variables that are not valid unicode are skipped.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        }
    }

    /// Builds a snapshot from explicit variables.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// The executable search path variable (`PATH`, or `Path` on Windows).
    pub fn path_var(&self) -> Option<&str> {
        if let Some(path) = self.get("PATH") {
            return Some(path);
        }
        if cfg!(windows) {
            return self
                .vars
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("PATH"))
                .map(|(_, v)| v.as_str());
        }
        None
    }
}

/// Capability to tie a process to the host's shutdown.
pub trait HostShutdown: Send + Sync {
    /// Arranges for `process` to be killed when the host shuts down.
    fn register(&self, process: &Supervisor);
}

/// Keeps weak handles on started processes and kills the live ones on demand.
#[derive(Clone, Default)]
pub struct ShutdownRegistry {
    processes: Arc<Mutex<Vec<WeakSupervisor>>>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered processes that are still alive.
    pub fn live(&self) -> Vec<Supervisor> {
        let processes = match self.processes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        processes
            .iter()
            .filter_map(WeakSupervisor::upgrade)
            .filter(Supervisor::is_running)
            .collect()
    }

    /// Kills every live registered process tree.
    ///
    /// All trees are attempted; the failures are returned.
    pub async fn kill_all(&self) -> Vec<ExecError> {
        let mut failures = Vec::new();
        for process in self.live() {
            if let Err(err) = process.kill().await {
                warn!(pid = ?process.pid(), error = %err, "Failed to kill process on shutdown");
                failures.push(err);
            }
        }
        failures
    }

    /// Kills every live registered process once Ctrl-C is received.
    ///
    /// Must be called from within a tokio runtime.
    pub fn kill_all_on_ctrl_c(&self) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, killing supervised processes");
                registry.kill_all().await;
            }
        })
    }
}

impl HostShutdown for ShutdownRegistry {
    fn register(&self, process: &Supervisor) {
        let mut processes = match self.processes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        processes.retain(|weak| {
            weak.upgrade()
                .is_some_and(|p| p.phase() == Phase::Unstarted || p.is_running())
        });
        processes.push(process.downgrade());
    }
}

impl std::fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownRegistry")
            .field("live", &self.live().len())
            .finish()
    }
}
