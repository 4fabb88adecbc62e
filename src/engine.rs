//! Config-driven wiring of the engine's collaborators.
//!
//! `Engine` is what a tool wrapper holds: it resolves executables, seeds launch specs with
//! the host environment and the configured defaults, and ties every supervisor it builds
//! to one shutdown registry and one callback scheduler.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::capture::CaptureLayer;
use crate::config::{load_config, EngineConfig};
use crate::error::Result;
use crate::host::{HostEnvironment, ShutdownRegistry};
use crate::launch::{LaunchSpec, LaunchSpecBuilder};
use crate::params::{ParamSyntax, ParameterStore};
use crate::resolver::ExecutableResolver;
use crate::scheduler::Scheduler;
use crate::supervisor::{Supervisor, SupervisorBuilder};

pub struct Engine {
    config: EngineConfig,
    syntax: ParamSyntax,
    resolver: ExecutableResolver,
    host: HostEnvironment,
    shutdown: ShutdownRegistry,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl Engine {
    /// Builds an engine over the current process environment.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_host(config, HostEnvironment::capture())
    }

    /// Builds an engine over an explicit host environment.
    pub fn with_host(config: EngineConfig, host: HostEnvironment) -> Result<Self> {
        let syntax = config.param_syntax()?;
        let mut resolver = ExecutableResolver::new();
        if let Some(dirs) = &config.search_paths {
            resolver.add_fallback_dirs(dirs.iter().cloned());
        }
        if config.use_system_path() {
            if let Some(path_var) = host.path_var() {
                resolver.add_path_var(path_var);
            }
        }
        if let Some(executables) = &config.executables {
            for (name, path) in executables {
                resolver.register(name.clone(), path.clone())?;
            }
        }
        debug!(dirs = resolver.search_dirs().len(), "Engine ready");
        Ok(Self {
            config,
            syntax,
            resolver,
            host,
            shutdown: ShutdownRegistry::new(),
            scheduler: None,
        })
    }

    /// Loads `path` and builds an engine over the current process environment.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let config = load_config(path)?;
        Self::new(config).with_context(|| format!("failed to set up engine from {}", path.display()))
    }

    /// Scheduler used for end listeners and watchdogs of every supervisor built here.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &ExecutableResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut ExecutableResolver {
        &mut self.resolver
    }

    pub fn host(&self) -> &HostEnvironment {
        &self.host
    }

    pub fn shutdown_registry(&self) -> &ShutdownRegistry {
        &self.shutdown
    }

    /// An empty parameter store using the configured syntax.
    pub fn parameters(&self) -> ParameterStore {
        ParameterStore::with_syntax(self.syntax.clone())
    }

    /// Tokenizes `raw` into a parameter store using the configured syntax.
    pub fn parse_parameters(&self, raw: &str) -> ParameterStore {
        let mut params = self.parameters();
        params.add_bulk(raw);
        params
    }

    /// Starts a launch spec for the executable `name` with the configured defaults.
    pub fn launch(&self, name: &str) -> Result<LaunchSpecBuilder> {
        let executable = self.resolver.resolve(name)?;
        let mut builder = LaunchSpec::builder_with_host(executable, &self.host)
            .exit_code_must_be_zero(self.config.exit_code_must_be_zero())
            .kill_grace(self.config.kill_grace());
        if let Some(max_duration) = self.config.max_duration() {
            builder = builder.max_duration(max_duration);
        }
        Ok(builder)
    }

    /// A supervisor builder tied to this engine's scheduler and shutdown registry.
    pub fn supervisor(&self, spec: LaunchSpec) -> SupervisorBuilder {
        let builder = Supervisor::builder(spec).shutdown(Arc::new(self.shutdown.clone()));
        match &self.scheduler {
            Some(scheduler) => builder.scheduler(scheduler.clone()),
            None => builder,
        }
    }

    /// A capture layer with the configured retention and ANSI handling.
    pub fn capture(&self) -> CaptureLayer {
        let capture = CaptureLayer::new().strip_ansi(self.config.strip_ansi());
        match self.config.keep_lines {
            Some(max_lines) => capture.keep_lines(max_lines),
            None => capture,
        }
    }

    /// Runs `name` with `params`, capturing its output.
    ///
    /// The store is copied, later changes to it don't affect the launch.
    pub fn run(&self, name: &str, params: &ParameterStore) -> Result<Supervisor> {
        let spec = self.launch(name)?.parameters(params).build();
        self.supervisor(spec).capture(self.capture()).start()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::error::ExecError;
    use crate::process::EndStatus;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config_for(dir: &Path) -> EngineConfig {
        EngineConfig {
            search_paths: Some(vec![dir.to_path_buf()]),
            use_system_path: Some(false),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn runs_resolved_tool_with_parameters() {
        let dir = tempfile::TempDir::new().unwrap();
        script(dir.path(), "greet", "echo \"$@\"; echo \"$GREETING\"");
        let host = HostEnvironment::from_vars([("GREETING", "hi")]);
        let engine = Engine::with_host(config_for(dir.path()), host).unwrap();

        let mut params = engine.parse_parameters("-name <%WHO%> -loud");
        params.substitute(&[("WHO".to_string(), "world".to_string())].into(), false);
        let process = engine.run("greet", &params).unwrap();
        params.clear();

        assert!(process.wait_finished(Some(Duration::from_secs(10))).await);
        assert_eq!(process.end_status(), EndStatus::CorrectlyDone);
        assert_eq!(
            process.capture().unwrap().stdout_lines(true),
            vec!["-name world -loud", "hi"]
        );
    }

    #[test]
    fn launch_applies_configured_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        script(dir.path(), "tool", "exit 0");
        let config = EngineConfig {
            max_duration_ms: Some(1500),
            kill_grace_ms: Some(100),
            exit_code_must_be_zero: Some(false),
            ..config_for(dir.path())
        };
        let engine = Engine::with_host(config, HostEnvironment::default()).unwrap();
        let spec = engine.launch("tool").unwrap().build();
        assert_eq!(spec.max_duration(), Some(Duration::from_millis(1500)));
        assert_eq!(spec.kill_grace(), Duration::from_millis(100));
        assert!(!spec.exit_code_must_be_zero());
        assert!(spec.executable().is_absolute());
    }

    #[test]
    fn registered_executables_win_and_missing_ones_fail() {
        let dir = tempfile::TempDir::new().unwrap();
        let other = tempfile::TempDir::new().unwrap();
        script(dir.path(), "tool", "exit 0");
        let pinned = script(other.path(), "tool-v2", "exit 0");
        let config = EngineConfig {
            executables: Some([("tool".to_string(), pinned.clone())].into()),
            ..config_for(dir.path())
        };
        let engine = Engine::with_host(config, HostEnvironment::default()).unwrap();
        assert_eq!(
            engine.resolver().resolve("tool").unwrap(),
            std::path::absolute(&pinned).unwrap()
        );
        assert!(matches!(
            engine.launch("absent-tool"),
            Err(ExecError::NotFound { .. })
        ));
    }

    #[test]
    fn custom_syntax_reaches_parameter_stores() {
        let config = EngineConfig {
            key_prefix: Some("--".into()),
            ..EngineConfig::default()
        };
        let engine = Engine::with_host(config, HostEnvironment::default()).unwrap();
        let params = engine.parse_parameters("--in a.mp4 -x");
        assert_eq!(params.values_of("in"), Some(vec!["a.mp4".to_string()]));
        assert!(!params.is_key("-x"));
    }
}
