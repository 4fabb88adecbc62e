//! Launch specifications.
//!
//! A `LaunchSpec` is the immutable description of what to run: executable, arguments,
//! environment, working directory and limits. It is built once and then owned by a single
//! supervisor; relaunching takes a fresh supervisor.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{ExecError, Result};
use crate::host::HostEnvironment;
use crate::params::ParameterStore;

/// Default window between graceful and forceful termination.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(800);

/// Hook applied to the OS command right before it is spawned.
pub type CommandHook = Arc<dyn Fn(&mut Command) + Send + Sync>;

/// Which standard streams are piped to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StdioPlan {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// Immutable description of a process to launch.
#[derive(Clone)]
pub struct LaunchSpec {
    executable: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    exit_code_must_be_zero: bool,
    max_duration: Option<Duration>,
    kill_grace: Duration,
    command_hook: Option<CommandHook>,
}

impl LaunchSpec {
    /// Starts a spec seeded with the current host environment.
    pub fn builder(executable: impl Into<PathBuf>) -> LaunchSpecBuilder {
        Self::builder_with_host(executable, &HostEnvironment::capture())
    }

    /// Starts a spec seeded with an injected host environment.
    pub fn builder_with_host(
        executable: impl Into<PathBuf>,
        host: &HostEnvironment,
    ) -> LaunchSpecBuilder {
        LaunchSpecBuilder {
            spec: LaunchSpec {
                executable: executable.into(),
                args: Vec::new(),
                env: host.vars().clone(),
                working_dir: None,
                exit_code_must_be_zero: true,
                max_duration: None,
                kill_grace: DEFAULT_KILL_GRACE,
                command_hook: None,
            },
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// File name of the executable, for logs.
    pub fn executable_name(&self) -> String {
        self.executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.display().to_string())
    }

    /// Arguments passed after the executable.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Full argument vector, executable path first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.executable.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Shell-quoted rendering of [`LaunchSpec::argv`].
    pub fn command_line(&self) -> String {
        shell_words::join(self.argv())
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        let key = existing_key(&self.env, name)?;
        self.env.get(&key).map(String::as_str)
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn exit_code_must_be_zero(&self) -> bool {
        self.exit_code_must_be_zero
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    /// Builds the OS command for this spec.
    pub(crate) fn to_command(&self, stdio: StdioPlan) -> Command {
        let mut command = Command::new(&self.executable);
        command.args(&self.args).env_clear().envs(&self.env);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(piped_or_null(stdio.stdin))
            .stdout(piped_or_null(stdio.stdout))
            .stderr(piped_or_null(stdio.stderr));

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        // Own process group, so a terminal signal to the host does not reach the tree first.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        if let Some(hook) = &self.command_hook {
            hook(&mut command);
        }
        command
    }
}

fn piped_or_null(piped: bool) -> Stdio {
    if piped {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

// On Windows `PATH` is matched case-insensitively, `Path` being the usual spelling there.
fn existing_key(env: &BTreeMap<String, String>, name: &str) -> Option<String> {
    if env.contains_key(name) {
        return Some(name.to_string());
    }
    if cfg!(windows) && name.eq_ignore_ascii_case("PATH") {
        return env
            .keys()
            .find(|key| key.eq_ignore_ascii_case("PATH"))
            .cloned();
    }
    None
}

impl fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("executable", &self.executable)
            .field("args", &self.args)
            .field("env_vars", &self.env.len())
            .field("working_dir", &self.working_dir)
            .field("exit_code_must_be_zero", &self.exit_code_must_be_zero)
            .field("max_duration", &self.max_duration)
            .field("kill_grace", &self.kill_grace)
            .field("command_hook", &self.command_hook.is_some())
            .finish()
    }
}

/// Builder for [`LaunchSpec`].
#[derive(Debug, Clone)]
pub struct LaunchSpecBuilder {
    spec: LaunchSpec,
}

impl LaunchSpecBuilder {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends a private copy of the store's current tokens.
    pub fn parameters(mut self, params: &ParameterStore) -> Self {
        self.spec.args.extend(params.tokens().iter().cloned());
        self
    }

    /// Sets a variable, replacing any previous value.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let key = existing_key(&self.spec.env, &name).unwrap_or(name);
        self.spec.env.insert(key, value.into());
        self
    }

    /// Sets a variable only when it is not defined yet.
    pub fn env_if_absent(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if existing_key(&self.spec.env, &name).is_some() {
            return self;
        }
        self.env(name, value)
    }

    pub fn remove_env(mut self, name: &str) -> Self {
        if let Some(key) = existing_key(&self.spec.env, name) {
            self.spec.env.remove(&key);
        }
        self
    }

    /// Puts `dir` in front of the executable search path of the process.
    pub fn prepend_path_dir(self, dir: impl Into<PathBuf>) -> Result<Self> {
        let mut dirs = vec![dir.into()];
        if let Some(current) = self.spec.env_var("PATH") {
            dirs.extend(std::env::split_paths(current));
        }
        let joined = std::env::join_paths(dirs)
            .map_err(|err| ExecError::Config(format!("invalid PATH entry: {}", err)))?;
        Ok(self.env("PATH", joined.to_string_lossy().into_owned()))
    }

    /// Sets the working directory, which must be an existing, readable directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let reject = |reason: &str| ExecError::WorkingDirectory {
            path: dir.clone(),
            reason: reason.to_string(),
        };
        let metadata = std::fs::metadata(&dir).map_err(|_| reject("does not exist"))?;
        if !metadata.is_dir() {
            return Err(reject("not a directory"));
        }
        std::fs::read_dir(&dir).map_err(|_| reject("not readable"))?;
        self.spec.working_dir = Some(dir);
        Ok(self)
    }

    pub fn exit_code_must_be_zero(mut self, must_be_zero: bool) -> Self {
        self.spec.exit_code_must_be_zero = must_be_zero;
        self
    }

    /// Kills the process tree once it has run for `duration`.
    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.spec.max_duration = Some(duration);
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.spec.kill_grace = grace;
        self
    }

    /// Mutates the OS command right before spawn, e.g. to redirect a stream.
    pub fn command_hook(mut self, hook: impl Fn(&mut Command) + Send + Sync + 'static) -> Self {
        self.spec.command_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> LaunchSpec {
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn host() -> HostEnvironment {
        HostEnvironment::from_vars([("PATH", "/usr/bin"), ("HOME", "/home/test")])
    }

    #[test]
    fn argv_starts_with_executable() {
        let mut params = ParameterStore::parse("-i \"my file.mkv\" -y");
        let spec = LaunchSpec::builder_with_host("/usr/bin/ffmpeg", &host())
            .parameters(&params)
            .arg("out.mkv")
            .build();
        params.clear();

        assert_eq!(spec.args(), ["-i", "my file.mkv", "-y", "out.mkv"]);
        assert_eq!(spec.argv()[0], "/usr/bin/ffmpeg");
        assert_eq!(spec.executable_name(), "ffmpeg");
        assert_eq!(
            spec.command_line(),
            "/usr/bin/ffmpeg -i 'my file.mkv' -y out.mkv"
        );
    }

    #[test]
    fn host_environment_is_the_base() {
        let spec = LaunchSpec::builder_with_host("/bin/true", &host())
            .env("HOME", "/tmp")
            .env_if_absent("PATH", "/nope")
            .env_if_absent("LANG", "C")
            .remove_env("MISSING")
            .build();
        assert_eq!(spec.env_var("HOME"), Some("/tmp"));
        assert_eq!(spec.env_var("PATH"), Some("/usr/bin"));
        assert_eq!(spec.env_var("LANG"), Some("C"));
        assert!(spec.exit_code_must_be_zero());
        assert_eq!(spec.kill_grace(), DEFAULT_KILL_GRACE);
    }

    #[cfg(unix)]
    #[test]
    fn prepend_path_dir_goes_first() {
        let spec = LaunchSpec::builder_with_host("/bin/true", &host())
            .prepend_path_dir("/opt/tools/bin")
            .unwrap()
            .build();
        assert_eq!(spec.env_var("PATH"), Some("/opt/tools/bin:/usr/bin"));
    }

    #[test]
    fn working_dir_is_validated() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("file");
        std::fs::write(&file, "x").unwrap();

        let builder = LaunchSpec::builder_with_host("/bin/true", &host());
        assert!(matches!(
            builder.clone().working_dir(tmp.path().join("missing")),
            Err(ExecError::WorkingDirectory { .. })
        ));
        assert!(matches!(
            builder.clone().working_dir(&file),
            Err(ExecError::WorkingDirectory { .. })
        ));
        let spec = builder.working_dir(tmp.path()).unwrap().build();
        assert_eq!(spec.working_dir(), Some(tmp.path()));
    }

    #[test]
    fn limits_are_recorded() {
        let spec = LaunchSpec::builder_with_host("/bin/true", &host())
            .exit_code_must_be_zero(false)
            .max_duration(Duration::from_secs(3))
            .kill_grace(Duration::from_millis(100))
            .command_hook(|command| {
                command.kill_on_drop(true);
            })
            .build();
        assert!(!spec.exit_code_must_be_zero());
        assert_eq!(spec.max_duration(), Some(Duration::from_secs(3)));
        assert_eq!(spec.kill_grace(), Duration::from_millis(100));
        assert!(format!("{:?}", spec).contains("command_hook: true"));
    }
}
