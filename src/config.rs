//! Engine configuration.
//!
//! This module defines the structure of a `procrack.toml` file and provides functionality to
//! load and parse it. Every field is optional; the accessors apply the defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::launch::DEFAULT_KILL_GRACE;
use crate::params::ParamSyntax;

/// Top-level configuration structure corresponding to `procrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Directories searched for executables, highest priority first.
    pub search_paths: Option<Vec<PathBuf>>,
    /// Whether the host `PATH` directories are searched after `search_paths` (default: true).
    pub use_system_path: Option<bool>,
    /// Explicit executable locations by logical name.
    pub executables: Option<HashMap<String, PathBuf>>,
    /// Prefix marking parameter keys (default: "-").
    pub key_prefix: Option<String>,
    /// Start tag of variable tokens (default: "<%").
    pub var_start: Option<String>,
    /// End tag of variable tokens (default: "%>").
    pub var_end: Option<String>,
    /// Whether a non-zero exit code counts as an error (default: true).
    pub exit_code_must_be_zero: Option<bool>,
    /// Maximum execution time in milliseconds.
    pub max_duration_ms: Option<u64>,
    /// Delay in milliseconds between graceful and forceful termination (default: 800).
    pub kill_grace_ms: Option<u64>,
    /// Maximum number of captured lines kept per process.
    pub keep_lines: Option<usize>,
    /// Whether ANSI escape codes are removed from captured lines (default: false).
    pub strip_ansi: Option<bool>,
}

impl EngineConfig {
    /// Parameter syntax described by the config.
    pub fn param_syntax(&self) -> crate::error::Result<ParamSyntax> {
        let defaults = ParamSyntax::default();
        ParamSyntax::new(
            self.key_prefix.as_deref().unwrap_or(defaults.key_prefix()),
            self.var_start.as_deref().unwrap_or(defaults.var_start()),
            self.var_end.as_deref().unwrap_or(defaults.var_end()),
        )
    }

    pub fn use_system_path(&self) -> bool {
        self.use_system_path.unwrap_or(true)
    }

    pub fn exit_code_must_be_zero(&self) -> bool {
        self.exit_code_must_be_zero.unwrap_or(true)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_KILL_GRACE)
    }

    pub fn strip_ansi(&self) -> bool {
        self.strip_ansi.unwrap_or(false)
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: EngineConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config
        .param_syntax()
        .with_context(|| format!("invalid parameter syntax in {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
search_paths = ["/opt/ffmpeg/bin", "tools"]
use_system_path = false
key_prefix = "--"
var_start = "${"
var_end = "}"
exit_code_must_be_zero = false
max_duration_ms = 30000
kill_grace_ms = 250
keep_lines = 500
strip_ansi = true

[executables]
ffmpeg = "/usr/local/bin/ffmpeg"
"#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(
            config.search_paths,
            Some(vec![PathBuf::from("/opt/ffmpeg/bin"), PathBuf::from("tools")])
        );
        assert!(!config.use_system_path());
        assert!(!config.exit_code_must_be_zero());
        assert_eq!(config.max_duration(), Some(Duration::from_secs(30)));
        assert_eq!(config.kill_grace(), Duration::from_millis(250));
        assert_eq!(config.keep_lines, Some(500));
        assert!(config.strip_ansi());
        assert_eq!(
            config.executables.unwrap().get("ffmpeg"),
            Some(&PathBuf::from("/usr/local/bin/ffmpeg"))
        );
        let syntax = toml::from_str::<EngineConfig>(raw).unwrap().param_syntax().unwrap();
        assert_eq!(syntax.key_prefix(), "--");
        assert_eq!(syntax.var_start(), "${");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert!(config.use_system_path());
        assert!(config.exit_code_must_be_zero());
        assert_eq!(config.max_duration(), None);
        assert_eq!(config.kill_grace(), DEFAULT_KILL_GRACE);
        assert_eq!(config.param_syntax().unwrap(), ParamSyntax::default());
    }

    #[test]
    fn load_rejects_empty_tags() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("procrack.toml");
        std::fs::write(&path, "var_end = \"\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid parameter syntax"));
        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }
}
