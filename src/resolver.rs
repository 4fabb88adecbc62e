//! Executable lookup.
//!
//! `ExecutableResolver` turns a logical executable name (`ffmpeg`) into a validated path.
//! Explicit registrations win, then the name itself when it already is a usable path, then
//! every search directory in priority order.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ExecError, Result};

/// Ordered executable search state.
#[derive(Debug, Clone, Default)]
pub struct ExecutableResolver {
    search_dirs: Vec<PathBuf>,
    registered: HashMap<String, PathBuf>,
}

impl ExecutableResolver {
    /// Creates a resolver without any search directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a directory with the highest priority.
    pub fn add_search_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.search_dirs.insert(0, dir.into());
        self
    }

    /// Adds directories with the lowest priority, keeping their relative order.
    pub fn add_fallback_dirs<I, P>(&mut self, dirs: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_dirs.extend(dirs.into_iter().map(Into::into));
        self
    }

    /// Adds the directories of a `PATH`-style value as fallbacks.
    pub fn add_path_var(&mut self, path_var: &str) -> &mut Self {
        let dirs: Vec<PathBuf> = std::env::split_paths(&OsString::from(path_var))
            .filter(|dir| !dir.as_os_str().is_empty())
            .collect();
        self.add_fallback_dirs(dirs)
    }

    /// Registers an explicit path for `name`.
    ///
    /// The file must be a valid executable at registration time.
    pub fn register(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Result<()> {
        let name = name.into();
        let path = path.into();
        if !is_valid_executable(&path) {
            return Err(ExecError::NotFound {
                name,
                searched: vec![path],
            });
        }
        debug!(name = %name, path = %path.display(), "Registered executable");
        self.registered.insert(name, path);
        Ok(())
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Resolves `name` to an absolute, executable file path.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        if let Some(path) = self.registered.get(name) {
            if is_valid_executable(path) {
                return Ok(absolute(path));
            }
            warn!(name = %name, path = %path.display(), "Registered executable is no longer valid");
        }

        let direct = as_path(Path::new(name));
        if is_valid_executable(&direct) {
            return Ok(absolute(&direct));
        }

        let cwd = std::env::current_dir().unwrap_or_default();
        let candidates_dirs = self.candidate_dirs();
        for dir in &candidates_dirs {
            // `which_in` also tries the PATHEXT variants on Windows.
            if let Ok(path) = which::which_in(name, Some(dir), &cwd) {
                if is_readable(&path) {
                    debug!(name = %name, path = %path.display(), "Resolved executable");
                    return Ok(absolute(&path));
                }
            }
        }

        Err(ExecError::NotFound {
            name: name.to_string(),
            searched: candidates_dirs,
        })
    }

    // Parents of registered executables first, then the search directories.
    fn candidate_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        let registered_parents = self.registered.values().filter_map(|p| p.parent());
        for dir in registered_parents
            .map(Path::to_path_buf)
            .chain(self.search_dirs.iter().cloned())
        {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }
}

// Spells a bare file name as a path in the working directory.
fn as_path(path: &Path) -> PathBuf {
    if path.components().count() > 1 || path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new(".").join(path)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn is_readable(path: &Path) -> bool {
    std::fs::File::open(path).is_ok()
}

/// Whether `path` exists, is a regular file, and is readable and executable by this user.
///
/// On Windows a path without extension also matches its `PATHEXT` variants.
pub fn is_valid_executable(path: &Path) -> bool {
    let cwd = std::env::current_dir().unwrap_or_default();
    match which::which_in(as_path(path), None::<&str>, &cwd) {
        Ok(found) => is_readable(&found),
        Err(_) => false,
    }
}
