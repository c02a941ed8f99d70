//! The on-disk layout of the instance root.

use crate::configuration::InstanceConfig;
use crate::error::{Result, SupervisorError};
use slog_scope::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Entries of the instance root starting with this are bookkeeping, not instances.
pub const RESERVED_PREFIX: char = '.';

/// Holds one identity record per instance.
pub const PID_DIR: &str = ".pids";

/// Holds the supervisor's log and the launchers' console output.
pub const LOG_DIR: &str = ".logs";

/// Holds one lock file per instance.
pub const LOCK_DIR: &str = ".locks";

/// The per-instance configuration file.
pub const CONFIG_FILE: &str = "config.json";

/// Returns whether `name` may name an instance: a single, non-reserved path component.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(RESERVED_PREFIX)
        && !name.contains(|c| c == '/' || c == '\\' || c == '\0')
}

/// A named server configuration, as found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub name: String,
    pub working_directory: PathBuf,
    pub config: InstanceConfig,
}

impl Instance {
    /// The executable name of this instance's worker process.
    pub fn worker_executable<'a>(&'a self, default: &'a str) -> &'a str {
        self.config.worker_executable.as_deref().unwrap_or(default)
    }
}

/// Read-only view of the instance root directory.
#[derive(Debug, Clone)]
pub struct InstanceDirectory {
    root: PathBuf,
}

impl InstanceDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        InstanceDirectory { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.root.join(PID_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(LOCK_DIR)
    }

    /// The file that receives the launcher's stdout and stderr.
    pub fn console_log(&self, name: &str) -> PathBuf {
        self.log_dir().join(format!("{}.console.log", name))
    }

    /// Lists instance names in lexical order. A missing root has no instances.
    pub fn names(&self) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        let mut names = vec![];
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if valid_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Returns whether an instance directory named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        valid_name(name) && self.root.join(name).is_dir()
    }

    /// Loads an instance and its configuration, validating that it can be started.
    pub fn load(&self, name: &str) -> Result<Instance> {
        if !self.contains(name) {
            return Err(SupervisorError::InstanceNotFound(name.to_string()));
        }
        let working_directory = self.root.join(name);
        let config_path = working_directory.join(CONFIG_FILE);
        debug!("loading instance config"; "instance" => name, "path" => ?config_path);

        let invalid = |reason: String| SupervisorError::ConfigurationInvalid {
            instance: name.to_string(),
            reason,
        };
        let contents = fs::read_to_string(&config_path)
            .map_err(|e| invalid(format!("could not read {:?}: {}", config_path, e)))?;
        let config: InstanceConfig = serde_json::from_str(&contents)
            .map_err(|e| invalid(format!("could not parse {:?}: {}", config_path, e)))?;
        if config.start_command.trim().is_empty() {
            return Err(invalid("startCommand is missing or empty".to_string()));
        }
        if let Some(exe) = &config.worker_executable {
            if exe.trim().is_empty() {
                return Err(invalid("workerExecutable is empty".to_string()));
            }
        }
        Ok(Instance {
            name: name.to_string(),
            working_directory,
            config,
        })
    }
}
