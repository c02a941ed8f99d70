use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Environment variable prefix for overriding settings, e.g.
/// `SERVERKEEPER_ROOT` or `SERVERKEEPER_TIMEOUTS__SETTLE`.
pub const ENV_PREFIX: &str = "SERVERKEEPER";

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(default)]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Settings {
    /// The directory holding one subdirectory per instance. Relative paths are resolved
    /// against the directory containing the settings file.
    pub root: PathBuf,

    /// The shell used to run an instance's `startCommand`; it is invoked as `<shell> -c
    /// <startCommand>`.
    pub shell: PathBuf,

    /// The executable name of the long-lived worker that the launcher starts, unless an
    /// instance's `config.json` overrides it.
    pub worker_executable: String,

    pub timeouts: Timeouts,

    pub log: LogConfig,

    /// The directory relative paths get resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            root: PathBuf::from("./InstanceServers"),
            shell: PathBuf::from("/bin/sh"),
            worker_executable: "java".to_string(),
            timeouts: Default::default(),
            log: Default::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl Settings {
    /// Reads settings from an (optional) TOML file and overlays
    /// `SERVERKEEPER_*` environment variables. A missing file yields
    /// the defaults.
    pub fn load(config_file: &Path) -> Result<Settings> {
        let mut settings = config::Config::default();
        settings
            .merge(config::File::from(config_file).required(false))
            .with_context(|| format!("Could not read settings file {:?}", config_file))?;
        settings
            .merge(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .context("Could not read settings from the environment")?;
        let mut settings = settings
            .try_into::<Settings>()
            .with_context(|| format!("Could not parse settings file {:?}", config_file))?;
        settings.base_dir = match config_file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_owned(),
            _ => PathBuf::from("."),
        };
        Ok(settings)
    }

    /// Resolves a path relative to the settings file's location.
    pub fn canonical_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.base_dir.join(path)
        }
    }

    /// The instance root, resolved.
    pub fn root_dir(&self) -> PathBuf {
        self.canonical_path(&self.root)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(default)]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Timeouts {
    /// How long a freshly spawned launcher is watched for an immediate exit.
    #[serde(with = "humantime_serde")]
    pub launch_grace: Duration,

    /// Interval between checks in every polling loop.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound on the search for the worker process after the grace window.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,

    /// Upper bound on waiting for a killed worker to disappear during a restart.
    #[serde(with = "humantime_serde")]
    pub exit: Duration,
}

/// Stands in for timeouts too large to add to the current time.
const FOREVER: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The point in time `timeout` from now. A timeout too large to represent as an `Instant`
/// doesn't run out.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FOREVER))
        .unwrap_or(now)
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            launch_grace: Duration::from_millis(100),
            poll_interval: Duration::from_millis(100),
            settle: Duration::from_secs(5),
            exit: Duration::from_secs(10),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(default)]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LogLevel::Info,
            format: LogFormat::Logfmt {
                print_prefix: false,
            },
            output: LogOutput::Stderr,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> slog::Level {
        match level {
            LogLevel::Critical => slog::Level::Critical,
            LogLevel::Error => slog::Level::Error,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Trace => slog::Level::Trace,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LogFormat {
    Json,
    Logfmt {
        /// Whether to print the timestamp/level prefix before each line.
        #[serde(default)]
        print_prefix: bool,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogOutput {
    Stderr,
    Stdout,
}

/// The contents of an instance's `config.json`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct InstanceConfig {
    /// The command line handed to the launcher shell. Required and non-empty.
    #[serde(default)]
    pub start_command: String,

    /// Overrides [`Settings::worker_executable`] for this instance.
    #[serde(default)]
    pub worker_executable: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn huge_timeouts_never_run_out() {
        let before = Instant::now();
        assert!(deadline_after(Duration::MAX) > before + Duration::from_secs(365 * 24 * 60 * 60));
        assert!(deadline_after(Duration::from_millis(5)) >= before + Duration::from_millis(5));
    }

    #[test]
    fn missing_settings_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("serverkeeper.toml")).unwrap();
        assert_eq!(settings.worker_executable, "java");
        assert_eq!(settings.timeouts, Timeouts::default());
        assert_eq!(settings.root_dir(), dir.path().join("InstanceServers"));
    }

    #[test]
    fn reads_toml_settings() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("serverkeeper.toml");
        fs::write(
            &file,
            r#"
root = "/srv/games"
worker_executable = "bedrock_server"

[timeouts]
settle = "2s"
poll_interval = "50ms"

[log]
level = "debug"

[log.format]
type = "json"
"#,
        )
        .unwrap();
        let settings = Settings::load(&file).unwrap();
        assert_eq!(settings.root_dir(), PathBuf::from("/srv/games"));
        assert_eq!(settings.worker_executable, "bedrock_server");
        assert_eq!(settings.timeouts.settle, Duration::from_secs(2));
        assert_eq!(settings.timeouts.poll_interval, Duration::from_millis(50));
        assert_eq!(settings.timeouts.exit, Duration::from_secs(10));
        assert_eq!(settings.log.level, LogLevel::Debug);
        assert_eq!(settings.log.format, LogFormat::Json);
    }

    #[test]
    fn instance_config_keys_are_camel_case() {
        let config: InstanceConfig =
            serde_json::from_str(r#"{"startCommand": "run.sh", "workerExecutable": "java"}"#)
                .unwrap();
        assert_eq!(config.start_command, "run.sh");
        assert_eq!(config.worker_executable.as_deref(), Some("java"));

        let config: InstanceConfig = serde_json::from_str(r#"{"motd": "hi"}"#).unwrap();
        assert_eq!(config, InstanceConfig::default());
    }
}
