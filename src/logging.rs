use crate::configuration::{LogConfig, LogFormat, LogOutput, Settings};
use crate::instances::LOG_DIR;
use slog::{o, Drain, Duplicate, Logger};
use slog_json::Json;
use slog_logfmt::Logfmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// The supervisor's own log file, kept next to the instances' console logs.
pub const LOG_FILE: &str = "serverkeeper.log";

type BoxDrain = Box<dyn Drain<Ok = (), Err = slog::Never> + Send>;

fn console_drain(log: &LogConfig) -> BoxDrain {
    let output: Box<dyn io::Write + Send + Sync> = match log.output {
        LogOutput::Stderr => Box::new(io::stderr()),
        LogOutput::Stdout => Box::new(io::stdout()),
    };
    match log.format {
        LogFormat::Json => Box::new(Json::new(output).add_default_keys().build().ignore_res()),
        LogFormat::Logfmt { print_prefix } => {
            let mut builder = Logfmt::new(output);
            if !print_prefix {
                builder = builder.no_prefix().print_msg(true);
            }
            Box::new(builder.build().ignore_res())
        }
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

pub fn log_file(settings: &Settings) -> PathBuf {
    settings.root_dir().join(LOG_DIR).join(LOG_FILE)
}

/// Sets up the root logger: human-readable (or JSON) lines on the console, and JSON lines
/// appended to the log file under the instance root. If the log file can't be opened,
/// only the console gets the log.
pub fn setup_logger(settings: &Settings) -> Logger {
    let console = console_drain(&settings.log);
    let path = log_file(settings);
    let (drain, file_error): (BoxDrain, _) = match open_log_file(&path) {
        Ok(file) => {
            let file = Json::new(file).add_default_keys().build();
            (Box::new(Duplicate::new(console, file).ignore_res()), None)
        }
        Err(e) => (console, Some(e)),
    };
    let drain = drain.filter_level(settings.log.level.into()).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = Logger::root(drain, o!("logger" => "serverkeeper"));
    if let Some(e) = file_error {
        slog::warn!(logger, "could not open the log file, logging to the console only";
                    "path" => ?path, "error" => %e);
    }
    logger
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::info;

    #[test]
    fn appends_json_lines_to_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            root: dir.path().to_owned(),
            ..Default::default()
        };
        let logger = setup_logger(&settings);
        info!(logger, "hello"; "instance" => "alpha");
        drop(logger); // flushes the async drain

        let contents = fs::read_to_string(log_file(&settings)).unwrap();
        let line: serde_json::Value = serde_json::from_str(contents.lines().last().unwrap()).unwrap();
        assert_eq!(line["msg"], "hello");
        assert_eq!(line["instance"], "alpha");
        assert_eq!(line["logger"], "serverkeeper");
    }

    #[test]
    fn survives_an_unwritable_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        // a file where the instance root should be:
        let root = dir.path().join("root");
        fs::write(&root, "").unwrap();
        let settings = Settings {
            root,
            ..Default::default()
        };
        let logger = setup_logger(&settings);
        info!(logger, "still logging");
    }
}
