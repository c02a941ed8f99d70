//! Spawning launchers and terminating workers.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{setsid, Pid};
use slog_scope::debug;
use std::env;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io;
use std::iter;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

/// Everything needed to launch an instance.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub instance: &'a str,
    pub shell: &'a Path,
    pub command: &'a str,
    pub working_directory: &'a Path,

    /// Where the launcher's stdout and stderr go; discarded if `None`.
    pub console_log: Option<&'a Path>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherStatus {
    Running,
    Exited { code: Option<i32> },
}

/// A launcher process this supervisor spawned.
pub trait Launcher: Send {
    fn pid(&self) -> u32;

    /// Checks, without blocking, whether the launcher has exited.
    fn status(&mut self) -> io::Result<LauncherStatus>;
}

pub trait ProcessControl: Send + Sync {
    /// Starts the launcher for an instance.
    fn spawn(&self, spec: &LaunchSpec<'_>) -> io::Result<Box<dyn Launcher>>;

    /// Forcefully terminates `pid`. `Errno::ESRCH` means the process was already gone.
    fn terminate(&self, pid: u32) -> nix::Result<()>;
}

impl<T: ProcessControl + ?Sized> ProcessControl for Arc<T> {
    fn spawn(&self, spec: &LaunchSpec<'_>) -> io::Result<Box<dyn Launcher>> {
        (**self).spawn(spec)
    }

    fn terminate(&self, pid: u32) -> nix::Result<()> {
        (**self).terminate(pid)
    }
}

/// Launches instances through a shell, in a session of their own so they outlive the
/// supervisor and its terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessControl;

struct ShellLauncher {
    child: Child,
}

impl Launcher for ShellLauncher {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn status(&mut self) -> io::Result<LauncherStatus> {
        Ok(match self.child.try_wait()? {
            None => LauncherStatus::Running,
            Some(status) => LauncherStatus::Exited {
                code: status.code(),
            },
        })
    }
}

/// `$PATH` with the instance directory in front, so that a `startCommand` of `run.sh`
/// finds the script next to it.
fn search_path(working_directory: &Path) -> io::Result<OsString> {
    let inherited = env::var_os("PATH").unwrap_or_default();
    env::join_paths(
        iter::once(working_directory.to_owned()).chain(env::split_paths(&inherited)),
    )
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

impl ProcessControl for OsProcessControl {
    fn spawn(&self, spec: &LaunchSpec<'_>) -> io::Result<Box<dyn Launcher>> {
        let mut cmd = Command::new(spec.shell);
        cmd.arg("-c")
            .arg(spec.command)
            .current_dir(spec.working_directory)
            .env("PATH", search_path(spec.working_directory)?)
            .stdin(Stdio::null());
        match spec.console_log {
            Some(log) => {
                if let Some(dir) = log.parent() {
                    fs::create_dir_all(dir)?;
                }
                let console = OpenOptions::new().create(true).append(true).open(log)?;
                cmd.stdout(console.try_clone()?).stderr(console);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        // SAFETY: setsid is async-signal-safe and runs in the child before exec.
        unsafe {
            cmd.pre_exec(|| setsid().map(|_| ()).map_err(io::Error::from));
        }
        debug!("spawning launcher"; "instance" => spec.instance, "cmd" => ?cmd);
        let child = cmd.spawn()?;
        Ok(Box::new(ShellLauncher { child }))
    }

    fn terminate(&self, pid: u32) -> nix::Result<()> {
        // 0 and anything that turns negative as a pid_t would address process groups.
        if pid == 0 || pid > i32::MAX as u32 {
            return Err(Errno::EINVAL);
        }
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn wait_for_exit(launcher: &mut dyn Launcher) -> LauncherStatus {
        for _ in 0..100 {
            match launcher.status().unwrap() {
                LauncherStatus::Running => sleep(Duration::from_millis(20)),
                exited => return exited,
            }
        }
        panic!("launcher didn't exit");
    }

    #[test]
    fn runs_in_working_directory_with_console_capture() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(".logs/alpha.console.log");
        let spec = LaunchSpec {
            instance: "alpha",
            shell: Path::new("/bin/sh"),
            command: "pwd; exit 3",
            working_directory: dir.path(),
            console_log: Some(&log),
        };
        let mut launcher = OsProcessControl.spawn(&spec).unwrap();
        assert_eq!(
            wait_for_exit(launcher.as_mut()),
            LauncherStatus::Exited { code: Some(3) }
        );
        let output = fs::read_to_string(&log).unwrap();
        let cwd = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(output.trim()).canonicalize().unwrap(), cwd);
    }

    #[test]
    fn finds_scripts_in_working_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hello.sh");
        fs::write(&script, "#!/bin/sh\nexit 7\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let spec = LaunchSpec {
            instance: "alpha",
            shell: Path::new("/bin/sh"),
            command: "hello.sh",
            working_directory: dir.path(),
            console_log: None,
        };
        let mut launcher = OsProcessControl.spawn(&spec).unwrap();
        assert_eq!(
            wait_for_exit(launcher.as_mut()),
            LauncherStatus::Exited { code: Some(7) }
        );
    }

    #[test]
    fn missing_shell_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec {
            instance: "alpha",
            shell: Path::new("/nonexistent/shell"),
            command: "true",
            working_directory: dir.path(),
            console_log: None,
        };
        assert!(OsProcessControl.spawn(&spec).is_err());
    }

    #[test]
    fn refuses_group_pids() {
        assert_eq!(OsProcessControl.terminate(0), Err(Errno::EINVAL));
        assert_eq!(OsProcessControl.terminate(u32::MAX), Err(Errno::EINVAL));
    }

    #[test]
    fn kills_processes() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        OsProcessControl.terminate(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
