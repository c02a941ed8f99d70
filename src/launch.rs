//! The phases of starting an instance.
//!
//! A launch begins with a freshly spawned launcher. The launcher is watched for a short
//! grace period (exiting right away means the start command is broken), and then the
//! worker it started is looked up. None of these phases is persisted: a launch lives only
//! as long as the `start` call driving it.

use crate::configuration::deadline_after;
use crate::control::{Launcher, LauncherStatus};
use crate::probe::LiveProcess;
use crate::resolver::ChildResolver;
use machine::*;
use slog_scope::{debug, info};
use std::io;
use std::thread::sleep;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq)]
pub enum LaunchFailure {
    /// The launcher was gone before the grace period ended.
    ImmediateExit { code: Option<i32> },

    /// No worker showed up below the launcher.
    Unresolved,
}

machine! {
    #[derive(Clone, Debug, PartialEq)]
    pub enum Launch {
        Spawned { launcher: u32 },
        Settled { launcher: u32 },
        Resolved { launcher: u32, worker: LiveProcess },
        Failed { launcher: u32, failure: LaunchFailure },
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LauncherExited {
    pub code: Option<i32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GraceElapsed;

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerResolved(pub LiveProcess);

#[derive(Clone, Debug, PartialEq)]
pub struct SettleTimeout;

transitions!(Launch, [
    (Spawned, LauncherExited) => Failed,
    (Spawned, GraceElapsed) => Settled,
    (Settled, WorkerResolved) => Resolved,
    (Settled, SettleTimeout) => Failed
]);

methods!(Launch, [
    Spawned, Settled, Resolved, Failed => fn launcher(&self) -> u32
]);

impl Spawned {
    fn on_launcher_exited(self, exit: LauncherExited) -> Failed {
        info!("launcher exited during the grace period"; "launcher" => self.launcher, "code" => ?exit.code);
        Failed {
            launcher: self.launcher,
            failure: LaunchFailure::ImmediateExit { code: exit.code },
        }
    }

    fn on_grace_elapsed(self, _: GraceElapsed) -> Settled {
        debug!("launcher survived the grace period"; "launcher" => self.launcher);
        Settled {
            launcher: self.launcher,
        }
    }

    fn launcher(&self) -> u32 {
        self.launcher
    }
}

impl Settled {
    fn on_worker_resolved(self, resolved: WorkerResolved) -> Resolved {
        Resolved {
            launcher: self.launcher,
            worker: resolved.0,
        }
    }

    fn on_settle_timeout(self, _: SettleTimeout) -> Failed {
        Failed {
            launcher: self.launcher,
            failure: LaunchFailure::Unresolved,
        }
    }

    fn launcher(&self) -> u32 {
        self.launcher
    }
}

impl Resolved {
    fn launcher(&self) -> u32 {
        self.launcher
    }
}

impl Failed {
    fn launcher(&self) -> u32 {
        self.launcher
    }
}

impl Launch {
    pub fn new(launcher: u32) -> Launch {
        Launch::spawned(launcher)
    }

    /// The worker, once the launch is resolved.
    pub fn worker(&self) -> Option<&LiveProcess> {
        match self {
            Launch::Resolved(Resolved { worker, .. }) => Some(worker),
            _ => None,
        }
    }

    /// Why the launch failed, if it did.
    pub fn failure(&self) -> Option<&LaunchFailure> {
        match self {
            Launch::Failed(Failed { failure, .. }) => Some(failure),
            _ => None,
        }
    }
}

/// Watches `launcher` for up to `grace`, returning its exit if it ends in that time.
fn watch_for_early_exit(
    launcher: &mut dyn Launcher,
    grace: Duration,
    poll_interval: Duration,
) -> io::Result<Option<LauncherExited>> {
    let deadline = deadline_after(grace);
    loop {
        if let LauncherStatus::Exited { code } = launcher.status()? {
            return Ok(Some(LauncherExited { code }));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        sleep(poll_interval.min(deadline - now));
    }
}

/// Takes a spawned launcher through the grace period and worker resolution. The result is
/// either `Launch::Resolved` or `Launch::Failed`.
pub fn drive(
    launcher: &mut dyn Launcher,
    resolver: &ChildResolver<'_>,
    worker_executable: &str,
    grace: Duration,
    poll_interval: Duration,
) -> io::Result<Launch> {
    let launch = Launch::new(launcher.pid());
    let launch = match watch_for_early_exit(launcher, grace, poll_interval)? {
        Some(exit) => return Ok(launch.on_launcher_exited(exit)),
        None => launch.on_grace_elapsed(GraceElapsed),
    };
    Ok(match resolver.resolve(launcher.pid(), worker_executable) {
        Some(worker) => launch.on_worker_resolved(WorkerResolved(worker)),
        None => launch.on_settle_timeout(SettleTimeout),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MemoryProbe;
    use matches::assert_matches;

    struct ScriptedLauncher {
        pid: u32,
        exit_after: Option<usize>,
        polls: usize,
    }

    impl Launcher for ScriptedLauncher {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn status(&mut self) -> io::Result<LauncherStatus> {
            self.polls += 1;
            match self.exit_after {
                Some(n) if self.polls > n => Ok(LauncherStatus::Exited { code: Some(1) }),
                _ => Ok(LauncherStatus::Running),
            }
        }
    }

    fn process(pid: u32, parent: u32, name: &str) -> LiveProcess {
        LiveProcess {
            pid,
            parent,
            comm: name.to_string(),
            executable: Some(name.to_string()),
            start_ticks: 1,
        }
    }

    const POLL: Duration = Duration::from_millis(5);

    #[test]
    fn transitions() {
        let launch = Launch::new(10);
        assert_eq!(launch.launcher(), Some(10));
        let launch = launch.on_grace_elapsed(GraceElapsed);
        assert_matches!(launch, Launch::Settled(_));
        let launch = launch.on_worker_resolved(WorkerResolved(process(11, 10, "java")));
        assert_eq!(launch.worker().map(|w| w.pid), Some(11));
        assert_eq!(launch.launcher(), Some(10));

        // events that make no sense in a state are errors:
        let launch = launch.on_grace_elapsed(GraceElapsed);
        assert_matches!(launch, Launch::Error);
    }

    #[test]
    fn immediate_exit() {
        let probe = MemoryProbe::new();
        let resolver = ChildResolver::new(&probe, POLL, Duration::from_millis(50));
        let mut launcher = ScriptedLauncher {
            pid: 10,
            exit_after: Some(1),
            polls: 0,
        };
        let launch = drive(&mut launcher, &resolver, "java", Duration::from_millis(100), POLL).unwrap();
        assert_eq!(
            launch.failure(),
            Some(&LaunchFailure::ImmediateExit { code: Some(1) })
        );
    }

    #[test]
    fn resolves_after_grace() {
        let probe = MemoryProbe::new();
        probe.insert(process(10, 1, "sh"));
        probe.insert(process(11, 10, "java"));
        let resolver = ChildResolver::new(&probe, POLL, Duration::from_millis(50));
        let mut launcher = ScriptedLauncher {
            pid: 10,
            exit_after: None,
            polls: 0,
        };
        let launch = drive(&mut launcher, &resolver, "java", Duration::from_millis(20), POLL).unwrap();
        assert_eq!(launch.worker().map(|w| w.pid), Some(11));
        assert!(launcher.polls >= 2, "the launcher was watched during the grace period");
    }

    #[test]
    fn unresolved() {
        let probe = MemoryProbe::new();
        probe.insert(process(10, 1, "sh"));
        let resolver = ChildResolver::new(&probe, POLL, Duration::from_millis(20));
        let mut launcher = ScriptedLauncher {
            pid: 10,
            exit_after: None,
            polls: 0,
        };
        let launch = drive(&mut launcher, &resolver, "java", Duration::from_millis(1), POLL).unwrap();
        assert_eq!(launch.failure(), Some(&LaunchFailure::Unresolved));
        assert_eq!(launch.launcher(), Some(10));
    }
}
