//! Starting, stopping and checking on instances.
//!
//! An instance is running if and only if it has an identity record, and the process table
//! currently holds a process that matches that record. The supervisor re-derives this on
//! every call: nothing is cached between operations, and there is no background monitor.

use crate::configuration::{deadline_after, Settings};
use crate::control::{LaunchSpec, OsProcessControl, ProcessControl};
use crate::error::{Result, SupervisorError};
use crate::identity::{FileIdentityStore, IdentityRecord, IdentityStore};
use crate::instances::{InstanceDirectory, PID_DIR};
use crate::launch::{self, LaunchFailure};
use crate::lock::InstanceLock;
use crate::probe::{self, ProcFs, ProcessProbe, ResourceSample};
use crate::resolver::ChildResolver;
use nix::errno::Errno;
use serde::Serialize;
use slog_scope::{debug, error, info, warn};
use std::fmt;
use std::io;
use std::thread::sleep;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstanceStatus {
    Running { pid: u32, sample: ResourceSample },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub instance: String,
    #[serde(flatten)]
    pub status: InstanceStatus,

    /// The process ID of a stale identity record that got cleared while checking.
    pub cleared_stale: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Started {
    pub instance: String,

    /// The worker process, which is what gets supervised from now on.
    pub pid: u32,

    /// The shell that started the worker.
    pub launcher: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    /// The worker was killed.
    Stopped { pid: u32 },

    /// There was nothing to stop. Not an error.
    NotRunning { cleared_stale: Option<u32> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Restarted {
    pub stop: StopOutcome,
    pub start: Started,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListEntry {
    pub name: String,

    /// The worker's process ID, if the instance is running.
    pub pid: Option<u32>,
}

/// What the bookkeeping and the process table say about an instance, together.
#[derive(Debug)]
enum Liveness {
    NoRecord,
    Stale(IdentityRecord),
    Running(IdentityRecord),
}

pub struct Supervisor {
    settings: Settings,
    instances: InstanceDirectory,
    store: Box<dyn IdentityStore>,
    probe: Box<dyn ProcessProbe>,
    control: Box<dyn ProcessControl>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("root", &self.instances.root())
            .finish()
    }
}

/// Logs how an operation on an instance went and passes its result on.
fn logged<T: fmt::Debug>(operation: &str, instance: &str, result: Result<T>) -> Result<T> {
    match &result {
        Ok(outcome) => info!("done"; "op" => operation, "instance" => instance, "outcome" => ?outcome),
        Err(e)
            if matches!(
                e,
                SupervisorError::InstanceBusy(_) | SupervisorError::AlreadyRunning { .. }
            ) =>
        {
            warn!("refused"; "op" => operation, "instance" => instance, "kind" => e.kind(), "error" => %e)
        }
        Err(e) => {
            error!("failed"; "op" => operation, "instance" => instance, "kind" => e.kind(), "error" => ?e)
        }
    }
    result
}

impl Supervisor {
    /// A supervisor acting on the real process table and the instance root from `settings`.
    pub fn new(settings: Settings) -> Supervisor {
        let store = FileIdentityStore::new(settings.root_dir().join(PID_DIR));
        Supervisor::with_parts(
            settings,
            Box::new(store),
            Box::new(ProcFs::default()),
            Box::new(OsProcessControl),
        )
    }

    pub fn with_parts(
        settings: Settings,
        store: Box<dyn IdentityStore>,
        probe: Box<dyn ProcessProbe>,
        control: Box<dyn ProcessControl>,
    ) -> Supervisor {
        let instances = InstanceDirectory::new(settings.root_dir());
        Supervisor {
            settings,
            instances,
            store,
            probe,
            control,
        }
    }

    pub fn instances(&self) -> &InstanceDirectory {
        &self.instances
    }

    fn storage_error(instance: &str) -> impl FnOnce(io::Error) -> SupervisorError + '_ {
        move |source| SupervisorError::Storage {
            instance: instance.to_string(),
            source,
        }
    }

    fn lock(&self, name: &str) -> Result<InstanceLock> {
        if !self.instances.contains(name) {
            return Err(SupervisorError::InstanceNotFound(name.to_string()));
        }
        InstanceLock::try_acquire(&self.instances.lock_dir(), name)
            .map_err(Self::storage_error(name))?
            .ok_or_else(|| SupervisorError::InstanceBusy(name.to_string()))
    }

    fn liveness(&self, name: &str) -> Result<Liveness> {
        let record = match self.store.read(name).map_err(Self::storage_error(name))? {
            None => return Ok(Liveness::NoRecord),
            Some(record) => record,
        };
        match self.probe.inspect(record.pid) {
            Some(process) if record.corroborated_by(&process) => Ok(Liveness::Running(record)),
            Some(process) => {
                debug!("recorded pid belongs to another process now";
                       "instance" => name, "record" => ?record, "process" => ?process);
                Ok(Liveness::Stale(record))
            }
            None => Ok(Liveness::Stale(record)),
        }
    }

    fn clear_stale(&self, name: &str, record: &IdentityRecord) -> Result<()> {
        info!("clearing stale identity record"; "instance" => name, "pid" => record.pid);
        self.store.clear(name).map_err(Self::storage_error(name))
    }

    /// Lists all instances and the process ID of each running one. This neither locks nor
    /// repairs anything.
    pub fn list(&self) -> Result<Vec<ListEntry>> {
        let root = self.instances.root().display().to_string();
        let names = self
            .instances
            .names()
            .map_err(|source| SupervisorError::Storage {
                instance: root,
                source,
            })?;
        names
            .into_iter()
            .map(|name| -> Result<ListEntry> {
                let pid = match self.liveness(&name)? {
                    Liveness::Running(record) => Some(record.pid),
                    _ => None,
                };
                Ok(ListEntry { name, pid })
            })
            .collect()
    }

    /// Launches the instance and records its worker.
    pub fn start(&self, name: &str) -> Result<Started> {
        info!("starting"; "instance" => name);
        let result = self.lock(name).and_then(|_lock| self.start_locked(name));
        logged("start", name, result)
    }

    fn start_locked(&self, name: &str) -> Result<Started> {
        let instance = self.instances.load(name)?;
        match self.liveness(name)? {
            Liveness::Running(record) => {
                return Err(SupervisorError::AlreadyRunning {
                    instance: name.to_string(),
                    pid: record.pid,
                });
            }
            Liveness::Stale(record) => self.clear_stale(name, &record)?,
            Liveness::NoRecord => {}
        }

        let executable = instance.worker_executable(&self.settings.worker_executable);
        let console_log = self.instances.console_log(name);
        let spec = LaunchSpec {
            instance: name,
            shell: &self.settings.shell,
            command: &instance.config.start_command,
            working_directory: &instance.working_directory,
            console_log: Some(&console_log),
        };
        let spawn_failed = |source| SupervisorError::SpawnFailed {
            instance: name.to_string(),
            source,
        };
        let mut launcher = self.control.spawn(&spec).map_err(spawn_failed)?;
        info!("spawned launcher"; "instance" => name, "launcher" => launcher.pid(), "command" => &instance.config.start_command);

        let timeouts = &self.settings.timeouts;
        let resolver = ChildResolver::new(self.probe.as_ref(), timeouts.poll_interval, timeouts.settle);
        let launch = launch::drive(
            launcher.as_mut(),
            &resolver,
            executable,
            timeouts.launch_grace,
            timeouts.poll_interval,
        )
        .map_err(spawn_failed)?;

        let worker = match (launch.worker(), launch.failure()) {
            (Some(worker), _) => worker,
            (None, Some(LaunchFailure::ImmediateExit { code })) => {
                return Err(SupervisorError::ImmediateExit {
                    instance: name.to_string(),
                    code: *code,
                });
            }
            (None, _) => {
                return Err(SupervisorError::ResolutionFailed {
                    instance: name.to_string(),
                    launcher: launcher.pid(),
                    worker_executable: executable.to_string(),
                });
            }
        };
        let record = IdentityRecord::for_process(worker, executable);
        if let Err(e) = self.store.write(name, &record) {
            error!("worker is running but could not be recorded"; "instance" => name, "pid" => worker.pid);
            return Err(Self::storage_error(name)(e));
        }
        Ok(Started {
            instance: name.to_string(),
            pid: worker.pid,
            launcher: launcher.pid(),
        })
    }

    /// Kills the instance's worker. Stopping an instance that isn't running is fine.
    pub fn stop(&self, name: &str) -> Result<StopOutcome> {
        info!("stopping"; "instance" => name);
        let result = self
            .lock(name)
            .and_then(|_lock| self.stop_locked(name))
            .map(|(outcome, _)| outcome);
        logged("stop", name, result)
    }

    /// Stops the instance, returning the record of the worker it killed, if any.
    fn stop_locked(&self, name: &str) -> Result<(StopOutcome, Option<IdentityRecord>)> {
        let record = match self.liveness(name)? {
            Liveness::NoRecord => return Ok((StopOutcome::NotRunning { cleared_stale: None }, None)),
            Liveness::Stale(record) => {
                self.clear_stale(name, &record)?;
                let outcome = StopOutcome::NotRunning {
                    cleared_stale: Some(record.pid),
                };
                return Ok((outcome, None));
            }
            Liveness::Running(record) => record,
        };

        match self.control.terminate(record.pid) {
            Ok(()) => {
                info!("killed worker"; "instance" => name, "pid" => record.pid);
                self.store.clear(name).map_err(Self::storage_error(name))?;
                Ok((StopOutcome::Stopped { pid: record.pid }, Some(record)))
            }
            Err(Errno::ESRCH) => {
                // It exited between the check and the kill.
                self.clear_stale(name, &record)?;
                let outcome = StopOutcome::NotRunning {
                    cleared_stale: Some(record.pid),
                };
                Ok((outcome, None))
            }
            Err(source) => Err(SupervisorError::TerminationFailed {
                instance: name.to_string(),
                pid: record.pid,
                source,
            }),
        }
    }

    /// Reports whether the instance is running, and if so, how many resources it uses.
    /// Clears the identity record if it turns out to be stale.
    pub fn status(&self, name: &str) -> Result<StatusReport> {
        let result = self.lock(name).and_then(|_lock| self.status_locked(name));
        logged("status", name, result)
    }

    fn status_locked(&self, name: &str) -> Result<StatusReport> {
        let (status, cleared_stale) = match self.liveness(name)? {
            Liveness::NoRecord => (InstanceStatus::Stopped, None),
            Liveness::Stale(record) => {
                self.clear_stale(name, &record)?;
                (InstanceStatus::Stopped, Some(record.pid))
            }
            Liveness::Running(record) => (
                InstanceStatus::Running {
                    pid: record.pid,
                    sample: self.sample(name, record.pid),
                },
                None,
            ),
        };
        Ok(StatusReport {
            instance: name.to_string(),
            status,
            cleared_stale,
        })
    }

    fn sample(&self, name: &str, pid: u32) -> ResourceSample {
        let dir = self.instances.root().join(name);
        let mut sample = self.probe.sample(pid);
        sample.disk_usage_bytes = probe::directory_size(&dir)
            .map_err(|e| debug!("could not measure instance directory"; "instance" => name, "error" => %e))
            .ok();
        sample.free_space_bytes = probe::free_space(&dir)
            .map_err(|e| debug!("could not measure free space"; "instance" => name, "error" => %e))
            .ok();
        sample
    }

    /// Stops the instance, waits for the worker to be gone, and starts it again.
    pub fn restart(&self, name: &str) -> Result<Restarted> {
        info!("restarting"; "instance" => name);
        let result = self.lock(name).and_then(|_lock| {
            let (stop, killed) = self.stop_locked(name)?;
            if let Some(record) = killed {
                self.wait_for_exit(name, &record)?;
            }
            let start = self.start_locked(name)?;
            Ok(Restarted { stop, start })
        });
        logged("restart", name, result)
    }

    /// Polls until the process from `record` is gone from the process table.
    fn wait_for_exit(&self, name: &str, record: &IdentityRecord) -> Result<()> {
        let timeouts = &self.settings.timeouts;
        let deadline = deadline_after(timeouts.exit);
        loop {
            match self.probe.inspect(record.pid) {
                Some(process) if record.corroborated_by(&process) => {}
                _ => return Ok(()),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SupervisorError::ExitTimeout {
                    instance: name.to_string(),
                    pid: record.pid,
                });
            }
            sleep(timeouts.poll_interval.min(deadline - now));
        }
    }
}
