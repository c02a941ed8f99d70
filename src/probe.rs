//! Queries against the live process table.
//!
//! Everything a probe reports is a snapshot: processes come and go (and process IDs get
//! reused) concurrently with every query.

use nix::unistd::{sysconf, SysconfVar};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod disk;
mod parse;

pub use disk::{directory_size, free_space};

/// The kernel truncates process names to this many bytes.
const COMM_LEN: usize = 15;

/// A process table entry, as seen at the time of the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveProcess {
    pub pid: u32,
    pub parent: u32,

    /// The (possibly truncated) process name the kernel reports.
    pub comm: String,

    /// The file name of the process's executable, if it could be read.
    pub executable: Option<String>,

    /// When the process started, in clock ticks since boot.
    pub start_ticks: u64,
}

impl LiveProcess {
    /// Returns whether this process runs the executable `name`. Matches the executable's
    /// file name, or the kernel's process name (which is what a script or a multi-call
    /// binary shows up as). The kernel truncates process names, so a truncated match only
    /// counts when the executable can't be read.
    pub fn matches_executable(&self, name: &str) -> bool {
        match &self.executable {
            Some(exe) if exe == name => true,
            Some(_) => name.len() <= COMM_LEN && self.comm == name,
            None => {
                let truncated = &name.as_bytes()[..name.len().min(COMM_LEN)];
                self.comm.as_bytes() == truncated
            }
        }
    }
}

/// Resource consumption of an instance. Every metric that could not be
/// determined is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ResourceSample {
    /// Resident set size.
    pub memory_bytes: Option<u64>,

    /// User + system CPU time consumed so far.
    #[serde(with = "humantime_serde")]
    pub cpu_time: Option<Duration>,

    /// Size of the instance directory.
    pub disk_usage_bytes: Option<u64>,

    /// Space available to unprivileged users on the volume holding the instance.
    pub free_space_bytes: Option<u64>,
}

pub trait ProcessProbe: Send + Sync {
    /// Returns the live process with ID `pid`. Processes that have exited but not been
    /// reaped yet are not live.
    fn inspect(&self, pid: u32) -> Option<LiveProcess>;

    /// Returns every live process.
    fn processes(&self) -> Vec<LiveProcess>;

    /// Samples memory and CPU usage of `pid`. Disk metrics are left out.
    fn sample(&self, pid: u32) -> ResourceSample;

    /// Returns whether some process with ID `pid` is alive. This doesn't prove that it is
    /// the process you think it is.
    fn exists(&self, pid: u32) -> bool {
        self.inspect(pid).is_some()
    }

    fn parent_of(&self, pid: u32) -> Option<u32> {
        self.inspect(pid).map(|p| p.parent)
    }

    fn children_of(&self, parent: u32) -> Vec<LiveProcess> {
        self.processes()
            .into_iter()
            .filter(|p| p.parent == parent)
            .collect()
    }

    /// Finds a child of `parent` running `executable`. If `parent` is gone, so are its
    /// children (they got re-parented), and the result is `None`.
    fn find_child_by_executable_name(
        &self,
        parent: u32,
        executable: &str,
    ) -> Option<LiveProcess> {
        self.processes()
            .into_iter()
            .find(|p| p.parent == parent && p.matches_executable(executable))
    }
}

impl<T: ProcessProbe + ?Sized> ProcessProbe for Arc<T> {
    fn inspect(&self, pid: u32) -> Option<LiveProcess> {
        (**self).inspect(pid)
    }

    fn processes(&self) -> Vec<LiveProcess> {
        (**self).processes()
    }

    fn sample(&self, pid: u32) -> ResourceSample {
        (**self).sample(pid)
    }
}

/// A probe reading the Linux `/proc` filesystem.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
    ticks_per_second: u64,
}

impl Default for ProcFs {
    fn default() -> Self {
        ProcFs::new("/proc")
    }
}

impl ProcFs {
    /// Reads a procfs mounted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let ticks_per_second = match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(ticks)) if ticks > 0 => ticks as u64,
            _ => 100,
        };
        ProcFs {
            root: root.into(),
            ticks_per_second,
        }
    }

    fn process_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    fn read_stat(&self, pid: u32) -> Option<parse::Stat> {
        let content = fs::read_to_string(self.process_dir(pid).join("stat")).ok()?;
        parse::stat(&content)
    }
}

fn executable_name(link: &Path) -> Option<String> {
    let target = fs::read_link(link).ok()?;
    let name = target.file_name()?.to_str()?;
    Some(name.trim_end_matches(" (deleted)").to_string())
}

impl ProcessProbe for ProcFs {
    fn inspect(&self, pid: u32) -> Option<LiveProcess> {
        let stat = self.read_stat(pid)?;
        if !stat.is_live() {
            return None;
        }
        Some(LiveProcess {
            pid,
            parent: stat.ppid,
            comm: stat.comm,
            executable: executable_name(&self.process_dir(pid).join("exe")),
            start_ticks: stat.start_ticks,
        })
    }

    fn processes(&self) -> Vec<LiveProcess> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return vec![],
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter_map(|pid| self.inspect(pid))
            .collect()
    }

    fn sample(&self, pid: u32) -> ResourceSample {
        let memory_bytes = fs::read_to_string(self.process_dir(pid).join("status"))
            .ok()
            .and_then(|status| parse::resident_bytes(&status));
        let cpu_time = self.read_stat(pid).map(|stat| {
            let ticks = stat.user_ticks + stat.system_ticks;
            Duration::from_millis(ticks * 1000 / self.ticks_per_second)
        });
        ResourceSample {
            memory_bytes,
            cpu_time,
            ..Default::default()
        }
    }
}

/// A process table that only exists in memory; for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryProbe {
    processes: Mutex<BTreeMap<u32, (LiveProcess, ResourceSample)>>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds (or replaces) a process.
    pub fn insert(&self, process: LiveProcess) {
        self.processes
            .lock()
            .insert(process.pid, (process, Default::default()));
    }

    /// Sets what [`ProcessProbe::sample`] reports for `pid`.
    pub fn set_sample(&self, pid: u32, sample: ResourceSample) {
        if let Some(entry) = self.processes.lock().get_mut(&pid) {
            entry.1 = sample;
        }
    }

    /// Makes a process vanish, as if it had exited and been reaped.
    pub fn remove(&self, pid: u32) -> Option<LiveProcess> {
        self.processes.lock().remove(&pid).map(|(p, _)| p)
    }
}

impl ProcessProbe for MemoryProbe {
    fn inspect(&self, pid: u32) -> Option<LiveProcess> {
        self.processes.lock().get(&pid).map(|(p, _)| p.clone())
    }

    fn processes(&self) -> Vec<LiveProcess> {
        self.processes
            .lock()
            .values()
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn sample(&self, pid: u32) -> ResourceSample {
        self.processes
            .lock()
            .get(&pid)
            .map(|(_, s)| s.clone())
            .unwrap_or_default()
    }
}
