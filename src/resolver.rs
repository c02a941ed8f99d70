//! Finding the worker behind a launcher.
//!
//! Instances are started through a shell, and the shell is not the process we want to
//! supervise: depending on the shell and the start command it either replaces itself with
//! the worker (exec), or starts the worker (possibly via a wrapper script) as a descendant.

use crate::configuration::deadline_after;
use crate::probe::{LiveProcess, ProcessProbe};
use slog_scope::debug;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// How many generations below the launcher the worker may live.
const MAX_DEPTH: usize = 4;

pub struct ChildResolver<'a> {
    probe: &'a dyn ProcessProbe,
    poll_interval: Duration,
    settle: Duration,
}

impl<'a> ChildResolver<'a> {
    pub fn new(probe: &'a dyn ProcessProbe, poll_interval: Duration, settle: Duration) -> Self {
        ChildResolver {
            probe,
            poll_interval,
            settle,
        }
    }

    /// Looks for the worker in the current process table, once.
    pub fn find_worker(&self, launcher: u32, executable: &str) -> Option<LiveProcess> {
        let this = self.probe.inspect(launcher)?;
        if this.matches_executable(executable) {
            return Some(this);
        }
        let mut generation = vec![launcher];
        for _ in 0..MAX_DEPTH {
            if let Some(worker) = generation
                .iter()
                .find_map(|&p| self.probe.find_child_by_executable_name(p, executable))
            {
                return Some(worker);
            }
            generation = generation
                .iter()
                .flat_map(|&p| self.probe.children_of(p))
                .map(|child| child.pid)
                .collect();
            if generation.is_empty() {
                break;
            }
        }
        None
    }

    /// Polls for the worker until the settle timeout runs out. Gives up early if the
    /// launcher is gone, since its descendants can't be found anymore.
    pub fn resolve(&self, launcher: u32, executable: &str) -> Option<LiveProcess> {
        let deadline = deadline_after(self.settle);
        loop {
            if let Some(worker) = self.find_worker(launcher, executable) {
                debug!("resolved worker"; "launcher" => launcher, "worker" => worker.pid);
                return Some(worker);
            }
            if !self.probe.exists(launcher) {
                debug!("launcher is gone"; "launcher" => launcher);
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            sleep(self.poll_interval.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MemoryProbe;

    fn process(pid: u32, parent: u32, name: &str) -> LiveProcess {
        LiveProcess {
            pid,
            parent,
            comm: name.to_string(),
            executable: Some(name.to_string()),
            start_ticks: pid as u64,
        }
    }

    fn resolver(probe: &MemoryProbe) -> ChildResolver<'_> {
        ChildResolver::new(probe, Duration::from_millis(5), Duration::from_millis(50))
    }

    #[test]
    fn direct_child() {
        let probe = MemoryProbe::new();
        probe.insert(process(10, 1, "sh"));
        probe.insert(process(11, 10, "java"));
        probe.insert(process(12, 1, "java"));
        assert_eq!(resolver(&probe).resolve(10, "java").map(|p| p.pid), Some(11));
    }

    #[test]
    fn launcher_exec_ed_the_worker() {
        let probe = MemoryProbe::new();
        probe.insert(process(10, 1, "java"));
        assert_eq!(resolver(&probe).resolve(10, "java").map(|p| p.pid), Some(10));
    }

    #[test]
    fn through_a_wrapper_script() {
        let probe = MemoryProbe::new();
        probe.insert(process(10, 1, "sh"));
        probe.insert(process(11, 10, "run.sh"));
        probe.insert(process(12, 11, "java"));
        probe.insert(process(13, 12, "java-helper"));
        assert_eq!(resolver(&probe).resolve(10, "java").map(|p| p.pid), Some(12));
    }

    #[test]
    fn tells_apart_binaries_with_the_same_truncated_name() {
        let probe = MemoryProbe::new();
        probe.insert(process(10, 1, "sh"));
        for (pid, exe) in &[(11, "minecraft_server_b"), (12, "minecraft_server_a")] {
            probe.insert(LiveProcess {
                comm: "minecraft_serve".to_string(),
                ..process(*pid, 10, exe)
            });
        }
        assert_eq!(
            resolver(&probe).resolve(10, "minecraft_server_a").map(|p| p.pid),
            Some(12)
        );
    }

    #[test]
    fn no_matching_child_gives_up_in_time() {
        let probe = MemoryProbe::new();
        probe.insert(process(10, 1, "sh"));
        probe.insert(process(11, 10, "python"));
        let start = Instant::now();
        assert_eq!(resolver(&probe).resolve(10, "java"), None);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    }

    #[test]
    fn vanished_launcher_gives_up_early() {
        let probe = MemoryProbe::new();
        let resolver =
            ChildResolver::new(&probe, Duration::from_millis(5), Duration::from_secs(30));
        let start = Instant::now();
        assert_eq!(resolver.resolve(10, "java"), None);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn unbounded_settle_time() {
        let probe = MemoryProbe::new();
        probe.insert(process(10, 1, "sh"));
        probe.insert(process(11, 10, "java"));
        let resolver = ChildResolver::new(&probe, Duration::from_millis(5), Duration::MAX);
        assert_eq!(resolver.resolve(10, "java").map(|p| p.pid), Some(11));
        assert_eq!(resolver.resolve(12, "java"), None);
    }

    #[test]
    fn does_not_walk_forever() {
        let probe = MemoryProbe::new();
        probe.insert(process(10, 1, "sh"));
        for pid in 11..20 {
            probe.insert(process(pid, pid - 1, "sh"));
        }
        probe.insert(process(20, 19, "java"));
        assert_eq!(resolver(&probe).find_worker(10, "java"), None);
    }
}
