//! Persisted beliefs about which process is an instance's worker.
//!
//! A record only ever says "this is the process we started last"; it says nothing about
//! whether that process is still alive, or whether its process ID has since been reused by
//! something else. Callers verify records against the process table on every use.

use crate::probe::LiveProcess;
use parking_lot::Mutex;
use serde::Serialize;
use slog_scope::warn;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// The identity of a supervised worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityRecord {
    pub pid: u32,

    /// When the process started, in clock ticks since boot.
    pub start_ticks: Option<u64>,

    /// The executable name the worker was resolved by.
    pub executable: Option<String>,
}

impl IdentityRecord {
    /// A record carrying only a process ID, with nothing to corroborate it.
    pub fn bare(pid: u32) -> Self {
        IdentityRecord {
            pid,
            start_ticks: None,
            executable: None,
        }
    }

    pub fn for_process(process: &LiveProcess, executable: &str) -> Self {
        IdentityRecord {
            pid: process.pid,
            start_ticks: Some(process.start_ticks),
            executable: Some(executable.to_string()),
        }
    }

    /// Returns whether `process` is the process this record was written for, as opposed to
    /// an unrelated process that reused the ID.
    pub fn corroborated_by(&self, process: &LiveProcess) -> bool {
        if process.pid != self.pid {
            return false;
        }
        if let Some(ticks) = self.start_ticks {
            if ticks != process.start_ticks {
                return false;
            }
        }
        match &self.executable {
            Some(exe) => process.matches_executable(exe),
            None => true,
        }
    }

    fn encode(&self) -> String {
        match (&self.start_ticks, &self.executable) {
            (Some(ticks), Some(exe)) => format!("{}\n{} {}\n", self.pid, ticks, exe),
            _ => format!("{}\n", self.pid),
        }
    }

    fn decode(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let pid: u32 = lines.next()?.trim().parse().ok()?;
        if pid == 0 {
            return None;
        }
        let mut record = IdentityRecord::bare(pid);
        if let Some(line) = lines.next().filter(|l| !l.trim().is_empty()) {
            let mut fields = line.splitn(2, ' ');
            record.start_ticks = Some(fields.next()?.parse().ok()?);
            record.executable = Some(fields.next().filter(|e| !e.is_empty())?.to_string());
        }
        Some(record)
    }
}

/// Storage for one identity record per instance.
///
/// Operations on different names never interfere with each other; operations on the same
/// name must be serialized by the caller.
pub trait IdentityStore: Send + Sync {
    /// Replaces the record for `name`. Either the old or the new record survives a crash,
    /// never a mix of both.
    fn write(&self, name: &str, record: &IdentityRecord) -> io::Result<()>;

    /// Returns the record for `name`. An unreadable record is reported as absent.
    fn read(&self, name: &str) -> io::Result<Option<IdentityRecord>>;

    /// Removes the record for `name`, if any.
    fn clear(&self, name: &str) -> io::Result<()>;
}

impl<T: IdentityStore + ?Sized> IdentityStore for Arc<T> {
    fn write(&self, name: &str, record: &IdentityRecord) -> io::Result<()> {
        (**self).write(name, record)
    }

    fn read(&self, name: &str) -> io::Result<Option<IdentityRecord>> {
        (**self).read(name)
    }

    fn clear(&self, name: &str) -> io::Result<()> {
        (**self).clear(name)
    }
}

/// Keeps each record in `<dir>/<name>.pid`.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    dir: PathBuf,
}

impl FileIdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileIdentityStore { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.pid", name))
    }
}

impl IdentityStore for FileIdentityStore {
    fn write(&self, name: &str, record: &IdentityRecord) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!(".{}.pid.tmp", name));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(record.encode().as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.path(name))
    }

    fn read(&self, name: &str) -> io::Result<Option<IdentityRecord>> {
        let path = self.path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("identity record is not text, ignoring it"; "path" => ?path);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let record = IdentityRecord::decode(&contents);
        if record.is_none() {
            warn!("identity record is malformed, ignoring it"; "path" => ?path, "contents" => &contents);
        }
        Ok(record)
    }

    fn clear(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.path(name)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            res => res,
        }
    }
}

/// Keeps records in memory only; for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    records: Mutex<HashMap<String, IdentityRecord>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Default::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn write(&self, name: &str, record: &IdentityRecord) -> io::Result<()> {
        self.records.lock().insert(name.to_string(), record.clone());
        Ok(())
    }

    fn read(&self, name: &str) -> io::Result<Option<IdentityRecord>> {
        Ok(self.records.lock().get(name).cloned())
    }

    fn clear(&self, name: &str) -> io::Result<()> {
        self.records.lock().remove(name);
        Ok(())
    }
}
