//! Per-instance mutual exclusion.
//!
//! Every operation that acts on an instance holds that instance's lock until it is done, so
//! that two overlapping commands can't both decide the instance is stopped and start it
//! twice. The lock is an `flock(2)` on a file under the instance root, which makes it work
//! across threads as well as across separate supervisor processes. The kernel drops it when
//! the holder exits, however it exits.

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use slog_scope::debug;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

#[derive(Debug)]
pub struct InstanceLock {
    // Closing the file releases the lock.
    _file: File,
}

impl InstanceLock {
    /// Takes the lock for `name` in `dir`, without waiting. Returns `None` if somebody
    /// else holds it.
    pub fn try_acquire(dir: &Path, name: &str) -> io::Result<Option<InstanceLock>> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.lock", name));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                debug!("locked instance"; "lock" => ?path);
                Ok(Some(InstanceLock { _file: file }))
            }
            Err(Errno::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}
