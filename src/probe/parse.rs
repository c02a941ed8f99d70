//! Parsers for the files under `/proc/<pid>/`.

/// The fields of `/proc/<pid>/stat` we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Stat {
    pub comm: String,
    pub state: char,
    pub ppid: u32,
    pub user_ticks: u64,
    pub system_ticks: u64,
    pub start_ticks: u64,
}

impl Stat {
    /// Zombies and dead tasks have exited; they only linger in the table until reaped.
    pub fn is_live(&self) -> bool {
        self.state != 'Z' && self.state != 'X' && self.state != 'x'
    }
}

/// Parses `/proc/<pid>/stat`.
///
/// Format: pid (comm) state ppid pgrp session tty_nr tpgid flags
///         minflt cminflt majflt cmajflt utime stime cutime cstime
///         priority nice num_threads itrealvalue starttime ...
///
/// The comm field can contain spaces and parentheses, so it extends to the last `)`.
pub(super) fn stat(content: &str) -> Option<Stat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close < open {
        return None;
    }
    let comm = content[open + 1..close].to_string();
    let fields: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
    if fields.len() < 20 {
        return None;
    }
    Some(Stat {
        comm,
        state: fields[0].chars().next()?,
        ppid: fields[1].parse().ok()?,
        user_ticks: fields[11].parse().ok()?,
        system_ticks: fields[12].parse().ok()?,
        start_ticks: fields[19].parse().ok()?,
    })
}

/// Extracts the resident set size from `/proc/<pid>/status`, in bytes.
pub(super) fn resident_bytes(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut parts = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}
