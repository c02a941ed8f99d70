//! A supervisor for game server instances on a single host.
//!
//! Each instance is a directory under the instance root holding a `config.json` with the
//! command that starts the server. Starting an instance runs that command through a shell
//! (the launcher), finds the long-lived worker process the launcher started, and records
//! the worker's identity so that later invocations (of this or another supervisor process)
//! can check on it and stop it.
//!
//! There's no daemon: every operation re-derives the state of an instance from the
//! identity records and the process table.

#[cfg(not(target_os = "linux"))]
compile_error!("serverkeeper reads the process table from /proc, and only works on linux.");

pub mod configuration;
pub mod control;
pub mod error;
pub mod identity;
pub mod instances;
pub mod launch;
pub mod lock;
pub mod logging;
pub mod probe;
pub mod resolver;
pub mod scaffold;
pub mod supervisor;

pub use configuration::Settings;
pub use error::{Result, SupervisorError};
pub use supervisor::{
    InstanceStatus, ListEntry, Restarted, Started, StatusReport, StopOutcome, Supervisor,
};
