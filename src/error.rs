use std::io;
use thiserror::Error;

/// Everything that can go wrong in a supervision operation.
///
/// An instance that simply isn't running is not an error; see
/// [`StopOutcome::NotRunning`](crate::supervisor::StopOutcome).
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("no instance named {0:?}")]
    InstanceNotFound(String),

    #[error("configuration of instance {instance:?} is invalid: {reason}")]
    ConfigurationInvalid { instance: String, reason: String },

    #[error("could not spawn the launcher for instance {instance:?}")]
    SpawnFailed {
        instance: String,
        #[source]
        source: io::Error,
    },

    #[error("launcher for instance {instance:?} exited immediately (exit code {code:?})")]
    ImmediateExit { instance: String, code: Option<i32> },

    #[error("could not find a {worker_executable:?} process started by launcher {launcher} of instance {instance:?}")]
    ResolutionFailed {
        instance: String,
        launcher: u32,
        worker_executable: String,
    },

    #[error("could not terminate worker {pid} of instance {instance:?}")]
    TerminationFailed {
        instance: String,
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("instance {instance:?} is already running (pid {pid})")]
    AlreadyRunning { instance: String, pid: u32 },

    #[error("worker {pid} of instance {instance:?} did not exit in time")]
    ExitTimeout { instance: String, pid: u32 },

    #[error("another operation on instance {0:?} is in progress, try again once it is done")]
    InstanceBusy(String),

    #[error("could not access the bookkeeping of instance {instance:?}")]
    Storage {
        instance: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    /// A short, stable name for the error kind; used in structured output.
    pub fn kind(&self) -> &'static str {
        use SupervisorError::*;
        match self {
            InstanceNotFound(_) => "instance_not_found",
            ConfigurationInvalid { .. } => "configuration_invalid",
            SpawnFailed { .. } => "spawn_failed",
            ImmediateExit { .. } => "immediate_exit",
            ResolutionFailed { .. } => "resolution_failed",
            TerminationFailed { .. } => "termination_failed",
            AlreadyRunning { .. } => "already_running",
            ExitTimeout { .. } => "exit_timeout",
            InstanceBusy(_) => "instance_busy",
            Storage { .. } => "storage",
        }
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
