//! Error types for the bootstrap core.
//!
//! Each subsystem has its own enum; [`GateError`] is what the entrypoint
//! turns into a process exit code.

use std::time::Duration;

use crate::supervisor::ProcessStatus;

/// Exit code for an unusable configuration (EX_CONFIG).
pub const EXIT_CONFIG: i32 = 78;
/// Exit code when the datastore never became reachable (EX_UNAVAILABLE).
pub const EXIT_UNAVAILABLE: i32 = 69;
/// Exit code when a supervised process was fatally stopped (EX_SOFTWARE).
pub const EXIT_FATAL_PROCESS: i32 = 70;

/// Failure of a single readiness attempt, or of the target itself.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connection target is not set")]
    MissingTarget,
    #[error("invalid connection target: {0}")]
    InvalidTarget(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("datastore error: {0}")]
    Datastore(#[from] sqlx::Error),
}

/// Permanent readiness failure; the bootstrap must abort.
#[derive(Debug, thiserror::Error)]
pub enum ProbeFailure {
    #[error("no usable connection target: {0}")]
    Target(#[source] ProbeError),
    #[error("datastore unreachable after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: ProbeError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown process: {0}")]
    UnknownProcess(String),
    #[error("process {0} is defined more than once")]
    DuplicateProcess(String),
    #[error("cannot {action} process {name} while it is {status}")]
    InvalidTransition {
        name: String,
        status: ProcessStatus,
        action: &'static str,
    },
    #[error("failed to launch {name}: {source}")]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: String,
        #[source]
        source: nix::errno::Errno,
    },
    #[error("supervisor is not running")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    NotReady(#[from] ProbeFailure),
    #[error("process {0} is fatally stopped")]
    FatalProcess(String),
}

impl GateError {
    pub fn exit_code(&self) -> i32 {
        match self {
            GateError::Config(_) => EXIT_CONFIG,
            GateError::NotReady(_) => EXIT_UNAVAILABLE,
            GateError::FatalProcess(_) => EXIT_FATAL_PROCESS,
        }
    }
}

impl From<Box<pingora_error::Error>> for GateError {
    fn from(err: Box<pingora_error::Error>) -> Self {
        GateError::Config(err.to_string())
    }
}
