use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;

use serde::Serialize;

use crate::config::AutoRestart;

use super::spec::ServiceSpec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Exited,
    FatalStopped,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 6] = [
        ProcessStatus::Stopped,
        ProcessStatus::Starting,
        ProcessStatus::Running,
        ProcessStatus::Stopping,
        ProcessStatus::Exited,
        ProcessStatus::FatalStopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Exited => "exited",
            ProcessStatus::FatalStopped => "fatal_stopped",
        }
    }

    /// A live child exists for this process.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Stopping
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a child terminated. Both fields are `None` when the exit status was lost.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn lost() -> Self {
        Self::default()
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// What the event loop must do after a state transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitDecision {
    /// Launch a new instance now.
    Restart,
    /// Settled in `Stopped`.
    Stopped,
    /// Settled in `FatalStopped`.
    Fatal,
    /// Event belonged to an earlier instance.
    Ignored,
}

/// Mutable run state of one supervised process.
///
/// Every launch bumps `generation`; timers and exit watchers carry the
/// generation they were created for so late events from a previous
/// instance are discarded.
#[derive(Debug)]
pub struct ProcessState {
    spec: Arc<ServiceSpec>,
    status: ProcessStatus,
    pid: Option<u32>,
    restarts: u32,
    last_exit: Option<ExitOutcome>,
    generation: u64,
}

impl ProcessState {
    pub fn new(spec: Arc<ServiceSpec>) -> Self {
        Self {
            spec,
            status: ProcessStatus::Stopped,
            pid: None,
            restarts: 0,
            last_exit: None,
            generation: 0,
        }
    }

    pub fn spec(&self) -> &Arc<ServiceSpec> {
        &self.spec
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn last_exit(&self) -> Option<ExitOutcome> {
        self.last_exit
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self.status,
            ProcessStatus::Stopped | ProcessStatus::FatalStopped | ProcessStatus::Exited
        )
    }

    /// A child was spawned. Returns the generation of the new instance.
    pub fn mark_starting(&mut self, pid: u32) -> u64 {
        debug_assert!(self.can_start(), "start from {}", self.status);
        self.generation += 1;
        self.status = ProcessStatus::Starting;
        self.pid = Some(pid);
        self.generation
    }

    /// The start grace period of `generation` elapsed with the child alive.
    pub fn mark_running(&mut self, generation: u64) -> bool {
        if self.status != ProcessStatus::Starting || self.generation != generation {
            return false;
        }
        self.status = ProcessStatus::Running;
        true
    }

    /// Spawning failed outright; treated like an exit during start.
    pub fn launch_failed(&mut self) -> ExitDecision {
        self.generation += 1;
        self.status = ProcessStatus::Exited;
        self.pid = None;
        self.charge_restart()
    }

    /// Moves an active process to `Stopping`. Returns the pid to signal.
    pub fn mark_stopping(&mut self) -> Option<u32> {
        match self.status {
            ProcessStatus::Starting | ProcessStatus::Running => {
                self.status = ProcessStatus::Stopping;
                self.pid
            }
            _ => None,
        }
    }

    pub fn mark_exited(&mut self, generation: u64, outcome: ExitOutcome) -> ExitDecision {
        if generation != self.generation || !self.status.is_active() {
            return ExitDecision::Ignored;
        }

        let previous = self.status;
        self.status = ProcessStatus::Exited;
        self.pid = None;
        self.last_exit = Some(outcome);

        match previous {
            ProcessStatus::Stopping => {
                self.status = ProcessStatus::Stopped;
                ExitDecision::Stopped
            }
            // died before the grace period: always a failed start
            ProcessStatus::Starting => self.charge_restart(),
            _ => {
                let expected = self.spec.is_expected_exit(&outcome);
                let restart = match self.spec.autorestart {
                    AutoRestart::Always => true,
                    AutoRestart::Never => false,
                    AutoRestart::Unexpected => !expected,
                };

                if restart {
                    self.charge_restart()
                } else if expected {
                    self.status = ProcessStatus::Stopped;
                    ExitDecision::Stopped
                } else {
                    self.status = ProcessStatus::FatalStopped;
                    ExitDecision::Fatal
                }
            }
        }
    }

    /// `reset_after` elapsed for `generation` while still running.
    pub fn uptime_reached(&mut self, generation: u64) -> bool {
        if self.status != ProcessStatus::Running || self.generation != generation {
            return false;
        }
        let had_restarts = self.restarts > 0;
        self.restarts = 0;
        had_restarts
    }

    pub fn reset_restarts(&mut self) {
        self.restarts = 0;
    }

    fn charge_restart(&mut self) -> ExitDecision {
        self.restarts += 1;
        if self.restarts < self.spec.start_retries {
            ExitDecision::Restart
        } else {
            self.status = ProcessStatus::FatalStopped;
            ExitDecision::Fatal
        }
    }
}
