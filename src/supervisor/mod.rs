//! Process supervision.
//!
//! Each configured service runs as a child process with its own restart
//! policy. State lives in [`ProcessState`] and is only touched from the
//! [`Supervisor`] event loop; everyone else talks to it through a
//! [`SupervisorHandle`].

mod launcher;
mod metrics;
mod runtime;
mod spec;
mod state;
#[cfg(test)]
pub(crate) mod testing;

pub use launcher::{ChildHandle, CommandLauncher, Launched, Launcher};
pub use runtime::{
    ProcessSnapshot, Supervisor, SupervisorExit, SupervisorHandle, SupervisorSnapshot,
};
pub use spec::{ServiceSpec, ServiceTable};
pub use state::{ExitDecision, ExitOutcome, ProcessState, ProcessStatus};
