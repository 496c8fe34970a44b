use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsFd;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use crate::config::{LogSink, StopSignal};
use crate::error::SupervisorError;

use super::spec::ServiceSpec;
use super::state::ExitOutcome;

/// Upper bound between exit checks when no SIGCHLD arrives.
const REAP_POLL: Duration = Duration::from_millis(500);

/// A spawned child and whether its exit status has been collected.
///
/// Once a child is reaped the kernel may hand its pid to an unrelated
/// process. Reaping and signalling both take the same lock, so a signal
/// only ever goes to a pid that still belongs to the child.
#[derive(Clone, Debug)]
pub struct ChildHandle {
    pid: u32,
    reaped: Arc<Mutex<bool>>,
}

impl ChildHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            reaped: Arc::new(Mutex::new(false)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_reaped(&self) -> bool {
        *self.reaped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_reaped(&self) {
        *self.reaped.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Runs `f` with the pid unless the child has been reaped.
    pub fn with_live_pid<R>(&self, f: impl FnOnce(u32) -> R) -> Option<R> {
        let reaped = self.reaped.lock().unwrap_or_else(PoisonError::into_inner);
        (!*reaped).then(|| f(self.pid))
    }

    /// Calls `try_wait` under the lock and records a collected status.
    fn reap_with<T>(
        &self,
        try_wait: impl FnOnce() -> io::Result<Option<T>>,
    ) -> io::Result<Option<T>> {
        let mut reaped = self.reaped.lock().unwrap_or_else(PoisonError::into_inner);
        let result = try_wait();
        if !matches!(result, Ok(None)) {
            *reaped = true;
        }
        result
    }
}

/// A spawned child and a future resolving once it has exited and been reaped.
pub struct Launched {
    pub child: ChildHandle,
    pub exit: BoxFuture<'static, ExitOutcome>,
}

/// Creates and signals operating system processes.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, spec: &ServiceSpec) -> Result<Launched, SupervisorError>;

    /// Delivers `signal` to the child, or to its process group when `group`
    /// is set. A child that is already gone is not an error.
    fn signal(
        &self,
        child: &ChildHandle,
        signal: StopSignal,
        group: bool,
    ) -> Result<(), SupervisorError>;

    fn kill(&self, child: &ChildHandle, group: bool) -> Result<(), SupervisorError> {
        self.signal(child, StopSignal::KILL, group)
    }
}

/// Launches services as child processes of the supervisor.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(&self, spec: &ServiceSpec) -> Result<Launched, SupervisorError> {
        let launch_error = |source: io::Error| SupervisorError::Launch {
            name: spec.name.clone(),
            source,
        };

        let (program, args) = spec.command.split_first().ok_or_else(|| {
            launch_error(io::Error::new(io::ErrorKind::InvalidInput, "empty command"))
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(directory) = &spec.directory {
            command.current_dir(directory);
        }
        if spec.stop_as_group {
            command.process_group(0);
        }

        let (stdout, stderr) = open_sinks(spec).map_err(launch_error)?;
        command.stdout(stdout).stderr(stderr);

        let child = command.spawn().map_err(launch_error)?;
        let pid = child.id().ok_or_else(|| {
            launch_error(io::Error::new(
                io::ErrorKind::Other,
                "child was reaped before its pid was read",
            ))
        })?;
        debug!("Spawned {} as pid {pid}: {:?}", spec.name, spec.command);

        let handle = ChildHandle::new(pid);
        let reaper = handle.clone();
        let name = spec.name.clone();
        let exit = async move {
            match reap(child, &reaper).await {
                Ok(status) => ExitOutcome::from(status),
                Err(e) => {
                    warn!("Lost exit status of {name} (pid {pid}): {e}");
                    ExitOutcome::lost()
                }
            }
        }
        .boxed();

        Ok(Launched {
            child: handle,
            exit,
        })
    }

    fn signal(
        &self,
        child: &ChildHandle,
        signal: StopSignal,
        group: bool,
    ) -> Result<(), SupervisorError> {
        let sent = child.with_live_pid(|pid| {
            let target = Pid::from_raw(pid as i32);
            let sig = to_nix_signal(signal);
            if group {
                killpg(target, sig)
            } else {
                kill(target, sig)
            }
        });

        match sent {
            None => {
                debug!("pid {} already reaped, not sending {signal}", child.pid());
                Ok(())
            }
            Some(Ok(())) | Some(Err(Errno::ESRCH)) => Ok(()),
            Some(Err(source)) => Err(SupervisorError::Signal {
                pid: child.pid(),
                signal: signal.to_string(),
                source,
            }),
        }
    }
}

/// Waits for `child` to exit. The status is collected through `handle`, so
/// no signal can be in flight to the pid while it is released.
async fn reap(mut child: Child, handle: &ChildHandle) -> io::Result<ExitStatus> {
    let mut sigchld = match unix_signal(SignalKind::child()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("SIGCHLD unavailable, polling pid {}: {e}", handle.pid());
            None
        }
    };

    loop {
        if let Some(status) = handle.reap_with(|| child.try_wait())? {
            return Ok(status);
        }
        match sigchld.as_mut() {
            Some(stream) => {
                let _ = tokio::time::timeout(REAP_POLL, stream.recv()).await;
            }
            None => tokio::time::sleep(REAP_POLL).await,
        }
    }
}

fn to_nix_signal(signal: StopSignal) -> Signal {
    match signal {
        StopSignal::TERM => Signal::SIGTERM,
        StopSignal::INT => Signal::SIGINT,
        StopSignal::QUIT => Signal::SIGQUIT,
        StopSignal::HUP => Signal::SIGHUP,
        StopSignal::KILL => Signal::SIGKILL,
        StopSignal::USR1 => Signal::SIGUSR1,
        StopSignal::USR2 => Signal::SIGUSR2,
    }
}

fn open_sinks(spec: &ServiceSpec) -> io::Result<(Stdio, Stdio)> {
    if !spec.redirect_stderr {
        return Ok((sink_stdio(&spec.stdout)?, sink_stdio(&spec.stderr)?));
    }

    match &spec.stdout {
        LogSink::Inherit => {
            let stdout = io::stdout().as_fd().try_clone_to_owned()?;
            Ok((Stdio::inherit(), Stdio::from(stdout)))
        }
        LogSink::Null => Ok((Stdio::null(), Stdio::null())),
        LogSink::File(path) => {
            let file = open_append(path)?;
            Ok((Stdio::from(file.try_clone()?), Stdio::from(file)))
        }
    }
}

fn sink_stdio(sink: &LogSink) -> io::Result<Stdio> {
    Ok(match sink {
        LogSink::Inherit => Stdio::inherit(),
        LogSink::Null => Stdio::null(),
        LogSink::File(path) => Stdio::from(open_append(path)?),
    })
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
