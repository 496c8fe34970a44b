use std::time::Duration;

use async_trait::async_trait;
use log::{error, info};
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};

use crate::error::GateError;
use crate::logging::LogFlusher;
use crate::supervisor::{Launcher, Supervisor, SupervisorExit};

/// Runs the process supervisor inside the server, so it shares the
/// server's signal handling and graceful shutdown.
pub struct SupervisorService<L> {
    supervisor: Option<Supervisor<L>>,
    log_flusher: Option<LogFlusher>,
}

const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

impl<L: Launcher> SupervisorService<L> {
    pub fn new(supervisor: Supervisor<L>) -> Self {
        Self {
            supervisor: Some(supervisor),
            log_flusher: None,
        }
    }

    /// File sink to drain before a fatal exit.
    pub fn with_log_flusher(mut self, log_flusher: Option<LogFlusher>) -> Self {
        self.log_flusher = log_flusher;
        self
    }

    async fn run(&mut self, shutdown: ShutdownWatch) -> Option<GateError> {
        let supervisor = self.supervisor.take()?;
        match supervisor.run(shutdown).await {
            SupervisorExit::Shutdown => {
                info!("Supervisor stopped");
                None
            }
            SupervisorExit::Fatal(name) => {
                let err = GateError::FatalProcess(name);
                error!("{err}, exiting");
                if let Some(flusher) = &self.log_flusher {
                    if !flusher.flush(LOG_FLUSH_TIMEOUT).await {
                        eprintln!("Log file was not flushed before exit");
                    }
                }
                Some(err)
            }
        }
    }
}

#[async_trait]
impl<L: Launcher> Service for SupervisorService<L> {
    async fn start_service(&mut self, _fds: Option<ListenFds>, shutdown: ShutdownWatch) {
        if let Some(err) = self.run(shutdown).await {
            std::process::exit(err.exit_code());
        }
    }

    fn name(&self) -> &'static str {
        "process supervisor"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}
