use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::SupervisorError;

use super::launcher::{ChildHandle, Launcher};
use super::metrics;
use super::spec::ServiceTable;
use super::state::{ExitDecision, ExitOutcome, ProcessState, ProcessStatus};

/// Extra time allowed after the longest stop timeout for SIGKILL to land.
const KILL_GRACE: Duration = Duration::from_secs(5);
const COMMAND_BUFFER: usize = 32;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessSnapshot {
    pub name: String,
    pub priority: i32,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub last_exit: Option<ExitOutcome>,
}

impl From<&ProcessState> for ProcessSnapshot {
    fn from(state: &ProcessState) -> Self {
        Self {
            name: state.spec().name.clone(),
            priority: state.spec().priority,
            status: state.status(),
            pid: state.pid(),
            restarts: state.restarts(),
            last_exit: state.last_exit(),
        }
    }
}

/// Point-in-time view of every process, published after each transition.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SupervisorSnapshot {
    pub processes: Vec<ProcessSnapshot>,
    /// Set while any process is fatally stopped.
    pub fault: bool,
}

impl SupervisorSnapshot {
    pub fn process(&self, name: &str) -> Option<&ProcessSnapshot> {
        self.processes.iter().find(|p| p.name == name)
    }

    pub fn fatal(&self) -> Vec<&str> {
        self.processes
            .iter()
            .filter(|p| p.status == ProcessStatus::FatalStopped)
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn is_healthy(&self) -> bool {
        !self.fault
    }
}

type Reply = oneshot::Sender<Result<ProcessSnapshot, SupervisorError>>;

enum Command {
    Start { name: String, reply: Reply },
    Stop { name: String, reply: Reply },
    Restart { name: String, reply: Reply },
    Shutdown { reply: oneshot::Sender<()> },
}

enum Event {
    Exited {
        index: usize,
        generation: u64,
        outcome: ExitOutcome,
    },
    GraceElapsed { index: usize, generation: u64 },
    StopDeadline { index: usize, generation: u64 },
    UptimeReached { index: usize, generation: u64 },
}

/// Why [`Supervisor::run`] returned.
#[derive(Debug, PartialEq, Eq)]
pub enum SupervisorExit {
    Shutdown,
    /// A process became fatally stopped and `exit_on_fatal` is set.
    Fatal(String),
}

/// Cloneable access to a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    snapshot: Arc<ArcSwap<SupervisorSnapshot>>,
}

impl SupervisorHandle {
    pub fn snapshot(&self) -> Arc<SupervisorSnapshot> {
        self.snapshot.load_full()
    }

    pub async fn start(&self, name: &str) -> Result<ProcessSnapshot, SupervisorError> {
        self.request(|reply| Command::Start {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Returns once the stop signal is sent, not when the process is gone.
    pub async fn stop(&self, name: &str) -> Result<ProcessSnapshot, SupervisorError> {
        self.request(|reply| Command::Stop {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn restart(&self, name: &str) -> Result<ProcessSnapshot, SupervisorError> {
        self.request(|reply| Command::Restart {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Stops every process and waits until the supervisor has finished.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    async fn request(
        &self,
        command: impl FnOnce(Reply) -> Command,
    ) -> Result<ProcessSnapshot, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)?
    }
}

/// Owns every [`ProcessState`] and is the only writer of them.
///
/// Child exits, timers and control commands all arrive as messages on one
/// task, so transitions never race.
pub struct Supervisor<L> {
    table: Arc<ServiceTable>,
    states: Vec<ProcessState>,
    restart_pending: Vec<bool>,
    /// Most recently launched child of each process.
    children: Vec<Option<ChildHandle>>,
    launcher: L,
    exit_on_fatal: bool,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::Receiver<Command>,
    snapshot: Arc<ArcSwap<SupervisorSnapshot>>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(table: Arc<ServiceTable>, launcher: L) -> (Self, SupervisorHandle) {
        let states: Vec<ProcessState> = table
            .iter()
            .map(|spec| ProcessState::new(spec.clone()))
            .collect();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let snapshot = Arc::new(ArcSwap::from_pointee(SupervisorSnapshot {
            processes: states.iter().map(ProcessSnapshot::from).collect(),
            fault: false,
        }));

        let supervisor = Self {
            restart_pending: vec![false; states.len()],
            children: vec![None; states.len()],
            table,
            states,
            launcher,
            exit_on_fatal: false,
            events_tx,
            events,
            commands,
            snapshot: snapshot.clone(),
        };
        let handle = SupervisorHandle {
            commands: commands_tx,
            snapshot,
        };
        (supervisor, handle)
    }

    pub fn with_exit_on_fatal(mut self, exit_on_fatal: bool) -> Self {
        self.exit_on_fatal = exit_on_fatal;
        self
    }

    /// Starts every process, supervises until shutdown, then stops them all.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SupervisorExit {
        self.start_all();

        let mut shutdown_reply = None;
        let exit = loop {
            if let Some(name) = self.fatal_exit() {
                break SupervisorExit::Fatal(name);
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, stopping all processes");
                        break SupervisorExit::Shutdown;
                    }
                }
                Some(command) = self.commands.recv() => {
                    if let Command::Shutdown { reply } = command {
                        shutdown_reply = Some(reply);
                        break SupervisorExit::Shutdown;
                    }
                    self.handle_command(command);
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event);
                    self.publish();
                }
            }
        };

        self.stop_all().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        exit
    }

    fn start_all(&mut self) {
        for index in self.table.start_order() {
            let state = &self.states[index];
            info!(
                "Starting {} (priority {})",
                state.spec().name,
                state.spec().priority
            );
            self.launch(index);
        }
        self.publish();
    }

    async fn stop_all(&mut self) {
        for index in 0..self.states.len() {
            self.restart_pending[index] = false;
            self.begin_stop(index);
        }
        self.publish();

        let deadline = self.table.max_stop_timeout() + KILL_GRACE;
        if tokio::time::timeout(deadline, self.drain_stopping())
            .await
            .is_err()
        {
            warn!("Gave up waiting for processes to exit after {deadline:?}");
        }
        info!("All supervised processes stopped");
    }

    async fn drain_stopping(&mut self) {
        while self.states.iter().any(|s| s.status() == ProcessStatus::Stopping) {
            match self.events.recv().await {
                Some(event) => {
                    self.handle_event(event);
                    self.publish();
                }
                None => break,
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        let (reply, result) = match command {
            Command::Start { name, reply } => (reply, self.start_process(&name)),
            Command::Stop { name, reply } => (reply, self.stop_process(&name)),
            Command::Restart { name, reply } => (reply, self.restart_process(&name)),
            Command::Shutdown { .. } => return,
        };
        self.publish();
        let _ = reply.send(result);
    }

    fn index_of(&self, name: &str) -> Result<usize, SupervisorError> {
        self.table
            .index_of(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))
    }

    fn start_process(&mut self, name: &str) -> Result<ProcessSnapshot, SupervisorError> {
        let index = self.index_of(name)?;
        let state = &mut self.states[index];
        if !state.can_start() {
            return Err(SupervisorError::InvalidTransition {
                name: name.to_string(),
                status: state.status(),
                action: "start",
            });
        }

        info!("Start of {name} requested");
        state.reset_restarts();
        self.launch(index);
        Ok(ProcessSnapshot::from(&self.states[index]))
    }

    fn stop_process(&mut self, name: &str) -> Result<ProcessSnapshot, SupervisorError> {
        let index = self.index_of(name)?;
        info!("Stop of {name} requested");
        self.restart_pending[index] = false;
        self.begin_stop(index);
        Ok(ProcessSnapshot::from(&self.states[index]))
    }

    fn restart_process(&mut self, name: &str) -> Result<ProcessSnapshot, SupervisorError> {
        let index = self.index_of(name)?;
        match self.states[index].status() {
            ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Stopping => {
                info!("Restart of {name} requested");
                self.restart_pending[index] = true;
                self.begin_stop(index);
                Ok(ProcessSnapshot::from(&self.states[index]))
            }
            _ => self.start_process(name),
        }
    }

    /// First fatally stopped process, when that should end the run.
    fn fatal_exit(&self) -> Option<String> {
        if !self.exit_on_fatal {
            return None;
        }
        self.states
            .iter()
            .find(|s| s.status() == ProcessStatus::FatalStopped)
            .map(|s| s.spec().name.clone())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Exited {
                index,
                generation,
                outcome,
            } => self.on_exit(index, generation, outcome),
            Event::GraceElapsed { index, generation } => self.on_running(index, generation),
            Event::StopDeadline { index, generation } => {
                let state = &self.states[index];
                if state.status() == ProcessStatus::Stopping && state.generation() == generation {
                    if let Some(child) = self.children[index].as_ref() {
                        warn!(
                            "{} did not stop within {:?}, killing pid {}",
                            state.spec().name,
                            state.spec().stop_timeout,
                            child.pid()
                        );
                        if let Err(e) = self.launcher.kill(child, state.spec().stop_as_group) {
                            error!("{e}");
                        }
                    }
                }
            }
            Event::UptimeReached { index, generation } => {
                if self.states[index].uptime_reached(generation) {
                    info!(
                        "{} stayed up, restart budget reset",
                        self.states[index].spec().name
                    );
                }
            }
        }
    }

    fn on_exit(&mut self, index: usize, generation: u64, outcome: ExitOutcome) {
        let previous = self.states[index].status();
        let decision = self.states[index].mark_exited(generation, outcome);
        let state = &self.states[index];
        let name = state.spec().name.clone();

        match decision {
            ExitDecision::Ignored => {}
            ExitDecision::Stopped => {
                info!("{name} stopped ({outcome})");
                if std::mem::take(&mut self.restart_pending[index]) {
                    self.launch(index);
                }
            }
            ExitDecision::Restart => {
                let phase = if previous == ProcessStatus::Starting {
                    "failed to start"
                } else {
                    "exited unexpectedly"
                };
                warn!(
                    "{name} {phase} ({outcome}), restarting ({}/{})",
                    state.restarts(),
                    state.spec().start_retries
                );
                metrics::record_restart(&name);
                self.launch(index);
            }
            ExitDecision::Fatal => self.report_fatal(index),
        }
    }

    /// Spawns the process at `index`, retrying immediately while spawn
    /// errors stay within budget.
    fn launch(&mut self, index: usize) {
        loop {
            let spec = self.states[index].spec().clone();
            match self.launcher.launch(&spec) {
                Ok(launched) => {
                    let pid = launched.child.pid();
                    let generation = self.states[index].mark_starting(pid);
                    self.children[index] = Some(launched.child);
                    metrics::record_start(&spec.name);
                    info!("Spawned {} (pid {pid})", spec.name);

                    self.watch_exit(index, generation, launched.exit);
                    if spec.start_grace.is_zero() {
                        self.on_running(index, generation);
                    } else {
                        self.schedule(
                            spec.start_grace,
                            Event::GraceElapsed { index, generation },
                        );
                    }
                    return;
                }
                Err(e) => {
                    error!("{e}");
                    if self.states[index].launch_failed() != ExitDecision::Restart {
                        return self.report_fatal(index);
                    }
                    metrics::record_restart(&spec.name);
                }
            }
        }
    }

    fn on_running(&mut self, index: usize, generation: u64) {
        if !self.states[index].mark_running(generation) {
            return;
        }
        let spec = self.states[index].spec().clone();
        info!(
            "{} entered running state (pid {})",
            spec.name,
            self.states[index].pid().unwrap_or_default()
        );
        if let Some(reset_after) = spec.reset_after {
            self.schedule(reset_after, Event::UptimeReached { index, generation });
        }
    }

    fn begin_stop(&mut self, index: usize) {
        let Some(pid) = self.states[index].mark_stopping() else {
            return;
        };
        let spec = self.states[index].spec().clone();
        info!("Stopping {} (pid {pid}) with {}", spec.name, spec.stop_signal);

        if let Some(child) = self.children[index].as_ref() {
            if let Err(e) = self
                .launcher
                .signal(child, spec.stop_signal, spec.stop_as_group)
            {
                error!("{e}");
            }
        }
        let generation = self.states[index].generation();
        self.schedule(
            spec.stop_timeout,
            Event::StopDeadline { index, generation },
        );
    }

    fn report_fatal(&mut self, index: usize) {
        self.restart_pending[index] = false;
        let state = &self.states[index];
        let name = state.spec().name.clone();
        error!(
            "{name} is fatally stopped ({} restarts, last {})",
            state.restarts(),
            state
                .last_exit()
                .map_or_else(|| "spawn error".to_string(), |o| o.to_string())
        );
        metrics::record_fatal(&name);
    }

    fn watch_exit(&self, index: usize, generation: u64, exit: BoxFuture<'static, ExitOutcome>) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = exit.await;
            let _ = events.send(Event::Exited {
                index,
                generation,
                outcome,
            });
        });
    }

    fn schedule(&self, delay: Duration, event: Event) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    fn publish(&self) {
        let processes: Vec<ProcessSnapshot> =
            self.states.iter().map(ProcessSnapshot::from).collect();
        for process in &processes {
            metrics::record_state(&process.name, process.status);
        }
        let fault = processes
            .iter()
            .any(|p| p.status == ProcessStatus::FatalStopped);
        self.snapshot
            .store(Arc::new(SupervisorSnapshot { processes, fault }));
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::config::StopSignal;
    use crate::supervisor::testing::{wait_for, FakeLauncher};
    use crate::supervisor::ServiceSpec;

    fn spec(name: &str, priority: i32) -> ServiceSpec {
        ServiceSpec {
            priority,
            start_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
            ..ServiceSpec::new(name, ["/bin/true"])
        }
    }

    fn supervisor(
        specs: Vec<ServiceSpec>,
        launcher: FakeLauncher,
    ) -> (Supervisor<FakeLauncher>, SupervisorHandle) {
        let table = Arc::new(ServiceTable::new(specs).unwrap());
        Supervisor::new(table, launcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_order_follows_priority() {
        let launcher = FakeLauncher::default();
        let (supervisor, handle) = supervisor(
            vec![
                spec("router", 30),
                spec("backend", 10),
                spec("frontend", 20),
                spec("worker", 10),
            ],
            launcher.clone(),
        );
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown));

        wait_for(&handle, "backend", ProcessStatus::Running).await;
        // equal priorities were both issued before either reached running
        assert_eq!(
            vec!["backend", "worker", "frontend", "router"],
            launcher.launched()
        );
        for name in ["worker", "frontend", "router"] {
            wait_for(&handle, name, ProcessStatus::Running).await;
        }

        handle.shutdown().await.unwrap();
        assert_eq!(SupervisorExit::Shutdown, task.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashing_start_becomes_fatal_on_third_failure() {
        let _ = env_logger::builder().is_test(true).try_init();
        let launcher = FakeLauncher::default().crash_on_start("backend");
        let (supervisor, handle) = supervisor(
            vec![spec("backend", 10), spec("frontend", 20)],
            launcher.clone(),
        );
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown));

        let backend = wait_for(&handle, "backend", ProcessStatus::FatalStopped).await;
        assert_eq!(3, launcher.launches_of("backend"));
        assert_eq!(3, backend.restarts);
        assert_eq!(Some(ExitOutcome::code(1)), backend.last_exit);

        // siblings keep running
        wait_for(&handle, "frontend", ProcessStatus::Running).await;
        assert_eq!(vec!["backend"], handle.snapshot().fatal());
        assert!(!handle.snapshot().is_healthy());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(3, launcher.launches_of("backend"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_stop_keeps_restart_count() {
        let launcher = FakeLauncher::default();
        let (supervisor, handle) = supervisor(vec![spec("backend", 10)], launcher.clone());
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown));

        wait_for(&handle, "backend", ProcessStatus::Running).await;
        launcher.crash("backend", 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let backend = wait_for(&handle, "backend", ProcessStatus::Running).await;
        assert_eq!(1, backend.restarts);

        handle.stop("backend").await.unwrap();
        let backend = wait_for(&handle, "backend", ProcessStatus::Stopped).await;
        assert_eq!(1, backend.restarts);
        assert_eq!(2, launcher.launches_of("backend"));
        assert_eq!(
            vec![("backend".to_string(), StopSignal::TERM)],
            launcher.signals()
        );

        // stopping a stopped process is a no-op
        let again = handle.stop("backend").await.unwrap();
        assert_eq!(ProcessStatus::Stopped, again.status);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_escalates_to_kill() {
        let launcher = FakeLauncher::default().ignore_term("frontend");
        let (supervisor, handle) = supervisor(vec![spec("frontend", 20)], launcher.clone());
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown));

        wait_for(&handle, "frontend", ProcessStatus::Running).await;
        let start = Instant::now();
        handle.stop("frontend").await.unwrap();
        let frontend = wait_for(&handle, "frontend", ProcessStatus::Stopped).await;

        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(Some(9), frontend.last_exit.and_then(|o| o.signal));
        assert_eq!(
            vec![
                ("frontend".to_string(), StopSignal::TERM),
                ("frontend".to_string(), StopSignal::KILL)
            ],
            launcher.signals()
        );

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaped_child_is_never_signalled() {
        let launcher = FakeLauncher::default();
        let (supervisor, handle) = supervisor(vec![spec("backend", 10)], launcher.clone());
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown));

        wait_for(&handle, "backend", ProcessStatus::Running).await;
        launcher.reap_quietly("backend");

        handle.stop("backend").await.unwrap();
        // past the stop deadline, so the kill path ran as well
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(launcher.signals().is_empty());

        launcher.crash("backend", 0);
        let backend = wait_for(&handle, "backend", ProcessStatus::Stopped).await;
        assert_eq!(Some(ExitOutcome::code(0)), backend.last_exit);
        assert!(launcher.signals().is_empty());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_processes_concurrently() {
        let launcher = FakeLauncher::default()
            .ignore_term("backend")
            .ignore_term("frontend");
        let (supervisor, handle) = supervisor(
            vec![spec("backend", 10), spec("frontend", 20), spec("router", 30)],
            launcher.clone(),
        );
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown));

        wait_for(&handle, "router", ProcessStatus::Running).await;
        let start = Instant::now();
        shutdown_tx.send(true).unwrap();
        assert_eq!(SupervisorExit::Shutdown, task.await.unwrap());

        // bounded by the longest stop timeout, not the sum
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(10));
        let snapshot = handle.snapshot();
        assert!(snapshot
            .processes
            .iter()
            .all(|p| p.status == ProcessStatus::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_and_start_commands() {
        let launcher = FakeLauncher::default();
        let (supervisor, handle) = supervisor(vec![spec("backend", 10)], launcher.clone());
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown));

        wait_for(&handle, "backend", ProcessStatus::Running).await;
        handle.restart("backend").await.unwrap();
        wait_for(&handle, "backend", ProcessStatus::Running).await;
        assert_eq!(2, launcher.launches_of("backend"));
        assert_eq!(0, handle.snapshot().process("backend").unwrap().restarts);

        let err = handle.start("backend").await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::InvalidTransition { action: "start", .. }
        ));
        let err = handle.stop("nope").await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownProcess(name) if name == "nope"));

        handle.stop("backend").await.unwrap();
        wait_for(&handle, "backend", ProcessStatus::Stopped).await;
        handle.start("backend").await.unwrap();
        wait_for(&handle, "backend", ProcessStatus::Running).await;
        assert_eq!(3, launcher.launches_of("backend"));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            handle.start("backend").await,
            Err(SupervisorError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_resets_budget_of_fatal_process() {
        let launcher = FakeLauncher::default().crash_on_start("backend");
        let (supervisor, handle) = supervisor(vec![spec("backend", 10)], launcher.clone());
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown));

        wait_for(&handle, "backend", ProcessStatus::FatalStopped).await;
        launcher.heal("backend");

        handle.start("backend").await.unwrap();
        let backend = wait_for(&handle, "backend", ProcessStatus::Running).await;
        assert_eq!(0, backend.restarts);
        assert!(handle.snapshot().is_healthy());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_on_fatal_ends_run() {
        let launcher = FakeLauncher::default().crash_on_start("router");
        let (supervisor, handle) =
            supervisor(vec![spec("backend", 10), spec("router", 30)], launcher.clone());
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let exit = supervisor.with_exit_on_fatal(true).run(shutdown).await;
        assert_eq!(SupervisorExit::Fatal("router".to_string()), exit);
        assert_eq!(
            ProcessStatus::Stopped,
            handle.snapshot().process("backend").unwrap().status
        );
    }

    #[tokio::test]
    async fn test_real_process_lifecycle() {
        let specs = vec![
            ServiceSpec {
                start_grace: Duration::from_millis(200),
                stop_timeout: Duration::from_secs(2),
                ..ServiceSpec::new("sleeper", ["/bin/sh", "-c", "exec sleep 30"])
            },
            ServiceSpec {
                start_retries: 2,
                start_grace: Duration::from_millis(500),
                ..ServiceSpec::new("broken", ["/bin/sh", "-c", "exit 3"])
            },
        ];
        let table = Arc::new(ServiceTable::new(specs).unwrap());
        let (supervisor, handle) = Supervisor::new(table, crate::supervisor::CommandLauncher);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown));

        let sleeper = wait_for(&handle, "sleeper", ProcessStatus::Running).await;
        assert!(sleeper.pid.is_some());
        let broken = wait_for(&handle, "broken", ProcessStatus::FatalStopped).await;
        assert_eq!(Some(ExitOutcome::code(3)), broken.last_exit);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        let sleeper = handle.snapshot().process("sleeper").cloned().unwrap();
        assert_eq!(ProcessStatus::Stopped, sleeper.status);
        assert_eq!(Some(15), sleeper.last_exit.and_then(|o| o.signal));
    }
}
