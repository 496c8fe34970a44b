//! Test doubles shared by the supervisor and control surface tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;

use crate::config::StopSignal;
use crate::error::SupervisorError;

use super::{
    ChildHandle, ExitOutcome, Launched, Launcher, ProcessSnapshot, ProcessStatus, ServiceSpec,
    SupervisorHandle,
};

#[derive(Default)]
struct FakeState {
    next_pid: u32,
    launched: Vec<String>,
    pids: HashMap<String, u32>,
    children: HashMap<u32, ChildHandle>,
    exits: HashMap<u32, oneshot::Sender<ExitOutcome>>,
    signals: Vec<(String, StopSignal)>,
    crash_on_start: HashSet<String>,
    ignore_term: HashSet<String>,
}

/// Launcher whose "processes" live until signalled or crashed.
#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeLauncher {
    pub(crate) fn crash_on_start(self, name: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .crash_on_start
            .insert(name.to_string());
        self
    }

    pub(crate) fn ignore_term(self, name: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .ignore_term
            .insert(name.to_string());
        self
    }

    /// Lets a process configured with `crash_on_start` come up normally.
    pub(crate) fn heal(&self, name: &str) {
        self.inner.lock().unwrap().crash_on_start.remove(name);
    }

    pub(crate) fn launched(&self) -> Vec<String> {
        self.inner.lock().unwrap().launched.clone()
    }

    pub(crate) fn launches_of(&self, name: &str) -> usize {
        self.launched().iter().filter(|n| *n == name).count()
    }

    pub(crate) fn signals(&self) -> Vec<(String, StopSignal)> {
        self.inner.lock().unwrap().signals.clone()
    }

    /// Collects the exit of `name` without reporting it yet, as when the
    /// child is gone but the supervisor has not heard about it.
    pub(crate) fn reap_quietly(&self, name: &str) {
        let inner = self.inner.lock().unwrap();
        inner.children[&inner.pids[name]].mark_reaped();
    }

    pub(crate) fn crash(&self, name: &str, code: i32) {
        let mut inner = self.inner.lock().unwrap();
        let pid = inner.pids[name];
        if let Some(tx) = inner.exits.remove(&pid) {
            let _ = tx.send(ExitOutcome::code(code));
        }
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &ServiceSpec) -> Result<Launched, SupervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_pid += 1;
        let pid = 1000 + inner.next_pid;
        inner.launched.push(spec.name.clone());
        inner.pids.insert(spec.name.clone(), pid);
        let child = ChildHandle::new(pid);
        inner.children.insert(pid, child.clone());
        let reaper = child.clone();

        if inner.crash_on_start.contains(&spec.name) {
            return Ok(Launched {
                child,
                exit: async move {
                    reaper.mark_reaped();
                    ExitOutcome::code(1)
                }
                .boxed(),
            });
        }

        let (tx, rx) = oneshot::channel();
        inner.exits.insert(pid, tx);
        Ok(Launched {
            child,
            exit: async move {
                let outcome = rx.await.unwrap_or_default();
                reaper.mark_reaped();
                outcome
            }
            .boxed(),
        })
    }

    fn signal(
        &self,
        child: &ChildHandle,
        signal: StopSignal,
        _group: bool,
    ) -> Result<(), SupervisorError> {
        if child.is_reaped() {
            return Ok(());
        }
        let pid = child.pid();
        let mut inner = self.inner.lock().unwrap();
        let name = inner
            .pids
            .iter()
            .find(|(_, p)| **p == pid)
            .map(|(n, _)| n.clone())
            .unwrap_or_default();
        inner.signals.push((name.clone(), signal));

        if signal != StopSignal::KILL && inner.ignore_term.contains(&name) {
            return Ok(());
        }
        if let Some(tx) = inner.exits.remove(&pid) {
            let number = if signal == StopSignal::KILL { 9 } else { 15 };
            let _ = tx.send(ExitOutcome::signaled(number));
        }
        Ok(())
    }
}

/// Polls the snapshot until `name` reaches `status`.
pub(crate) async fn wait_for(
    handle: &SupervisorHandle,
    name: &str,
    status: ProcessStatus,
) -> ProcessSnapshot {
    for _ in 0..1000 {
        if let Some(process) = handle.snapshot().process(name) {
            if process.status == status {
                return process.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{name} never reached {status}");
}
