use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AutoRestart, LogSink, ServiceConfig, StopSignal};
use crate::error::SupervisorError;

use super::state::ExitOutcome;

/// Immutable description of one supervised process.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub directory: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,

    /// Lower values start first.
    pub priority: i32,
    pub autorestart: AutoRestart,
    pub start_retries: u32,
    pub start_grace: Duration,
    pub expected_exit_codes: Vec<i32>,
    pub reset_after: Option<Duration>,

    pub stop_signal: StopSignal,
    pub stop_timeout: Duration,
    pub stop_as_group: bool,

    pub stdout: LogSink,
    pub stderr: LogSink,
    pub redirect_stderr: bool,
}

impl ServiceSpec {
    /// A spec with the same defaults the configuration file applies.
    pub fn new<I, S>(name: &str, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            command: command.into_iter().map(Into::into).collect(),
            directory: None,
            environment: BTreeMap::new(),
            priority: 999,
            autorestart: AutoRestart::Always,
            start_retries: 3,
            start_grace: Duration::from_secs(1),
            expected_exit_codes: vec![0],
            reset_after: None,
            stop_signal: StopSignal::TERM,
            stop_timeout: Duration::from_secs(10),
            stop_as_group: false,
            stdout: LogSink::Inherit,
            stderr: LogSink::Inherit,
            redirect_stderr: false,
        }
    }

    pub fn is_expected_exit(&self, outcome: &ExitOutcome) -> bool {
        outcome
            .code
            .is_some_and(|code| self.expected_exit_codes.contains(&code))
    }
}

impl From<&ServiceConfig> for ServiceSpec {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            command: cfg.command.clone(),
            directory: cfg.directory.clone(),
            environment: cfg.environment.clone(),
            priority: cfg.priority,
            autorestart: cfg.autorestart,
            start_retries: cfg.start_retries,
            start_grace: Duration::from_secs(cfg.start_secs),
            expected_exit_codes: cfg.exit_codes.clone(),
            reset_after: cfg.reset_after.map(Duration::from_secs),
            stop_signal: cfg.stop_signal,
            stop_timeout: Duration::from_secs(cfg.stop_timeout),
            stop_as_group: cfg.stop_as_group,
            stdout: cfg.stdout.clone(),
            stderr: cfg.stderr.clone(),
            redirect_stderr: cfg.redirect_stderr,
        }
    }
}

/// Fixed table of service specs, addressed by index or by name.
#[derive(Debug, Default)]
pub struct ServiceTable {
    specs: Vec<Arc<ServiceSpec>>,
    by_name: HashMap<String, usize>,
}

impl ServiceTable {
    pub fn new(specs: Vec<ServiceSpec>) -> Result<Self, SupervisorError> {
        let mut table = Self::default();
        for spec in specs {
            if table.by_name.contains_key(&spec.name) {
                return Err(SupervisorError::DuplicateProcess(spec.name));
            }
            table.by_name.insert(spec.name.clone(), table.specs.len());
            table.specs.push(Arc::new(spec));
        }
        Ok(table)
    }

    pub fn from_config(services: &[ServiceConfig]) -> Result<Self, SupervisorError> {
        Self::new(services.iter().map(ServiceSpec::from).collect())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<ServiceSpec>> {
        self.specs.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceSpec>> {
        self.specs.iter()
    }

    /// Indices in launch order: ascending priority, table order among equals.
    pub fn start_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.specs.len()).collect();
        order.sort_by_key(|&index| self.specs[index].priority);
        order
    }

    /// Upper bound of a concurrent stop of every process.
    pub fn max_stop_timeout(&self) -> Duration {
        self.specs
            .iter()
            .map(|spec| spec.stop_timeout)
            .max()
            .unwrap_or_default()
    }
}
