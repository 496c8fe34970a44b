use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, trace, LevelFilter};
use once_cell::sync::Lazy;
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

static SERVICE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,62}$").unwrap());

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_unique_services"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    #[validate(nested)]
    pub datastore: Datastore,
    #[serde(default)]
    pub supervisor: Supervisor,
    #[serde(default)]
    #[validate(nested)]
    pub control: Control,
    pub prometheus: Option<Prometheus>,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub services: Vec<ServiceConfig>,
    #[validate(nested)]
    pub edge: Edge,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_unique_services(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                let mut err = ValidationError::new("duplicate_service_name");
                err.add_param("name".into(), &service.name);
                return Err(err);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
    /// Append log lines to this file instead of stderr.
    pub path: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Datastore {
    /// Environment variable holding the connection string.
    #[serde(default = "Datastore::default_url_env")]
    pub url_env: String,
    /// Inline connection string, takes precedence over `url_env`.
    pub url: Option<String>,
    #[serde(default = "Datastore::default_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    #[serde(default = "Datastore::default_backoff_unit_ms")]
    #[validate(range(min = 1))]
    pub backoff_unit_ms: u64,
    #[serde(default = "Datastore::default_connect_timeout")]
    #[validate(range(min = 1))]
    pub connect_timeout: u64,
}

impl Default for Datastore {
    fn default() -> Self {
        Self {
            url_env: Self::default_url_env(),
            url: None,
            max_attempts: Self::default_max_attempts(),
            backoff_unit_ms: Self::default_backoff_unit_ms(),
            connect_timeout: Self::default_connect_timeout(),
        }
    }
}

impl Datastore {
    fn default_url_env() -> String {
        "DATABASE_URL".to_string()
    }

    fn default_max_attempts() -> u32 {
        5
    }

    fn default_backoff_unit_ms() -> u64 {
        1000
    }

    fn default_connect_timeout() -> u64 {
        10
    }

    /// Resolves the raw connection string, `None` when unset or blank.
    pub fn connection_string(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| std::env::var(&self.url_env).ok())
            .filter(|url| !url.trim().is_empty())
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct Supervisor {
    /// Stop every process and exit non-zero once any process is fatally stopped.
    #[serde(default)]
    pub exit_on_fatal: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Control::validate_loopback"))]
pub struct Control {
    #[serde(default = "Control::default_address")]
    pub address: SocketAddr,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
        }
    }
}

impl Control {
    fn default_address() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9001))
    }

    fn validate_loopback(&self) -> Result<(), ValidationError> {
        if self.address.ip().is_loopback() {
            Ok(())
        } else {
            Err(ValidationError::new("control_address_must_be_loopback"))
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoRestart {
    #[default]
    Always,
    Never,
    Unexpected,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StopSignal {
    #[default]
    TERM,
    INT,
    QUIT,
    HUP,
    KILL,
    USR1,
    USR2,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            StopSignal::TERM => "SIGTERM",
            StopSignal::INT => "SIGINT",
            StopSignal::QUIT => "SIGQUIT",
            StopSignal::HUP => "SIGHUP",
            StopSignal::KILL => "SIGKILL",
            StopSignal::USR1 => "SIGUSR1",
            StopSignal::USR2 => "SIGUSR2",
        };
        write!(f, "{}", name)
    }
}

/// Destination of one output stream of a supervised process.
///
/// Written in YAML as `inherit`, `null`, or a file path.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogSink {
    /// Share the supervisor's own stream.
    #[default]
    Inherit,
    Null,
    File(PathBuf),
}

impl From<String> for LogSink {
    fn from(value: String) -> Self {
        match value.as_str() {
            "inherit" => LogSink::Inherit,
            "null" | "none" => LogSink::Null,
            _ => LogSink::File(PathBuf::from(value)),
        }
    }
}

impl From<LogSink> for String {
    fn from(sink: LogSink) -> Self {
        match sink {
            LogSink::Inherit => "inherit".to_string(),
            LogSink::Null => "null".to_string(),
            LogSink::File(path) => path.display().to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct ServiceConfig {
    #[validate(custom(function = "ServiceConfig::validate_name"))]
    pub name: String,
    /// Program followed by its arguments.
    #[validate(length(min = 1))]
    pub command: Vec<String>,
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default = "ServiceConfig::default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub autorestart: AutoRestart,
    #[serde(default = "ServiceConfig::default_start_retries")]
    pub start_retries: u32,
    #[serde(default = "ServiceConfig::default_start_secs")]
    pub start_secs: u64,
    #[serde(default = "ServiceConfig::default_exit_codes")]
    pub exit_codes: Vec<i32>,
    /// Uptime in seconds after which the restart budget is refilled.
    pub reset_after: Option<u64>,

    #[serde(default)]
    pub stop_signal: StopSignal,
    #[serde(default = "ServiceConfig::default_stop_timeout")]
    pub stop_timeout: u64,
    #[serde(default)]
    pub stop_as_group: bool,

    #[serde(default)]
    pub stdout: LogSink,
    #[serde(default)]
    pub stderr: LogSink,
    #[serde(default)]
    pub redirect_stderr: bool,
}

impl ServiceConfig {
    fn default_priority() -> i32 {
        999
    }

    fn default_start_retries() -> u32 {
        3
    }

    fn default_start_secs() -> u64 {
        1
    }

    fn default_exit_codes() -> Vec<i32> {
        vec![0]
    }

    fn default_stop_timeout() -> u64 {
        10
    }

    fn validate_name(name: &str) -> Result<(), ValidationError> {
        if SERVICE_NAME.is_match(name) {
            Ok(())
        } else {
            let mut err = ValidationError::new("invalid_service_name");
            err.add_param("name".into(), &name.to_string());
            Err(err)
        }
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Edge::validate_routes"))]
pub struct Edge {
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub upstreams: Vec<Upstream>,
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub routes: Vec<Route>,
}

impl Edge {
    fn validate_routes(&self) -> Result<(), ValidationError> {
        let mut upstream_names = HashSet::new();
        for upstream in &self.upstreams {
            if !upstream_names.insert(upstream.name.as_str()) {
                return Err(ValidationError::new("duplicate_upstream_name"));
            }
        }

        let mut route_ids = HashSet::new();
        for route in &self.routes {
            if !route_ids.insert(route.id.as_str()) {
                return Err(ValidationError::new("duplicate_route_id"));
            }
            if !upstream_names.contains(route.upstream.as_str()) {
                let mut err = ValidationError::new("unknown_route_upstream");
                err.add_param("upstream".into(), &route.upstream);
                return Err(err);
            }
        }

        match self.routes.iter().filter(|r| r.default).count() {
            1 => Ok(()),
            0 => Err(ValidationError::new("default_route_required")),
            _ => Err(ValidationError::new("single_default_route_allowed")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
    #[serde(default)]
    pub offer_h2c: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Timeout {
    pub connect: u64,
    pub send: u64,
    pub read: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Upstream {
    #[validate(length(min = 1))]
    pub name: String,
    pub address: SocketAddr,
    #[validate(nested)]
    pub timeout: Option<Timeout>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Route::validate_match"))]
pub struct Route {
    pub id: String,

    /// Exact path match.
    pub uri: Option<String>,
    /// Path prefix match.
    pub prefix: Option<String>,
    /// Catch-all.
    #[serde(default)]
    pub default: bool,

    pub upstream: String,
    #[serde(default)]
    pub upgrade: bool,
    #[serde(default = "Route::default_buffering")]
    pub buffering: bool,
    #[serde(default)]
    pub intercept_errors: bool,
    #[validate(nested)]
    pub timeout: Option<Timeout>,
}

impl Route {
    fn default_buffering() -> bool {
        true
    }

    fn validate_match(&self) -> Result<(), ValidationError> {
        let predicates =
            self.uri.is_some() as u8 + self.prefix.is_some() as u8 + self.default as u8;
        if predicates != 1 {
            return Err(ValidationError::new("exactly_one_match_predicate"));
        }

        let path = self.uri.as_deref().or(self.prefix.as_deref());
        if path.is_some_and(|p| !p.starts_with('/')) {
            return Err(ValidationError::new("match_path_must_be_absolute"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    const MINIMAL: &str = r#"
---
services:
  - name: backend
    command: ["sleep", "60"]

edge:
  listeners:
    - address: 0.0.0.0:8080
  upstreams:
    - name: backend
      address: 127.0.0.1:8000
  routes:
    - id: all
      default: true
      upstream: backend
"#;

    fn expect_invalid(conf_str: &str) {
        match Config::from_yaml(conf_str) {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => eprintln!("Error: {:?}", e),
        }
    }

    #[test]
    fn test_load_shipped_config() {
        init_log();
        let conf = Config::from_yaml(include_str!("../../conf/stackgate.yaml")).unwrap();
        assert_eq!(3, conf.services.len());
        assert_eq!(2, conf.edge.upstreams.len());
        assert_eq!(4, conf.edge.routes.len());
        assert_eq!(5, conf.datastore.max_attempts);
        assert_eq!(StopSignal::INT, conf.services[2].stop_signal);
        assert!(conf.services[0].redirect_stderr);
        assert_eq!(Some(300), conf.services[0].reset_after);
        assert_eq!(None, conf.services[2].reset_after);
        assert!(conf.edge.routes.iter().any(|r| r.upgrade && !r.buffering));
    }

    #[test]
    fn test_minimal_defaults() {
        init_log();
        let conf = Config::from_yaml(MINIMAL).unwrap();
        let service = &conf.services[0];
        assert_eq!(999, service.priority);
        assert_eq!(AutoRestart::Always, service.autorestart);
        assert_eq!(3, service.start_retries);
        assert_eq!(vec![0], service.exit_codes);
        assert_eq!(LogSink::Inherit, service.stdout);
        assert_eq!("DATABASE_URL", conf.datastore.url_env);
        assert_eq!(Duration::from_secs(1), conf.datastore.backoff_unit());
        assert!(conf.control.address.ip().is_loopback());
        assert!(conf.edge.routes[0].buffering);
    }

    #[test]
    fn test_log_sink_forms() {
        assert_eq!(LogSink::Inherit, LogSink::from("inherit".to_string()));
        assert_eq!(LogSink::Null, LogSink::from("null".to_string()));
        assert_eq!(
            LogSink::File(PathBuf::from("/var/log/app.log")),
            LogSink::from("/var/log/app.log".to_string())
        );
    }

    #[test]
    fn test_inline_url_wins_over_env() {
        let datastore = Datastore {
            url: Some("postgresql://u:p@db:5432/app".to_string()),
            url_env: "STACKGATE_TEST_UNSET_VARIABLE".to_string(),
            ..Datastore::default()
        };
        assert_eq!(
            Some("postgresql://u:p@db:5432/app".to_string()),
            datastore.connection_string()
        );

        let blank = Datastore {
            url: Some("   ".to_string()),
            ..Datastore::default()
        };
        assert_eq!(None, blank.connection_string());
    }

    #[test]
    fn test_valid_default_route_required() {
        init_log();
        expect_invalid(
            r#"
services:
  - name: backend
    command: ["sleep", "60"]
edge:
  listeners:
    - address: 0.0.0.0:8080
  upstreams:
    - name: backend
      address: 127.0.0.1:8000
  routes:
    - id: api
      prefix: /api/
      upstream: backend
"#,
        );
    }

    #[test]
    fn test_valid_single_default_route() {
        init_log();
        expect_invalid(
            r#"
services:
  - name: backend
    command: ["sleep", "60"]
edge:
  listeners:
    - address: 0.0.0.0:8080
  upstreams:
    - name: backend
      address: 127.0.0.1:8000
  routes:
    - id: one
      default: true
      upstream: backend
    - id: two
      default: true
      upstream: backend
"#,
        );
    }

    #[test]
    fn test_valid_route_upstream_exists() {
        init_log();
        expect_invalid(
            r#"
services:
  - name: backend
    command: ["sleep", "60"]
edge:
  listeners:
    - address: 0.0.0.0:8080
  upstreams:
    - name: backend
      address: 127.0.0.1:8000
  routes:
    - id: all
      default: true
      upstream: frontend
"#,
        );
    }

    #[test]
    fn test_valid_route_single_predicate() {
        init_log();
        expect_invalid(
            r#"
services:
  - name: backend
    command: ["sleep", "60"]
edge:
  listeners:
    - address: 0.0.0.0:8080
  upstreams:
    - name: backend
      address: 127.0.0.1:8000
  routes:
    - id: health
      uri: /health
      prefix: /health
      upstream: backend
    - id: all
      default: true
      upstream: backend
"#,
        );
    }

    #[test]
    fn test_valid_unique_service_names() {
        init_log();
        expect_invalid(
            r#"
services:
  - name: backend
    command: ["sleep", "60"]
  - name: backend
    command: ["sleep", "30"]
edge:
  listeners:
    - address: 0.0.0.0:8080
  upstreams:
    - name: backend
      address: 127.0.0.1:8000
  routes:
    - id: all
      default: true
      upstream: backend
"#,
        );
    }

    #[test]
    fn test_valid_service_command_required() {
        init_log();
        expect_invalid(
            r#"
services:
  - name: backend
    command: []
edge:
  listeners:
    - address: 0.0.0.0:8080
  upstreams:
    - name: backend
      address: 127.0.0.1:8000
  routes:
    - id: all
      default: true
      upstream: backend
"#,
        );
    }

    #[test]
    fn test_valid_control_is_loopback() {
        init_log();
        let conf_str = format!("{MINIMAL}\ncontrol:\n  address: 0.0.0.0:9001\n");
        expect_invalid(&conf_str);
    }

    #[test]
    fn test_valid_max_attempts_positive() {
        init_log();
        let conf_str = format!("{MINIMAL}\ndatastore:\n  max_attempts: 0\n");
        expect_invalid(&conf_str);
    }
}
