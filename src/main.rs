use std::sync::Arc;

use pingora::services::listening::Service;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;

use stackgate::admin::ControlHttpApp;
use stackgate::config::{self, Config};
use stackgate::error::GateError;
use stackgate::logging::{self, Logger};
use stackgate::probe::{PostgresCheck, Prober};
use stackgate::service::supervisor::SupervisorService;
use stackgate::supervisor::{CommandLauncher, ServiceTable, Supervisor};

fn main() {
    let opt = Opt::parse_args();

    let config = match Config::load_yaml_with_opt_override(&opt) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(GateError::from(e).exit_code());
        }
    };

    let mut logger = logging::init(&config.log);

    let table = match ServiceTable::from_config(&config.services) {
        Ok(table) => Arc::new(table),
        Err(e) => exit(&mut logger, GateError::Config(e.to_string())),
    };

    if opt.test {
        log::debug!("Effective configuration:\n{}", config.to_yaml());
        log::info!("Configuration {:?} is valid", opt.conf);
        return;
    }

    // Nothing is launched until the datastore answers.
    if let Err(e) = wait_for_datastore(&config.datastore) {
        exit(&mut logger, e);
    }

    let mut server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    let log_flusher = logger.as_ref().map(Logger::flusher);
    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        server.add_service(log_service);
    }

    log::info!("Adding process supervisor for {} services...", table.len());
    let (supervisor, handle) = Supervisor::new(table, CommandLauncher);
    let supervisor = supervisor.with_exit_on_fatal(config.supervisor.exit_on_fatal);
    server.add_service(SupervisorService::new(supervisor).with_log_flusher(log_flusher));

    log::info!("Adding control HTTP on {}...", config.control.address);
    match ControlHttpApp::control_http_service(config.control.address, handle) {
        Ok(control) => server.add_service(control),
        Err(e) => log::error!("Control surface disabled: {e}"),
    }

    add_prometheus(&mut server, config.prometheus.as_ref());

    log::info!("Bootstrapping...");
    server.bootstrap();

    log::info!("Starting Server...");
    server.run_forever();
}

fn wait_for_datastore(datastore: &config::Datastore) -> Result<(), GateError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| GateError::Config(format!("unable to start probe runtime: {e}")))?;

    let prober = Prober::new(
        PostgresCheck::new(datastore.connect_timeout()),
        datastore.max_attempts,
        datastore.backoff_unit(),
    );
    let target = datastore.connection_string();
    let ready = runtime.block_on(prober.probe(target.as_deref()))?;
    log::info!(
        "Datastore ready after {} attempt(s): {}",
        ready.attempts,
        ready.server
    );
    Ok(())
}

fn add_prometheus(server: &mut Server, prometheus: Option<&config::Prometheus>) {
    if let Some(prometheus) = prometheus {
        log::info!("Adding Prometheus HTTP on {}...", prometheus.address);
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus.address.to_string());
        server.add_service(prometheus_service_http);
    }
}

fn exit(logger: &mut Option<Logger>, err: GateError) -> ! {
    log::error!("{err}");
    if let Some(logger) = logger {
        if let Err(e) = logger.flush_pending() {
            eprintln!("Failed to flush log file: {e}");
        }
    }
    std::process::exit(err.exit_code());
}
