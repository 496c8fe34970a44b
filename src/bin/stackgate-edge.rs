use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;

use stackgate::config::Config;
use stackgate::error::GateError;
use stackgate::logging;
use stackgate::service::http::build_edge_services;

fn main() {
    let opt = Opt::parse_args();

    let config = match Config::load_yaml_with_opt_override(&opt) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(GateError::from(e).exit_code());
        }
    };

    let logger = logging::init(&config.log);

    let mut server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    log::info!("Loading routes...");
    let edge_services = match build_edge_services(&server.configuration, &config.edge) {
        Ok(services) => services,
        Err(e) => {
            log::error!("Failed to build edge services: {e}");
            std::process::exit(GateError::from(e).exit_code());
        }
    };

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        server.add_service(log_service);
    }

    log::info!("Bootstrapping...");
    server.bootstrap();

    log::info!("Bootstrapped. Adding edge listeners...");
    for service in edge_services {
        server.add_service(service);
    }

    log::info!("Starting Server...");
    server.run_forever();
}
