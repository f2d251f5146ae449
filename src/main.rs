//! Grid Gateway - OAuth2 front door for a cluster job scheduler

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use grid_gateway::{Error, cli::Cli, config::Config, gateway::Gateway, setup_tracing};

const EXIT_CONFIG: u8 = 1;
const EXIT_STARTUP: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::from(EXIT_STARTUP);
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(ref addr) = cli.listen_addr {
                config.server.listen_addr = addr.clone();
            }
            if cli.no_rpc {
                config.rpc.enabled = false;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen_addr,
        provider = config.provider.is_configured(),
        sso = config.sso.is_configured(),
        "Starting grid gateway"
    );

    let gateway = match Gateway::from_config(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return exit_for(&e);
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return exit_for(&e);
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

fn exit_for(e: &Error) -> ExitCode {
    match e {
        Error::Config(_) => ExitCode::from(EXIT_CONFIG),
        _ => ExitCode::from(EXIT_STARTUP),
    }
}
