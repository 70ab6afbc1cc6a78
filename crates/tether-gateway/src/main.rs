//! tether-gateway binary entry point.

use clap::Parser;
use tracing::{error, info};

use tether_gateway::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_format = cli.log_format.into();
    if let Err(e) = tether_core::init_logging(cli.verbose, cli.log_file.as_deref(), log_format) {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "tether-gateway starting");

    let config = cli.into_config();
    config.log_summary();

    if let Err(e) = tether_gateway::server::serve(config).await {
        error!(error = %e, "gateway exited with error");
        std::process::exit(1);
    }
}
