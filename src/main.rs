use clap::Parser;
use parley::cli::Cli;
use parley::config::ServerConfig;
use parley::error::Result;
use parley::server::PolicyServer;
use tracing::{error, info};

mod main_runtime;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = main_runtime::init_logging();

    if let Err(e) = run(&cli).await {
        error!("Fatal: {}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    info!("Loading configuration from {:?}", cli.config);
    let config = ServerConfig::load_from(&cli.config)?;

    let server = PolicyServer::from_config(&config, cli.mode)?;
    info!("<Press ctrl+c to quit>");
    server.run().await
}
