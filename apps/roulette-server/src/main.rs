use anyhow::Result;
use clap::Parser;
use tracing::info;

use roulette_server::config::{Cli, ServerConfig};
use roulette_server::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        match_timeout = ?config.match_timeout,
        "starting roulette server"
    );

    roulette_server::run(config, Some(telemetry.metrics_handle())).await
}
