use anyhow::Result;
use clap::Parser;
use tidepool_server::{
    config::{Cli, ServerConfig},
    run,
    telemetry::Telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        domain_size = config.domain().size(),
        chunk_size = config.partitioner.chunk_size(),
        inline_snapshot = config.ships_inline_snapshot(),
        "starting tidepool server"
    );

    run(config, telemetry.metrics_handle()).await
}
