use anyhow::{Context, Result};
use clap::Parser;
use tidepool_client::{
    app,
    config::{AppConfig, Cli},
    logging,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = AppConfig::try_from(Cli::parse())?;
    logging::init(&config.log).context("failed to initialise logging")?;
    app::run(config).await
}
