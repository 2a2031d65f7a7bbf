//! gattkit CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gattkit_cli::{cli::Cli, commands::CommandDispatcher, config::AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration before logging so the file can set the level
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    // Initialize logging
    setup_logging(cli.verbose, &config.logging.level);

    let dispatcher = CommandDispatcher::new(config, cli.simulate)
        .await
        .context("failed to open the Bluetooth transport")?;

    dispatcher.execute(cli).await.context("command failed")?;

    info!("gattkit exited successfully");
    Ok(())
}

/// `--verbose` wins over `RUST_LOG`, which wins over the configured level
fn setup_logging(verbose: bool, configured_level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured_level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
