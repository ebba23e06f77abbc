//! sparsekit CLI - validate embedding configurations, run in-process
//! simulations of a worker group, and inspect shard checkpoints.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sparsekit_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("sparsekit=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ValidateConfig(cmd) => cmd.run()?,
        Commands::Simulate(cmd) => cmd.run().await?,
        Commands::InspectCheckpoint(cmd) => cmd.run()?,
    }

    info!("sparsekit completed successfully");
    Ok(())
}
