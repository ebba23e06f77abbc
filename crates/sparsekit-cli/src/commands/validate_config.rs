//! validate-config command

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use sparsekit_embedding::DistributedEmbeddingConfig;
use tracing::info;

/// Validate a distributed embedding configuration file
///
/// Prints the configuration with every default filled in.
///
/// # Example
///
/// ```bash
/// sparsekit validate-config --config embedding.json
/// ```
#[derive(Args, Debug, Clone)]
pub struct ValidateConfigCommand {
    /// Path to the configuration file (JSON)
    #[arg(long, short = 'c', env = "SPARSEKIT_CONFIG")]
    pub config: PathBuf,
}

impl ValidateConfigCommand {
    /// Loads and validates the configuration.
    pub fn load(&self) -> Result<DistributedEmbeddingConfig> {
        DistributedEmbeddingConfig::from_json_file(&self.config)
            .with_context(|| format!("Invalid configuration {}", self.config.display()))
    }

    /// Execute the validate-config command
    pub fn run(&self) -> Result<()> {
        let config = self.load()?;
        info!(
            path = %self.config.display(),
            combiner = %config.combiner,
            max_feature_num = config.max_feature_num(),
            "Configuration is valid"
        );
        println!("{}", config.to_json_pretty()?);
        Ok(())
    }
}
