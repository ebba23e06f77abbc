//! sparsekit CLI library
//!
//! - **validate-config**: check a distributed embedding configuration file
//! - **simulate**: train an embedding on random batches with an in-process worker group
//! - **inspect-checkpoint**: summarize a shard checkpoint file
//!
//! # Example
//!
//! ```bash
//! sparsekit validate-config --config embedding.json
//! sparsekit simulate --workers 4 --steps 100 --batch-size 64 --checkpoint-dir /tmp/ckpt
//! sparsekit inspect-checkpoint --path /tmp/ckpt/shard-0.json
//! ```

pub mod commands;

use clap::{Parser, Subcommand};

pub use commands::{InspectCheckpointCommand, SimulateCommand, ValidateConfigCommand};

/// sparsekit - distributed sparse embedding tools
#[derive(Parser, Debug)]
#[command(name = "sparsekit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a distributed embedding configuration file
    ValidateConfig(ValidateConfigCommand),

    /// Train an embedding on random batches with an in-process worker group
    Simulate(SimulateCommand),

    /// Summarize a shard checkpoint file
    InspectCheckpoint(InspectCheckpointCommand),
}
