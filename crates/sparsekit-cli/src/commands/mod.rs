//! CLI command implementations
//!
//! - [`validate_config`]: configuration checks
//! - [`simulate`]: in-process training simulation
//! - [`inspect_checkpoint`]: shard checkpoint summaries

mod inspect_checkpoint;
mod simulate;
mod validate_config;

pub use inspect_checkpoint::{CheckpointSummary, InspectCheckpointCommand, RowPreview};
pub use simulate::{SimulateCommand, SimulationReport};
pub use validate_config::ValidateConfigCommand;
