//! inspect-checkpoint command

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use sparsekit_shard::checkpoint::load_snapshot;
use sparsekit_shard::{Key, ShardSnapshot};

/// Summarize a shard checkpoint file
///
/// # Example
///
/// ```bash
/// sparsekit inspect-checkpoint --path /tmp/ckpt/shard-0.json --show-rows 3
/// ```
#[derive(Args, Debug, Clone)]
pub struct InspectCheckpointCommand {
    /// Path to a shard checkpoint file
    #[arg(long, short = 'p')]
    pub path: PathBuf,

    /// Number of rows to print
    #[arg(long, default_value = "5")]
    pub show_rows: usize,
}

/// What a shard checkpoint holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    /// Rank of the shard's worker.
    pub rank: usize,
    /// Embedding dimension.
    pub dim: usize,
    /// Row capacity.
    pub capacity: usize,
    /// Allocated rows.
    pub rows: usize,
    /// Fraction of the capacity in use.
    pub utilization: f64,
    /// Mean L2 norm of the allocated rows.
    pub mean_l2_norm: f64,
    /// The first rows in local row order.
    pub preview: Vec<RowPreview>,
}

/// One row of a [`CheckpointSummary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowPreview {
    /// Local row.
    pub local_row: usize,
    /// Key stored there.
    pub key: Key,
    /// Row values.
    pub values: Vec<f32>,
}

impl CheckpointSummary {
    /// Summarizes `snapshot`, previewing at most `show_rows` rows.
    pub fn from_snapshot(snapshot: &ShardSnapshot, show_rows: usize) -> Self {
        let rows = snapshot.len();
        let mean_l2_norm = if rows == 0 {
            0.0
        } else {
            snapshot
                .entries
                .iter()
                .map(|e| e.values.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>().sqrt())
                .sum::<f64>()
                / rows as f64
        };
        let utilization = if snapshot.capacity == 0 {
            0.0
        } else {
            rows as f64 / snapshot.capacity as f64
        };
        let preview = snapshot
            .entries
            .iter()
            .take(show_rows)
            .map(|e| RowPreview {
                local_row: e.local_row,
                key: e.key,
                values: e.values.clone(),
            })
            .collect();

        Self {
            rank: snapshot.rank,
            dim: snapshot.dim,
            capacity: snapshot.capacity,
            rows,
            utilization,
            mean_l2_norm,
            preview,
        }
    }
}

impl InspectCheckpointCommand {
    /// Loads the checkpoint and summarizes it.
    pub fn inspect(&self) -> Result<CheckpointSummary> {
        let snapshot = load_snapshot(&self.path)
            .with_context(|| format!("Failed to load checkpoint {}", self.path.display()))?;
        Ok(CheckpointSummary::from_snapshot(&snapshot, self.show_rows))
    }

    /// Execute the inspect-checkpoint command
    pub fn run(&self) -> Result<()> {
        let summary = self.inspect()?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok(())
    }
}
