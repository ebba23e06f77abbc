//! Error types for shard operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::Key;

/// Errors that can occur while reading, writing or routing into a shard.
#[derive(Error, Debug)]
pub enum ShardError {
    /// The vector length doesn't match the shard's embedding dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected number of values.
        expected: usize,
        /// Actual number of values provided.
        actual: usize,
    },

    /// A local row address beyond the shard's capacity.
    #[error("local row {row} is out of range (capacity: {capacity})")]
    RowOutOfRange {
        /// The requested local row.
        row: usize,
        /// Capacity of the shard.
        capacity: usize,
    },

    /// A local row inside capacity that no key has been admitted to yet.
    #[error("local row {row} is not allocated (allocated rows: {allocated})")]
    UnallocatedRow {
        /// The requested local row.
        row: usize,
        /// Number of allocated rows.
        allocated: usize,
    },

    /// Admitting the routed keys would overflow the shard.
    #[error("shard {rank} capacity exceeded: {required} rows required, capacity {capacity}")]
    CapacityExceeded {
        /// Rank of the worker owning the shard.
        rank: usize,
        /// Maximum number of rows.
        capacity: usize,
        /// Number of rows the step would need.
        required: usize,
    },

    /// The shard already applied a gradient for this step.
    #[error("gradient for step {step} was already applied (last applied: {last_applied})")]
    GradientAlreadyApplied {
        /// Step of the rejected gradient.
        step: u64,
        /// Last step applied to the shard.
        last_applied: u64,
    },

    /// A gradient row was computed for a key the shard no longer stores there.
    #[error("gradient row {row} is for key {expected}, but the shard holds {actual:?} there")]
    KeyMismatch {
        /// Local row of the gradient entry.
        row: usize,
        /// Key the gradient was computed for.
        expected: Key,
        /// Key currently stored at the row.
        actual: Option<Key>,
    },

    /// `capacity * dim` values do not fit in memory.
    #[error("shard storage of {capacity} rows x {dim} values overflows")]
    StorageOverflow {
        /// Requested row capacity.
        capacity: usize,
        /// Requested embedding dimension.
        dim: usize,
    },

    /// Staged rows were prepared against a different shard state.
    #[error("staged rows start at row {staged_base} but shard holds {allocated} rows")]
    StaleStaging {
        /// Row count the staging was computed against.
        staged_base: usize,
        /// Current row count.
        allocated: usize,
    },

    /// A key router needs at least one worker.
    #[error("worker count must be greater than 0")]
    ZeroWorkers,

    /// A snapshot cannot be restored into this shard.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// I/O error while reading or writing a shard checkpoint.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Error during snapshot (de)serialization.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ShardError {
    /// Returns true for errors caused by addressing or capacity limits.
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            ShardError::RowOutOfRange { .. }
                | ShardError::UnallocatedRow { .. }
                | ShardError::CapacityExceeded { .. }
        )
    }
}

/// A specialized Result type for shard operations.
pub type Result<T> = std::result::Result<T, ShardError>;
