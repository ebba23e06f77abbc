//! Error types for the distributed embedding pipeline.

use std::path::PathBuf;

use sparsekit_collective::CommunicationError;
use sparsekit_shard::ShardError;
use thiserror::Error;

/// Errors surfaced by a forward or backward step.
///
/// A step that returns any of these has been abandoned as a whole. Only
/// [`EmbeddingError::Communication`] is worth re-issuing unchanged; the
/// others point at bad input or configuration.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Malformed sparse input or a violated slot / nnz / feature bound.
    #[error("input shape error: {0}")]
    InputShape(String),

    /// A local row address or the shard capacity was exceeded.
    #[error("out of range: {0}")]
    OutOfRange(#[source] ShardError),

    /// A collective failed; the step must be re-issued by the caller.
    #[error("communication error: {0}")]
    Communication(#[from] CommunicationError),

    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backward was called without a preceding training forward.
    #[error("no forward state to run backward against")]
    MissingForwardState,

    /// The upstream gradient does not match the forward output shape.
    #[error("gradient shape mismatch: expected {expected} values, got {actual}")]
    GradientShape {
        /// Expected number of values.
        expected: usize,
        /// Actual number of values.
        actual: usize,
    },

    /// Any other shard failure.
    #[error("shard error: {0}")]
    Shard(#[source] ShardError),

    /// I/O error while reading configuration or checkpoints.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A worker task of a local cluster did not finish.
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl From<ShardError> for EmbeddingError {
    fn from(err: ShardError) -> Self {
        if err.is_out_of_range() {
            EmbeddingError::OutOfRange(err)
        } else {
            EmbeddingError::Shard(err)
        }
    }
}

impl EmbeddingError {
    /// True if re-issuing the whole step unchanged may succeed.
    pub fn is_retryable_step(&self) -> bool {
        matches!(self, EmbeddingError::Communication(_))
    }

    /// True if the error came from a collective.
    pub fn is_communication(&self) -> bool {
        matches!(self, EmbeddingError::Communication(_))
    }
}

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_errors_are_classified() {
        let capacity = ShardError::CapacityExceeded {
            rank: 0,
            capacity: 1,
            required: 2,
        };
        assert!(matches!(
            EmbeddingError::from(capacity),
            EmbeddingError::OutOfRange(_)
        ));

        let dim = ShardError::DimensionMismatch {
            expected: 2,
            actual: 3,
        };
        assert!(matches!(EmbeddingError::from(dim), EmbeddingError::Shard(_)));
    }

    #[test]
    fn test_only_communication_is_retryable() {
        let comm = EmbeddingError::Communication(CommunicationError::InvalidArgument(
            "x".to_string(),
        ));
        assert!(comm.is_retryable_step());
        assert!(!EmbeddingError::InputShape("bad".to_string()).is_retryable_step());
        assert!(!EmbeddingError::MissingForwardState.is_retryable_step());
    }
}
