//! Configuration of a distributed embedding layer.
//!
//! The same configuration must be used by every worker of a group: it fixes
//! the output shape each worker produces and the width of every row that
//! crosses the wire.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sparsekit_collective::CollectiveGroup;
use sparsekit_shard::{EmbeddingShard, InitializerConfig};
use tracing::warn;

use crate::combiner::Combiner;
use crate::error::{EmbeddingError, Result};

/// Largest supported `embedding_vec_size`.
pub const MAX_EMBEDDING_VEC_SIZE: usize = 1024;

/// Default bound on every collective wait, in milliseconds.
pub const DEFAULT_COMMUNICATION_TIMEOUT_MS: u64 = 30_000;

fn default_communication_timeout_ms() -> u64 {
    DEFAULT_COMMUNICATION_TIMEOUT_MS
}

/// Configuration for a distributed embedding layer.
///
/// # Example
///
/// ```
/// use sparsekit_embedding::{Combiner, DistributedEmbeddingConfig};
///
/// let config = DistributedEmbeddingConfig::new(Combiner::Mean, 1024, 16, 2, 4)
///     .with_max_feature_num(6);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.max_feature_num(), 6);
///
/// let parsed = DistributedEmbeddingConfig::from_json_str(
///     r#"{"combiner": "sum", "max_vocabulary_size_per_gpu": 8,
///         "embedding_vec_size": 4, "slot_num": 1, "max_nnz": 2}"#,
/// )
/// .unwrap();
/// assert_eq!(parsed.max_feature_num(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributedEmbeddingConfig {
    /// How keys of one (sample, slot) are reduced.
    pub combiner: Combiner,

    /// Row capacity of each worker's shard.
    pub max_vocabulary_size_per_gpu: usize,

    /// Width of every embedding row.
    pub embedding_vec_size: usize,

    /// Feature slots per sample.
    pub slot_num: usize,

    /// Maximum keys in one (sample, slot).
    pub max_nnz: usize,

    /// Maximum keys in one sample across all slots (default `slot_num * max_nnz`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_feature_num: Option<usize>,

    /// Initializer for rows of keys first seen during training.
    #[serde(default)]
    pub initializer: InitializerConfig,

    /// Bound on every collective wait, in milliseconds.
    #[serde(default = "default_communication_timeout_ms")]
    pub communication_timeout_ms: u64,
}

impl DistributedEmbeddingConfig {
    /// Creates a configuration with default initializer and timeout.
    pub fn new(
        combiner: Combiner,
        max_vocabulary_size_per_gpu: usize,
        embedding_vec_size: usize,
        slot_num: usize,
        max_nnz: usize,
    ) -> Self {
        Self {
            combiner,
            max_vocabulary_size_per_gpu,
            embedding_vec_size,
            slot_num,
            max_nnz,
            max_feature_num: None,
            initializer: InitializerConfig::default(),
            communication_timeout_ms: DEFAULT_COMMUNICATION_TIMEOUT_MS,
        }
    }

    /// Sets the combiner.
    pub fn with_combiner(mut self, combiner: Combiner) -> Self {
        self.combiner = combiner;
        self
    }

    /// Sets the per-sample key bound.
    pub fn with_max_feature_num(mut self, max_feature_num: usize) -> Self {
        self.max_feature_num = Some(max_feature_num);
        self
    }

    /// Sets the initializer for newly admitted rows.
    pub fn with_initializer(mut self, initializer: InitializerConfig) -> Self {
        self.initializer = initializer;
        self
    }

    /// Sets the collective timeout.
    pub fn with_communication_timeout(mut self, timeout: Duration) -> Self {
        self.communication_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Effective per-sample key bound.
    pub fn max_feature_num(&self) -> usize {
        self.max_feature_num
            .unwrap_or_else(|| self.slot_num.saturating_mul(self.max_nnz))
    }

    /// Bound on every collective wait.
    pub fn communication_timeout(&self) -> Duration {
        Duration::from_millis(self.communication_timeout_ms)
    }

    /// Checks every option, warning about legal but unusual values.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_vec_size == 0 || self.embedding_vec_size > MAX_EMBEDDING_VEC_SIZE {
            return Err(EmbeddingError::InvalidConfig(format!(
                "embedding_vec_size must be in 1..={MAX_EMBEDDING_VEC_SIZE}, got {}",
                self.embedding_vec_size
            )));
        }
        if self.embedding_vec_size % 32 != 0 {
            warn!(
                embedding_vec_size = self.embedding_vec_size,
                "embedding_vec_size is not a multiple of 32"
            );
        }
        if self.max_vocabulary_size_per_gpu == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "max_vocabulary_size_per_gpu must be positive".to_string(),
            ));
        }
        if self
            .max_vocabulary_size_per_gpu
            .checked_mul(self.embedding_vec_size)
            .is_none()
        {
            return Err(EmbeddingError::InvalidConfig(format!(
                "max_vocabulary_size_per_gpu * embedding_vec_size overflows ({} * {})",
                self.max_vocabulary_size_per_gpu, self.embedding_vec_size
            )));
        }
        if self.slot_num == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "slot_num must be positive".to_string(),
            ));
        }
        if self.max_nnz == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "max_nnz must be positive".to_string(),
            ));
        }
        if self.slot_num.checked_mul(self.max_nnz).is_none() {
            return Err(EmbeddingError::InvalidConfig(format!(
                "slot_num * max_nnz overflows ({} * {})",
                self.slot_num, self.max_nnz
            )));
        }
        if self.max_feature_num == Some(0) {
            return Err(EmbeddingError::InvalidConfig(
                "max_feature_num must be positive".to_string(),
            ));
        }
        if self.communication_timeout_ms == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "communication_timeout_ms must be positive".to_string(),
            ));
        }
        self.initializer
            .validate()
            .map_err(EmbeddingError::InvalidConfig)?;
        Ok(())
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| EmbeddingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Pretty-printed JSON form.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// An empty shard for worker `rank` sized by this configuration.
    pub fn create_shard(&self, rank: usize) -> Result<EmbeddingShard> {
        EmbeddingShard::with_initializer(
            rank,
            self.max_vocabulary_size_per_gpu,
            self.embedding_vec_size,
            self.initializer.build(),
        )
        .map_err(|e| EmbeddingError::InvalidConfig(e.to_string()))
    }

    /// A collective group of `world_size` workers using this configuration's timeout.
    pub fn collective_group(&self, world_size: usize) -> CollectiveGroup {
        CollectiveGroup::new(world_size).with_timeout(self.communication_timeout())
    }
}
