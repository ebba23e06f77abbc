//! Sparse input of one worker and its validation.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use sparsekit_shard::Key;

use crate::config::DistributedEmbeddingConfig;
use crate::error::{EmbeddingError, Result};
use crate::wire::KeyRequest;

/// COO-style sparse input of one worker.
///
/// Row `r` of the dense view is `(sample, slot) = (r / slot_num, r % slot_num)`;
/// the column is the position of the key inside that slot. `dense_shape` is
/// `(batch_size * slot_num, max_nnz)` or narrower.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseBatch {
    /// Keys, one per entry.
    pub values: Vec<Key>,
    /// `(row, column)` of each entry.
    pub indices: Vec<(usize, usize)>,
    /// `(rows, columns)` of the dense view.
    pub dense_shape: (usize, usize),
}

impl SparseBatch {
    /// Creates a batch from raw COO parts.
    pub fn new(values: Vec<Key>, indices: Vec<(usize, usize)>, dense_shape: (usize, usize)) -> Self {
        Self {
            values,
            indices,
            dense_shape,
        }
    }

    /// Builds a batch from the keys of each dense row.
    ///
    /// `rows[r]` holds the keys of row `r` in column order. The column bound is
    /// `max_nnz`; rows longer than that produce a batch that fails validation.
    ///
    /// ```
    /// use sparsekit_embedding::SparseBatch;
    ///
    /// let batch = SparseBatch::from_rows(&[vec![4, 5], vec![], vec![7]], 2);
    /// assert_eq!(batch.values, vec![4, 5, 7]);
    /// assert_eq!(batch.indices, vec![(0, 0), (0, 1), (2, 0)]);
    /// assert_eq!(batch.dense_shape, (3, 2));
    /// ```
    pub fn from_rows(rows: &[Vec<Key>], max_nnz: usize) -> Self {
        let mut values = Vec::new();
        let mut indices = Vec::new();
        for (row, keys) in rows.iter().enumerate() {
            for (col, &key) in keys.iter().enumerate() {
                values.push(key);
                indices.push((row, col));
            }
        }
        Self::new(values, indices, (rows.len(), max_nnz))
    }

    /// A batch of `rows` dense rows without any key.
    pub fn empty(rows: usize, max_nnz: usize) -> Self {
        Self::new(Vec::new(), Vec::new(), (rows, max_nnz))
    }

    /// Number of keys.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Checks the batch against `config` and flattens it into key requests.
    ///
    /// # Errors
    ///
    /// - [`EmbeddingError::InputShape`] on the first violated rule.
    /// - [`EmbeddingError::InvalidConfig`] if `config` has no slots.
    pub fn validate(&self, config: &DistributedEmbeddingConfig) -> Result<ValidatedBatch> {
        if config.slot_num == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "slot_num must be positive".to_string(),
            ));
        }
        if self.values.len() != self.indices.len() {
            return Err(shape_error(format!(
                "{} values but {} indices",
                self.values.len(),
                self.indices.len()
            )));
        }
        let (rows, cols) = self.dense_shape;
        if rows % config.slot_num != 0 {
            return Err(shape_error(format!(
                "dense_shape rows {rows} is not a multiple of slot_num {}",
                config.slot_num
            )));
        }
        if cols > config.max_nnz {
            return Err(shape_error(format!(
                "dense_shape columns {cols} exceed max_nnz {}",
                config.max_nnz
            )));
        }

        let batch_size = rows / config.slot_num;
        let max_feature_num = config.max_feature_num();
        let mut seen = HashSet::with_capacity(self.indices.len());
        let mut valid_counts = vec![0u32; rows];
        let mut sample_counts = vec![0usize; batch_size];
        let mut requests = Vec::with_capacity(self.values.len());

        for (&key, &(row, col)) in self.values.iter().zip(&self.indices) {
            if row >= rows || col >= cols {
                return Err(shape_error(format!(
                    "index ({row}, {col}) outside dense_shape ({rows}, {cols})"
                )));
            }
            if !seen.insert((row, col)) {
                return Err(shape_error(format!("duplicate index ({row}, {col})")));
            }
            let sample = row / config.slot_num;
            sample_counts[sample] += 1;
            if sample_counts[sample] > max_feature_num {
                return Err(shape_error(format!(
                    "sample {sample} has more than max_feature_num {max_feature_num} keys"
                )));
            }
            valid_counts[row] += 1;
            requests.push(KeyRequest::new(key, row));
        }

        Ok(ValidatedBatch {
            batch_size,
            slot_num: config.slot_num,
            requests,
            valid_counts,
        })
    }
}

fn shape_error(message: String) -> EmbeddingError {
    EmbeddingError::InputShape(message)
}

/// A batch that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    batch_size: usize,
    slot_num: usize,
    requests: Vec<KeyRequest>,
    valid_counts: Vec<u32>,
}

impl ValidatedBatch {
    /// Samples in the batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Slots per sample.
    pub fn slot_num(&self) -> usize {
        self.slot_num
    }

    /// Output rows, `batch_size * slot_num`.
    pub fn num_rows(&self) -> usize {
        self.valid_counts.len()
    }

    /// One request per key, in input order.
    pub fn requests(&self) -> &[KeyRequest] {
        &self.requests
    }

    /// Keys per output row.
    pub fn valid_counts(&self) -> &[u32] {
        &self.valid_counts
    }

    pub(crate) fn into_parts(self) -> (Vec<KeyRequest>, Vec<u32>) {
        (self.requests, self.valid_counts)
    }
}
