//! Sparse per-row gradients produced by the backward pass.

use crate::error::{Result, ShardError};
use crate::Key;

/// Gradients for the locally owned rows touched by one step.
///
/// Each local row appears at most once; contributions from every request
/// that read the row are already summed. The `step` tag lets a shard refuse
/// a second application of the same step.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardGradient {
    step: u64,
    dim: usize,
    local_rows: Vec<usize>,
    keys: Vec<Key>,
    values: Vec<f32>,
}

impl ShardGradient {
    /// Creates an empty gradient for `step` with rows of width `dim`.
    pub fn new(step: u64, dim: usize) -> Self {
        Self {
            step,
            dim,
            local_rows: Vec::new(),
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Appends the gradient of one local row.
    pub fn push(&mut self, local_row: usize, key: Key, grad: &[f32]) -> Result<()> {
        if grad.len() != self.dim {
            return Err(ShardError::DimensionMismatch {
                expected: self.dim,
                actual: grad.len(),
            });
        }
        self.local_rows.push(local_row);
        self.keys.push(key);
        self.values.extend_from_slice(grad);
        Ok(())
    }

    /// Step this gradient belongs to.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Width of each row.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.local_rows.len()
    }

    /// True if no local row received a gradient.
    pub fn is_empty(&self) -> bool {
        self.local_rows.is_empty()
    }

    /// Local rows in the order they were pushed.
    pub fn local_rows(&self) -> &[usize] {
        &self.local_rows
    }

    /// Keys matching [`ShardGradient::local_rows`].
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Flattened gradient values, `len() * dim()` long.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Iterates `(local_row, gradient)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[f32])> + '_ {
        self.local_rows
            .iter()
            .copied()
            .zip(self.values.chunks_exact(self.dim.max(1)))
    }

    /// Gradient accumulated for `key`, if the key was read this step.
    pub fn grad_for_key(&self, key: Key) -> Option<&[f32]> {
        let pos = self.keys.iter().position(|&k| k == key)?;
        let start = pos * self.dim;
        Some(&self.values[start..start + self.dim])
    }
}
