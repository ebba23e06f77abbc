//! Contiguous per-worker embedding storage.

use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::gradient::ShardGradient;
use crate::initializer::{Initializer, RandomUniformInitializer};
use crate::Key;

/// Whether a step may admit unseen keys into the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Unseen keys get a freshly initialized row; forward state is kept for backward.
    Train,
    /// Unseen keys read as zero rows and the shard is never mutated.
    Inference,
}

/// Rows admitted tentatively by [`EmbeddingShard::stage`].
///
/// Staged rows are readable through [`EmbeddingShard::read_row`] but only
/// become part of the shard on [`EmbeddingShard::commit`]. Dropping the
/// staging discards them, which is how an aborted step leaves the shard
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct StagedRows {
    base: usize,
    dim: usize,
    keys: Vec<Key>,
    values: Vec<f32>,
    index: HashMap<Key, usize>,
}

impl StagedRows {
    /// Number of rows staged.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys staged, in admission order.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn row_of(&self, key: Key) -> Option<usize> {
        self.index.get(&key).map(|&i| self.base + i)
    }

    fn row(&self, local_row: usize) -> Option<&[f32]> {
        let i = local_row.checked_sub(self.base)?;
        if i >= self.keys.len() {
            return None;
        }
        Some(&self.values[i * self.dim..(i + 1) * self.dim])
    }
}

/// A single entry of a [`ShardSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Local row address.
    pub local_row: usize,
    /// Key stored at that row.
    pub key: Key,
    /// Row values.
    pub values: Vec<f32>,
}

/// Enumerable copy of a shard's contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    /// Rank of the worker that owned the shard.
    pub rank: usize,
    /// Embedding dimension.
    pub dim: usize,
    /// Row capacity of the shard.
    pub capacity: usize,
    /// Allocated rows ordered by local row.
    pub entries: Vec<SnapshotEntry>,
}

impl ShardSnapshot {
    /// Number of rows in the snapshot.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the snapshot holds no rows.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(local_row, row)` pairs.
    pub fn rows(&self) -> impl Iterator<Item = (usize, &[f32])> + '_ {
        self.entries
            .iter()
            .map(|entry| (entry.local_row, entry.values.as_slice()))
    }
}

/// The partition of the embedding table owned by one worker.
///
/// Storage is a single `capacity * dim` buffer allocated at construction.
/// Keys are admitted densely: the n-th distinct key gets local row `n`, and
/// two keys never share a row. A shard is an owned value handed by reference
/// to the executor and to the optimizer; `&mut` access is what serializes
/// gradient application against lookups.
///
/// # Example
///
/// ```
/// use sparsekit_shard::EmbeddingShard;
///
/// let mut shard = EmbeddingShard::new(0, 16, 2).unwrap();
/// let row = shard.assign(4, &[1.0, 1.0]).unwrap();
/// assert_eq!(shard.lookup(row).unwrap(), &[1.0, 1.0]);
/// assert_eq!(shard.row_of(4), Some(row));
/// ```
pub struct EmbeddingShard {
    rank: usize,
    capacity: usize,
    dim: usize,
    values: Vec<f32>,
    keys: Vec<Key>,
    index: HashMap<Key, usize>,
    initializer: Arc<dyn Initializer>,
    last_applied_step: Option<u64>,
}

impl std::fmt::Debug for EmbeddingShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingShard")
            .field("rank", &self.rank)
            .field("capacity", &self.capacity)
            .field("dim", &self.dim)
            .field("allocated", &self.keys.len())
            .field("initializer", &self.initializer.name())
            .field("last_applied_step", &self.last_applied_step)
            .finish()
    }
}

impl EmbeddingShard {
    /// Creates a shard for worker `rank` with `capacity` rows of width `dim`.
    ///
    /// # Errors
    ///
    /// [`ShardError::StorageOverflow`] if `capacity * dim` overflows `usize`.
    pub fn new(rank: usize, capacity: usize, dim: usize) -> Result<Self> {
        Self::with_initializer(rank, capacity, dim, Arc::new(RandomUniformInitializer::default()))
    }

    /// Creates a shard whose newly admitted rows come from `initializer`.
    pub fn with_initializer(
        rank: usize,
        capacity: usize,
        dim: usize,
        initializer: Arc<dyn Initializer>,
    ) -> Result<Self> {
        let len = capacity
            .checked_mul(dim)
            .ok_or(ShardError::StorageOverflow { capacity, dim })?;
        tracing::info!(
            rank,
            capacity,
            dim,
            initializer = initializer.name(),
            "Allocating embedding shard"
        );
        Ok(Self {
            rank,
            capacity,
            dim,
            values: vec![0.0; len],
            keys: Vec::new(),
            index: HashMap::new(),
            initializer,
            last_applied_step: None,
        })
    }

    /// Rank of the owning worker.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Maximum number of rows.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Embedding dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of allocated rows.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if no key has been admitted.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Rows still available for new keys.
    pub fn free_rows(&self) -> usize {
        self.capacity - self.keys.len()
    }

    /// Last step whose gradient was applied.
    pub fn last_applied_step(&self) -> Option<u64> {
        self.last_applied_step
    }

    /// Local row holding `key`.
    pub fn row_of(&self, key: Key) -> Option<usize> {
        self.index.get(&key).copied()
    }

    /// Key stored at `local_row`.
    pub fn key_of(&self, local_row: usize) -> Option<Key> {
        self.keys.get(local_row).copied()
    }

    /// Returns the row stored at `local_row`.
    ///
    /// # Errors
    ///
    /// [`ShardError::RowOutOfRange`] if `local_row >= capacity()`.
    pub fn lookup(&self, local_row: usize) -> Result<&[f32]> {
        self.check_in_capacity(local_row)?;
        let start = local_row * self.dim;
        Ok(&self.values[start..start + self.dim])
    }

    /// Writes `values` as the row of `key`, admitting the key if needed.
    ///
    /// Returns the local row used.
    pub fn assign(&mut self, key: Key, values: &[f32]) -> Result<usize> {
        self.check_dim(values.len())?;
        let row = match self.index.get(&key) {
            Some(&row) => row,
            None => {
                if self.keys.len() >= self.capacity {
                    return Err(ShardError::CapacityExceeded {
                        rank: self.rank,
                        capacity: self.capacity,
                        required: self.keys.len() + 1,
                    });
                }
                let row = self.keys.len();
                self.keys.push(key);
                self.index.insert(key, row);
                row
            }
        };
        let start = row * self.dim;
        self.values[start..start + self.dim].copy_from_slice(values);
        Ok(row)
    }

    /// Resolves `keys` to local rows without mutating the shard.
    ///
    /// In [`Mode::Train`] unseen keys are given tentative rows after the
    /// allocated ones, in first-seen order, with values from the initializer.
    /// In [`Mode::Inference`] unseen keys are left unresolved.
    ///
    /// # Errors
    ///
    /// [`ShardError::CapacityExceeded`] if admitting the unseen keys would
    /// overflow the shard. Nothing is staged in that case.
    pub fn stage(&self, keys: &[Key], mode: Mode) -> Result<StagedRows> {
        let mut staged = StagedRows {
            base: self.keys.len(),
            dim: self.dim,
            ..StagedRows::default()
        };
        if mode == Mode::Inference {
            return Ok(staged);
        }

        for &key in keys {
            if self.index.contains_key(&key) || staged.index.contains_key(&key) {
                continue;
            }
            staged.index.insert(key, staged.keys.len());
            staged.keys.push(key);
        }

        let required = self.keys.len() + staged.keys.len();
        if required > self.capacity {
            return Err(ShardError::CapacityExceeded {
                rank: self.rank,
                capacity: self.capacity,
                required,
            });
        }

        staged.values.reserve(staged.keys.len() * self.dim);
        for _ in 0..staged.keys.len() {
            let row = self.initializer.initialize(self.dim);
            self.check_dim(row.len())?;
            staged.values.extend_from_slice(&row);
        }
        Ok(staged)
    }

    /// Local row for `key`, looking in the shard first and then in `staged`.
    pub fn resolve(&self, key: Key, staged: &StagedRows) -> Option<usize> {
        self.row_of(key).or_else(|| staged.row_of(key))
    }

    /// Reads `local_row`, including rows that are only staged.
    pub fn read_row<'a>(&'a self, local_row: usize, staged: &'a StagedRows) -> Result<&'a [f32]> {
        if local_row < self.keys.len() {
            return self.lookup(local_row);
        }
        self.check_in_capacity(local_row)?;
        staged.row(local_row).ok_or(ShardError::UnallocatedRow {
            row: local_row,
            allocated: self.keys.len(),
        })
    }

    /// Makes staged rows permanent.
    ///
    /// # Errors
    ///
    /// [`ShardError::StaleStaging`] if the shard changed since staging.
    pub fn commit(&mut self, staged: StagedRows) -> Result<usize> {
        if staged.base != self.keys.len() {
            return Err(ShardError::StaleStaging {
                staged_base: staged.base,
                allocated: self.keys.len(),
            });
        }
        let admitted = staged.keys.len();
        if admitted == 0 {
            return Ok(0);
        }
        let start = staged.base * self.dim;
        self.values[start..start + staged.values.len()].copy_from_slice(&staged.values);
        for (offset, key) in staged.keys.into_iter().enumerate() {
            self.index.insert(key, staged.base + offset);
            self.keys.push(key);
        }
        tracing::debug!(rank = self.rank, admitted, allocated = self.keys.len(), "Committed new keys");
        Ok(admitted)
    }

    /// Adds `grad` into the row at `local_row`.
    ///
    /// This is the raw entry point for an optimizer: the caller decides the
    /// update (for plain SGD, `-learning_rate * grad`).
    pub fn scatter_add_gradient(&mut self, local_row: usize, grad: &[f32]) -> Result<()> {
        self.check_allocated(local_row)?;
        self.check_dim(grad.len())?;
        let start = local_row * self.dim;
        for (dst, &g) in self.values[start..start + self.dim].iter_mut().zip(grad) {
            *dst += g;
        }
        Ok(())
    }

    /// Checks that `grad` can be applied, without touching the shard.
    ///
    /// # Errors
    ///
    /// - [`ShardError::GradientAlreadyApplied`] unless `grad` is for a later
    ///   step than the last one applied.
    /// - [`ShardError::DimensionMismatch`] if the widths differ.
    /// - [`ShardError::UnallocatedRow`] / [`ShardError::RowOutOfRange`] for
    ///   rows the shard does not hold.
    /// - [`ShardError::KeyMismatch`] if a row now stores a different key than
    ///   the one the gradient was computed for.
    pub fn check_gradient(&self, grad: &ShardGradient) -> Result<()> {
        if let Some(last_applied) = self.last_applied_step {
            if grad.step() <= last_applied {
                return Err(ShardError::GradientAlreadyApplied {
                    step: grad.step(),
                    last_applied,
                });
            }
        }
        self.check_dim(grad.dim())?;
        for (&row, &key) in grad.local_rows().iter().zip(grad.keys()) {
            self.check_allocated(row)?;
            let actual = self.key_of(row);
            if actual != Some(key) {
                return Err(ShardError::KeyMismatch {
                    row,
                    expected: key,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Adds `scale * g` into every row of `grad`.
    ///
    /// The whole gradient is validated with [`check_gradient`](Self::check_gradient)
    /// before any row changes. A gradient can be applied once per step; later
    /// steps must carry a larger step number.
    pub fn apply_gradient(&mut self, grad: &ShardGradient, scale: f32) -> Result<()> {
        self.check_gradient(grad)?;
        for (row, g) in grad.iter() {
            let start = row * self.dim;
            for (dst, &v) in self.values[start..start + self.dim].iter_mut().zip(g) {
                *dst += scale * v;
            }
        }
        self.last_applied_step = Some(grad.step());
        Ok(())
    }

    /// Copies every allocated row out of the shard.
    pub fn snapshot(&self) -> ShardSnapshot {
        let entries = self
            .keys
            .iter()
            .enumerate()
            .map(|(row, &key)| SnapshotEntry {
                local_row: row,
                key,
                values: self.values[row * self.dim..(row + 1) * self.dim].to_vec(),
            })
            .collect();
        ShardSnapshot {
            rank: self.rank,
            dim: self.dim,
            capacity: self.capacity,
            entries,
        }
    }

    /// Checks that `snapshot` can be restored, without touching the shard.
    ///
    /// The snapshot must come from the same rank, have the same dimension,
    /// fit in the capacity, and hold dense rows `0..n` with distinct keys.
    pub fn check_snapshot(&self, snapshot: &ShardSnapshot) -> Result<()> {
        self.validate_snapshot(snapshot).map(|_| ())
    }

    /// Replaces the shard's contents with `snapshot`.
    ///
    /// See [`check_snapshot`](Self::check_snapshot) for what is accepted. The
    /// shard is left unchanged on error.
    pub fn restore(&mut self, snapshot: &ShardSnapshot) -> Result<()> {
        let (entries, index) = self.validate_snapshot(snapshot)?;

        self.values.iter_mut().for_each(|v| *v = 0.0);
        self.keys.clear();
        for entry in entries {
            let start = entry.local_row * self.dim;
            self.values[start..start + self.dim].copy_from_slice(&entry.values);
            self.keys.push(entry.key);
        }
        self.index = index;
        self.last_applied_step = None;
        tracing::info!(rank = self.rank, rows = self.keys.len(), "Restored embedding shard");
        Ok(())
    }

    /// Entries of `snapshot` in row order, with their key index.
    fn validate_snapshot<'a>(
        &self,
        snapshot: &'a ShardSnapshot,
    ) -> Result<(Vec<&'a SnapshotEntry>, HashMap<Key, usize>)> {
        if snapshot.rank != self.rank {
            return Err(ShardError::InvalidSnapshot(format!(
                "snapshot of rank {} cannot be restored into shard {}",
                snapshot.rank, self.rank
            )));
        }
        if snapshot.dim != self.dim {
            return Err(ShardError::InvalidSnapshot(format!(
                "dimension {} does not match shard dimension {}",
                snapshot.dim, self.dim
            )));
        }
        if snapshot.entries.len() > self.capacity {
            return Err(ShardError::InvalidSnapshot(format!(
                "{} rows exceed shard capacity {}",
                snapshot.entries.len(),
                self.capacity
            )));
        }

        let mut entries: Vec<&SnapshotEntry> = snapshot.entries.iter().collect();
        entries.sort_by_key(|entry| entry.local_row);
        let mut index = HashMap::with_capacity(entries.len());
        for (expected_row, entry) in entries.iter().enumerate() {
            if entry.local_row != expected_row {
                return Err(ShardError::InvalidSnapshot(format!(
                    "rows are not dense: expected row {expected_row}, found {}",
                    entry.local_row
                )));
            }
            if entry.values.len() != self.dim {
                return Err(ShardError::InvalidSnapshot(format!(
                    "row {} has {} values, expected {}",
                    entry.local_row,
                    entry.values.len(),
                    self.dim
                )));
            }
            if index.insert(entry.key, entry.local_row).is_some() {
                return Err(ShardError::InvalidSnapshot(format!(
                    "key {} appears more than once",
                    entry.key
                )));
            }
        }
        Ok((entries, index))
    }

    fn check_dim(&self, len: usize) -> Result<()> {
        if len != self.dim {
            return Err(ShardError::DimensionMismatch {
                expected: self.dim,
                actual: len,
            });
        }
        Ok(())
    }

    fn check_in_capacity(&self, local_row: usize) -> Result<()> {
        if local_row >= self.capacity {
            return Err(ShardError::RowOutOfRange {
                row: local_row,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn check_allocated(&self, local_row: usize) -> Result<()> {
        self.check_in_capacity(local_row)?;
        if local_row >= self.keys.len() {
            return Err(ShardError::UnallocatedRow {
                row: local_row,
                allocated: self.keys.len(),
            });
        }
        Ok(())
    }
}
