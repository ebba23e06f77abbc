//! Deterministic key-to-owner routing.

use crate::error::{Result, ShardError};
use crate::Key;

/// Returns the worker that owns `key` in a group of `worker_count` workers.
///
/// Returns 0 when `worker_count` is 0 so callers never divide by zero; use
/// [`KeyRouter::new`] to reject that configuration up front.
#[inline]
pub fn owner_of(key: Key, worker_count: usize) -> usize {
    if worker_count == 0 {
        return 0;
    }
    (key % worker_count as u64) as usize
}

/// Maps every key to exactly one owning worker (`key mod worker_count`).
///
/// The router holds no state besides the worker count, so every worker
/// computes the same owner for the same key.
///
/// # Example
///
/// ```
/// use sparsekit_shard::KeyRouter;
///
/// let router = KeyRouter::new(2).unwrap();
/// assert_eq!(router.owner(4), 0);
/// assert_eq!(router.owner(5), 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRouter {
    worker_count: usize,
}

impl KeyRouter {
    /// Creates a router for `worker_count` workers.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::ZeroWorkers`] if `worker_count` is 0.
    pub fn new(worker_count: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(ShardError::ZeroWorkers);
        }
        Ok(Self { worker_count })
    }

    /// Returns the number of workers.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// True if every key is owned by a single worker.
    pub fn is_single_shard(&self) -> bool {
        self.worker_count == 1
    }

    /// Owner of `key`.
    #[inline]
    pub fn owner(&self, key: Key) -> usize {
        owner_of(key, self.worker_count)
    }

    /// Whether `key` is owned by `rank`.
    #[inline]
    pub fn is_local(&self, key: Key, rank: usize) -> bool {
        self.owner(key) == rank
    }

    /// Groups the positions of `keys` by owner, keeping input order within each group.
    pub fn partition(&self, keys: &[Key]) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.worker_count];
        for (pos, &key) in keys.iter().enumerate() {
            groups[self.owner(key)].push(pos);
        }
        groups
    }
}
