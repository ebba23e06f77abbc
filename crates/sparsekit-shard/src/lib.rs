//! Sharded embedding storage for distributed sparse lookup.
//!
//! An embedding table too large for one worker is split by key: the
//! [`KeyRouter`] assigns every key to exactly one worker, and each worker
//! keeps its part in an [`EmbeddingShard`].
//!
//! # Overview
//!
//! - [`KeyRouter`] - `owner = key mod worker_count`
//! - [`EmbeddingShard`] - contiguous, capacity-bounded rows for one worker
//! - [`ShardGradient`] - per-row gradients produced by a backward pass
//! - [`ShardSnapshot`] - enumerable copy of a shard, for persistence
//! - [`initializer`] - values for rows admitted during training
//!
//! # Example
//!
//! ```
//! use sparsekit_shard::{EmbeddingShard, KeyRouter};
//!
//! let router = KeyRouter::new(2).unwrap();
//! let mut shards: Vec<_> = (0..2).map(|rank| EmbeddingShard::new(rank, 128, 4).unwrap()).collect();
//!
//! for key in [4u64, 5, 6] {
//!     let owner = router.owner(key);
//!     shards[owner].assign(key, &[key as f32; 4]).unwrap();
//! }
//! assert_eq!(shards[0].len(), 2);
//! assert_eq!(shards[1].len(), 1);
//! ```

pub mod checkpoint;
mod error;
mod gradient;
pub mod initializer;
mod router;
mod shard;

pub use checkpoint::{load_snapshot, save_snapshot, shard_path};
pub use error::{Result, ShardError};
pub use gradient::ShardGradient;
pub use initializer::{Initializer, InitializerConfig};
pub use router::{owner_of, KeyRouter};
pub use shard::{EmbeddingShard, Mode, ShardSnapshot, SnapshotEntry, StagedRows};

/// A sparse feature key. Keys have global meaning across workers.
pub type Key = u64;
