//! Distributed sparse embedding lookup.
//!
//! Each worker of a group owns the embedding rows of the keys routed to it
//! (`key % world_size`). A forward pass runs in four phases on every worker:
//!
//! 1. **Dispatch**: the worker's key requests are all-gathered and each
//!    worker keeps the requests for keys it owns ([`AllGatherDispatcher`]).
//! 2. **Index**: owned requests are grouped by key into a CSR index from
//!    shard rows to the output rows that read them ([`IndexConverter`]).
//! 3. **Combine**: owned rows are summed into per-origin partial sums.
//! 4. **Reduce-scatter**: partial sums travel back to the requesting worker,
//!    which adds them up and applies the [`Combiner`]
//!    ([`ReduceScatterDispatcher`]).
//!
//! Backward replays the same plan in reverse and yields a
//! [`ShardGradient`](sparsekit_shard::ShardGradient) per worker.
//!
//! [`DistributedExecutor`] drives one worker; [`LocalCluster`] runs a whole
//! group inside one process.

pub mod cluster;
pub mod combiner;
pub mod config;
pub mod csr;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod input;
pub mod reduce_scatter;
pub mod wire;

pub use cluster::LocalCluster;
pub use combiner::Combiner;
pub use config::{DistributedEmbeddingConfig, MAX_EMBEDDING_VEC_SIZE};
pub use csr::{CsrEntry, CsrIndex, IndexConverter};
pub use dispatch::{AllGatherDispatcher, DispatchPlan, OwnedRequest};
pub use error::{EmbeddingError, Result};
pub use executor::{DistributedExecutor, EmbeddingOutput, ForwardStats};
pub use input::{SparseBatch, ValidatedBatch};
pub use reduce_scatter::{PartialSums, ReduceScatterDispatcher, Reduced};
pub use wire::{KeyRequest, RowVector, WireMessage};

pub use sparsekit_shard::Mode;
