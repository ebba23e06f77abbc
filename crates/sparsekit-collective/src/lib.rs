//! Collective communication between cooperating workers.
//!
//! Workers run in lock-step rounds: every collective is a barrier from each
//! participant's point of view, and no worker gets its result before every
//! peer has contributed. The [`Collective`] trait is the seam the embedding
//! pipeline is written against; [`ChannelCommunicator`] implements it over
//! tokio channels for workers living in one process.
//!
//! # Example
//!
//! ```
//! use sparsekit_collective::{Collective, CollectiveGroup};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let comms = CollectiveGroup::new(2).build::<Vec<u64>>().unwrap();
//! let handles: Vec<_> = comms
//!     .into_iter()
//!     .map(|mut comm| {
//!         tokio::spawn(async move {
//!             // Send worker `peer` the keys it owns.
//!             let mine = vec![comm.rank() as u64, comm.rank() as u64 + 2];
//!             let outgoing = (0..comm.world_size())
//!                 .map(|peer| mine.iter().copied().filter(|k| *k as usize % 2 == peer).collect())
//!                 .collect();
//!             comm.all_to_all(outgoing).await
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     assert!(handle.await.unwrap().is_ok());
//! }
//! # }
//! ```

use std::fmt;

use async_trait::async_trait;

mod channel;
mod error;

pub use channel::{
    ChannelCommunicator, CollectiveGroup, DEFAULT_LIVENESS_INTERVAL, DEFAULT_TIMEOUT,
};
pub use error::{CommResult, CommunicationError};

/// The kind of collective a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectiveOp {
    /// Every worker receives every worker's contribution.
    AllGather,
    /// Every worker sends a distinct payload to each peer.
    AllToAll,
    /// Synchronization only.
    Barrier,
}

impl fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectiveOp::AllGather => "all_gather",
            CollectiveOp::AllToAll => "all_to_all",
            CollectiveOp::Barrier => "barrier",
        };
        f.write_str(name)
    }
}

/// Blocking collectives over a fixed group of workers.
///
/// Every worker of the group must issue the same sequence of collectives.
/// A worker that fails locally should still take part in the collective it
/// is due at (carrying an abort notice in its payload) so its peers fail
/// fast instead of waiting for a timeout.
#[async_trait]
pub trait Collective<M>: Send
where
    M: Clone + Send + 'static,
{
    /// This worker's rank in `0..world_size()`.
    fn rank(&self) -> usize;

    /// Number of workers in the group.
    fn world_size(&self) -> usize;

    /// Contributes `local` and returns every worker's contribution, indexed by rank.
    async fn all_gather(&mut self, local: M) -> CommResult<Vec<M>>;

    /// Sends `outgoing[peer]` to each peer and returns what each peer sent here,
    /// indexed by sender rank.
    async fn all_to_all(&mut self, outgoing: Vec<M>) -> CommResult<Vec<M>>;

    /// Returns once every worker has reached the barrier.
    async fn barrier(&mut self) -> CommResult<()>;
}
