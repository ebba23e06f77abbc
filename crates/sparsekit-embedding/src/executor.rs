//! Per-worker driver of the distributed embedding forward and backward passes.

use serde::Serialize;
use sparsekit_collective::Collective;
use sparsekit_shard::{EmbeddingShard, KeyRouter, Mode, ShardGradient, StagedRows};
use tracing::{debug, error};

use crate::combiner::accumulate;
use crate::config::DistributedEmbeddingConfig;
use crate::csr::{CsrIndex, IndexConverter};
use crate::dispatch::AllGatherDispatcher;
use crate::error::{EmbeddingError, Result};
use crate::input::SparseBatch;
use crate::reduce_scatter::{PartialSums, ReduceScatterDispatcher};
use crate::wire::{RowVector, WireMessage};

/// Counters of one forward pass on one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwardStats {
    /// Step number.
    pub step: u64,
    /// Keys this worker requested.
    pub requested_keys: usize,
    /// Requests from all workers that this worker served.
    pub owned_requests: usize,
    /// Distinct keys among the owned requests.
    pub unique_keys: usize,
    /// Keys admitted into the shard by this step.
    pub admitted_keys: usize,
    /// Owned keys read as zero rows during inference.
    pub unseen_keys: usize,
    /// Partial rows sent during reduce-scatter.
    pub partial_rows: usize,
}

/// Combined embeddings of one worker's batch.
///
/// Shape `[batch_size, slot_num, dim]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingOutput {
    batch_size: usize,
    slot_num: usize,
    dim: usize,
    values: Vec<f32>,
    stats: ForwardStats,
}

impl EmbeddingOutput {
    /// `[batch_size, slot_num, dim]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.batch_size, self.slot_num, self.dim]
    }

    /// Flat values.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Consumes the output, returning the flat values.
    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    /// Combined vector of `(sample, slot)`.
    pub fn vector(&self, sample: usize, slot: usize) -> Option<&[f32]> {
        if sample >= self.batch_size || slot >= self.slot_num {
            return None;
        }
        self.row(sample * self.slot_num + slot)
    }

    /// Combined vector of output row `row_index`.
    pub fn row(&self, row_index: usize) -> Option<&[f32]> {
        let start = row_index.checked_mul(self.dim)?;
        self.values.get(start..start.checked_add(self.dim)?)
    }

    /// Counters of the pass that produced this output.
    pub fn stats(&self) -> &ForwardStats {
        &self.stats
    }
}

/// What backward needs from the matching training forward.
#[derive(Debug)]
struct ForwardState {
    step: u64,
    csr: CsrIndex,
    valid_counts: Vec<u32>,
    received_rows: Vec<Vec<usize>>,
    sent_rows: Vec<Vec<usize>>,
}

/// Runs distributed lookups for one worker of a group.
///
/// Every worker of the group must call [`forward`](Self::forward) and
/// [`backward`](Self::backward) in the same sequence. A worker that fails
/// locally still takes part in the collective it is due at, so its peers
/// fail the step with [`CommunicationError::PeerAborted`] instead of hanging.
///
/// [`CommunicationError::PeerAborted`]: sparsekit_collective::CommunicationError::PeerAborted
pub struct DistributedExecutor<C> {
    config: DistributedEmbeddingConfig,
    comm: C,
    dispatcher: AllGatherDispatcher,
    reducer: ReduceScatterDispatcher,
    step: u64,
    state: Option<ForwardState>,
}

impl<C> std::fmt::Debug for DistributedExecutor<C>
where
    C: Collective<WireMessage>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedExecutor")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .field("step", &self.step)
            .field("has_forward_state", &self.state.is_some())
            .finish()
    }
}

impl<C> DistributedExecutor<C>
where
    C: Collective<WireMessage>,
{
    /// Creates an executor for the worker behind `comm`.
    pub fn new(config: DistributedEmbeddingConfig, comm: C) -> Result<Self> {
        config.validate()?;
        let rank = comm.rank();
        let world_size = comm.world_size();
        let router = KeyRouter::new(world_size)
            .map_err(|e| EmbeddingError::InvalidConfig(e.to_string()))?;
        if rank >= world_size {
            return Err(EmbeddingError::InvalidConfig(format!(
                "rank {rank} outside a group of {world_size}"
            )));
        }
        Ok(Self {
            dispatcher: AllGatherDispatcher::new(router, rank),
            reducer: ReduceScatterDispatcher::new(rank, world_size, config.embedding_vec_size),
            config,
            comm,
            step: 0,
            state: None,
        })
    }

    /// An empty shard matching this executor.
    pub fn create_shard(&self) -> Result<EmbeddingShard> {
        self.config.create_shard(self.rank())
    }

    /// Embedding lookup for `batch`.
    ///
    /// In [`Mode::Train`] keys seen for the first time are admitted into
    /// `shard`, but only once the whole step has succeeded; the state needed
    /// by [`backward`](Self::backward) is kept. In [`Mode::Inference`] the
    /// shard is never mutated and unseen keys read as zero rows.
    ///
    /// # Errors
    ///
    /// - [`EmbeddingError::InputShape`] if `batch` is malformed; no shard
    ///   access takes place.
    /// - [`EmbeddingError::OutOfRange`] if the shard cannot admit the new keys.
    /// - [`EmbeddingError::Communication`] if a collective failed or a peer
    ///   aborted the step.
    pub async fn forward(
        &mut self,
        shard: &mut EmbeddingShard,
        batch: &SparseBatch,
        mode: Mode,
    ) -> Result<EmbeddingOutput> {
        // Gradients of this step must outrank whatever the shard last applied.
        self.step = self.step.max(shard.last_applied_step().unwrap_or(0)) + 1;
        self.state = None;
        let step = self.step;
        let rank = self.rank();

        let validated = match self.check_shard(shard).and_then(|()| batch.validate(&self.config)) {
            Ok(validated) => validated,
            Err(err) => {
                error!(rank, step, error = %err, "Aborting forward before dispatch");
                self.dispatcher.abort(&mut self.comm, &err.to_string()).await;
                return Err(err);
            }
        };
        let batch_size = validated.batch_size();
        let output_rows = validated.num_rows();
        let (requests, valid_counts) = validated.into_parts();

        let plan = self.dispatcher.dispatch(&mut self.comm, &requests).await?;

        let staged = match shard.stage(&plan.keys(), mode) {
            Ok(staged) => staged,
            Err(err) => {
                let err = EmbeddingError::from(err);
                error!(rank, step, error = %err, "Aborting forward before reduce-scatter");
                self.reducer.abort(&mut self.comm, &err.to_string()).await;
                return Err(err);
            }
        };
        let csr = IndexConverter::convert(plan.owned(), |key| shard.resolve(key, &staged));

        let partials = match self.combine_local(shard, &staged, &csr) {
            Ok(partials) => partials,
            Err(err) => {
                error!(rank, step, error = %err, "Aborting forward before reduce-scatter");
                self.reducer.abort(&mut self.comm, &err.to_string()).await;
                return Err(err);
            }
        };
        let partial_rows = partials.num_rows();

        let reduced = self
            .reducer
            .reduce_scatter(&mut self.comm, partials, output_rows)
            .await?;

        let dim = self.config.embedding_vec_size;
        let mut values = reduced.sums;
        for (row, &count) in valid_counts.iter().enumerate() {
            self.config
                .combiner
                .finalize(&mut values[row * dim..(row + 1) * dim], count);
        }

        let admitted_keys = match mode {
            Mode::Train => shard.commit(staged)?,
            Mode::Inference => 0,
        };

        let stats = ForwardStats {
            step,
            requested_keys: requests.len(),
            owned_requests: plan.len(),
            unique_keys: csr.num_rows(),
            admitted_keys,
            unseen_keys: csr.unresolved(),
            partial_rows,
        };
        debug!(
            rank,
            step,
            requested = stats.requested_keys,
            owned = stats.owned_requests,
            unique = stats.unique_keys,
            admitted = stats.admitted_keys,
            unseen = stats.unseen_keys,
            partial_rows,
            "Forward complete"
        );

        if mode == Mode::Train {
            self.state = Some(ForwardState {
                step,
                csr,
                valid_counts,
                received_rows: reduced.received_rows,
                sent_rows: reduced.sent_rows,
            });
        }

        Ok(EmbeddingOutput {
            batch_size,
            slot_num: self.config.slot_num,
            dim,
            values,
            stats,
        })
    }

    /// Gradient of the last training forward with respect to this worker's rows.
    ///
    /// `grad` has the shape of that forward's output. The returned gradient
    /// holds one aggregated entry per touched local row and is tagged with
    /// the forward's step number; applying it is up to the optimizer.
    ///
    /// # Errors
    ///
    /// - [`EmbeddingError::MissingForwardState`] without a preceding training
    ///   forward, or when backward already ran for it.
    /// - [`EmbeddingError::GradientShape`] if `grad` has the wrong length.
    /// - [`EmbeddingError::Communication`] if the exchange failed.
    pub async fn backward(&mut self, grad: &[f32]) -> Result<ShardGradient> {
        let rank = self.rank();
        let state = match self.state.take() {
            Some(state) => state,
            None => {
                let err = EmbeddingError::MissingForwardState;
                error!(rank, step = self.step, error = %err, "Aborting backward");
                self.reducer.abort(&mut self.comm, &err.to_string()).await;
                return Err(err);
            }
        };

        let dim = self.config.embedding_vec_size;
        let expected = state.valid_counts.len() * dim;
        if grad.len() != expected {
            let err = EmbeddingError::GradientShape {
                expected,
                actual: grad.len(),
            };
            error!(rank, step = state.step, error = %err, "Aborting backward");
            self.reducer.abort(&mut self.comm, &err.to_string()).await;
            return Err(err);
        }

        let combiner = self.config.combiner;
        let outgoing = state
            .received_rows
            .iter()
            .map(|rows| {
                rows.iter()
                    .map(|&row_index| {
                        let factor = combiner.row_scale(state.valid_counts[row_index]);
                        let start = row_index * dim;
                        RowVector {
                            row_index,
                            values: grad[start..start + dim].iter().map(|g| g * factor).collect(),
                        }
                    })
                    .collect()
            })
            .collect();

        let incoming = self
            .reducer
            .exchange_gradients(&mut self.comm, outgoing, &state.sent_rows)
            .await?;

        let mut gradient = ShardGradient::new(state.step, dim);
        let mut row_grad = vec![0.0f32; dim];
        for row in state.csr.iter() {
            let Some(local_row) = row.local_row else {
                continue;
            };
            row_grad.fill(0.0);
            for entry in row.entries {
                if let Some(g) = find_row(&incoming[entry.origin], entry.row_index) {
                    accumulate(&mut row_grad, g);
                }
            }
            gradient.push(local_row, row.key, &row_grad)?;
        }

        debug!(rank, step = state.step, rows = gradient.len(), "Backward complete");
        Ok(gradient)
    }

    /// This worker's rank.
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Workers in the group.
    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    /// The configuration.
    pub fn config(&self) -> &DistributedEmbeddingConfig {
        &self.config
    }

    /// The last forward's step number.
    ///
    /// Step numbers start after the shard's last applied step, so a new
    /// executor can take over a shard that was already trained.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// True if a training forward awaits its backward.
    pub fn has_forward_state(&self) -> bool {
        self.state.is_some()
    }

    /// Forgets the last training forward; a following backward fails with
    /// [`EmbeddingError::MissingForwardState`].
    pub fn clear_forward_state(&mut self) {
        self.state = None;
    }

    /// Swaps in a fresh communicator for the same rank and group size,
    /// dropping any pending forward state.
    pub fn replace_communicator(&mut self, comm: C) -> Result<C> {
        if comm.rank() != self.rank() || comm.world_size() != self.world_size() {
            return Err(EmbeddingError::InvalidConfig(format!(
                "communicator for rank {} of {} cannot replace rank {} of {}",
                comm.rank(),
                comm.world_size(),
                self.rank(),
                self.world_size()
            )));
        }
        self.state = None;
        Ok(std::mem::replace(&mut self.comm, comm))
    }

    fn check_shard(&self, shard: &EmbeddingShard) -> Result<()> {
        if shard.rank() != self.rank() || shard.dim() != self.config.embedding_vec_size {
            return Err(EmbeddingError::InvalidConfig(format!(
                "shard (rank {}, dim {}) does not belong to worker {} with dim {}",
                shard.rank(),
                shard.dim(),
                self.rank(),
                self.config.embedding_vec_size
            )));
        }
        Ok(())
    }

    /// Sums owned rows into per-origin partials, walking the CSR index.
    fn combine_local(
        &self,
        shard: &EmbeddingShard,
        staged: &StagedRows,
        csr: &CsrIndex,
    ) -> Result<PartialSums> {
        let mut partials = PartialSums::new(self.world_size(), self.config.embedding_vec_size);
        for row in csr.iter() {
            let Some(local_row) = row.local_row else {
                continue;
            };
            let values = shard.read_row(local_row, staged)?;
            for entry in row.entries {
                partials.add(entry.origin, entry.row_index, values);
            }
        }
        Ok(partials)
    }
}

/// Gradient rows arrive in ascending row order, as the partials were sent.
fn find_row(rows: &[RowVector], row_index: usize) -> Option<&[f32]> {
    rows.binary_search_by_key(&row_index, |r| r.row_index)
        .ok()
        .map(|i| rows[i].values.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combiner::Combiner;
    use sparsekit_collective::{ChannelCommunicator, CollectiveGroup};
    use sparsekit_shard::InitializerConfig;

    fn single(config: DistributedEmbeddingConfig) -> DistributedExecutor<ChannelCommunicator<WireMessage>> {
        let mut comms = CollectiveGroup::new(1).build::<WireMessage>().unwrap();
        DistributedExecutor::new(config, comms.pop().unwrap()).unwrap()
    }

    fn config(combiner: Combiner) -> DistributedEmbeddingConfig {
        DistributedEmbeddingConfig::new(combiner, 8, 2, 2, 2)
            .with_initializer(InitializerConfig::Zeros)
    }

    #[tokio::test]
    async fn test_single_worker_sum() {
        let mut executor = single(config(Combiner::Sum));
        let mut shard = executor.create_shard().unwrap();
        shard.assign(1, &[1.0, 2.0]).unwrap();
        shard.assign(2, &[10.0, 20.0]).unwrap();

        let batch = SparseBatch::from_rows(&[vec![1, 2], vec![2]], 2);
        let output = executor.forward(&mut shard, &batch, Mode::Train).await.unwrap();
        assert_eq!(output.shape(), [1, 2, 2]);
        assert_eq!(output.vector(0, 0), Some(&[11.0, 22.0][..]));
        assert_eq!(output.vector(0, 1), Some(&[10.0, 20.0][..]));
        assert_eq!(output.stats().unique_keys, 2);
        assert!(executor.has_forward_state());
    }

    #[tokio::test]
    async fn test_train_admits_and_inference_does_not() {
        let mut executor = single(config(Combiner::Mean));
        let mut shard = executor.create_shard().unwrap();
        shard.assign(1, &[4.0, 4.0]).unwrap();
        let batch = SparseBatch::from_rows(&[vec![1, 9], vec![]], 2);

        let output = executor
            .forward(&mut shard, &batch, Mode::Inference)
            .await
            .unwrap();
        // The unseen key reads as zero and still counts for the mean.
        assert_eq!(output.vector(0, 0), Some(&[2.0, 2.0][..]));
        assert_eq!(output.vector(0, 1), Some(&[0.0, 0.0][..]));
        assert_eq!(output.stats().unseen_keys, 1);
        assert_eq!(shard.len(), 1);
        assert!(!executor.has_forward_state());

        let output = executor.forward(&mut shard, &batch, Mode::Train).await.unwrap();
        assert_eq!(output.stats().admitted_keys, 1);
        assert_eq!(shard.len(), 2);
        assert!(shard.row_of(9).is_some());
    }

    #[tokio::test]
    async fn test_backward_scales_mean() {
        let mut executor = single(config(Combiner::Mean));
        let mut shard = executor.create_shard().unwrap();
        let batch = SparseBatch::from_rows(&[vec![1, 2], vec![1]], 2);
        executor.forward(&mut shard, &batch, Mode::Train).await.unwrap();

        let grad = executor.backward(&[1.0; 4]).await.unwrap();
        assert_eq!(grad.step(), 1);
        assert_eq!(grad.len(), 2);
        // Key 1 reads into a 2-key row and a 1-key row.
        assert_eq!(grad.grad_for_key(1), Some(&[1.5, 1.5][..]));
        assert_eq!(grad.grad_for_key(2), Some(&[0.5, 0.5][..]));
        assert!(!executor.has_forward_state());
    }

    #[tokio::test]
    async fn test_backward_requires_forward() {
        let mut executor = single(config(Combiner::Sum));
        assert!(matches!(
            executor.backward(&[]).await,
            Err(EmbeddingError::MissingForwardState)
        ));
    }

    #[tokio::test]
    async fn test_gradient_shape_checked() {
        let mut executor = single(config(Combiner::Sum));
        let mut shard = executor.create_shard().unwrap();
        let batch = SparseBatch::from_rows(&[vec![1], vec![2]], 2);
        executor.forward(&mut shard, &batch, Mode::Train).await.unwrap();
        assert!(matches!(
            executor.backward(&[1.0; 3]).await,
            Err(EmbeddingError::GradientShape {
                expected: 4,
                actual: 3
            })
        ));
        // The failed backward consumed the state.
        assert!(!executor.has_forward_state());
    }

    #[tokio::test]
    async fn test_capacity_exceeded_leaves_shard_untouched() {
        let mut executor = single(
            DistributedEmbeddingConfig::new(Combiner::Sum, 2, 2, 1, 3)
                .with_initializer(InitializerConfig::Zeros),
        );
        let mut shard = executor.create_shard().unwrap();
        let batch = SparseBatch::from_rows(&[vec![1, 2, 3]], 3);
        assert!(matches!(
            executor.forward(&mut shard, &batch, Mode::Train).await,
            Err(EmbeddingError::OutOfRange(_))
        ));
        assert!(shard.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_shard_rejected() {
        let mut executor = single(config(Combiner::Sum));
        let mut shard = EmbeddingShard::new(0, 8, 3).unwrap();
        let batch = SparseBatch::from_rows(&[vec![1], vec![]], 2);
        assert!(matches!(
            executor.forward(&mut shard, &batch, Mode::Train).await,
            Err(EmbeddingError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_new_executor_continues_trained_shard() {
        let mut first = single(config(Combiner::Sum));
        let mut shard = first.create_shard().unwrap();
        let batch = SparseBatch::from_rows(&[vec![1], vec![2]], 2);
        for _ in 0..3 {
            first.forward(&mut shard, &batch, Mode::Train).await.unwrap();
            let grad = first.backward(&[1.0; 4]).await.unwrap();
            shard.apply_gradient(&grad, -0.1).unwrap();
        }
        assert_eq!(shard.last_applied_step(), Some(3));

        let mut second = single(config(Combiner::Sum));
        second.forward(&mut shard, &batch, Mode::Train).await.unwrap();
        assert_eq!(second.step(), 4);
        let grad = second.backward(&[1.0; 4]).await.unwrap();
        shard.apply_gradient(&grad, -0.1).unwrap();
        assert_eq!(shard.last_applied_step(), Some(4));
    }

    #[test]
    fn test_output_row_bounds() {
        let output = EmbeddingOutput {
            batch_size: 1,
            slot_num: 2,
            dim: 2,
            values: vec![1.0, 2.0, 3.0, 4.0],
            stats: ForwardStats::default(),
        };
        assert_eq!(output.row(1), Some(&[3.0, 4.0][..]));
        assert_eq!(output.row(2), None);
        assert_eq!(output.row(usize::MAX / 2), None);
        assert_eq!(output.vector(1, 0), None);
    }

    #[test]
    fn test_find_row() {
        let rows = vec![
            RowVector {
                row_index: 1,
                values: vec![1.0],
            },
            RowVector {
                row_index: 4,
                values: vec![4.0],
            },
        ];
        assert_eq!(find_row(&rows, 4), Some(&[4.0][..]));
        assert_eq!(find_row(&rows, 2), None);
    }
}
