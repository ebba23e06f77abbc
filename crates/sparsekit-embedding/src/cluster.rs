//! In-process group of workers, one tokio task per worker and step.

use std::path::Path;

use futures::future::join_all;
use sparsekit_collective::{ChannelCommunicator, CollectiveGroup};
use sparsekit_shard::checkpoint::{load_snapshot, save_snapshot, shard_path};
use sparsekit_shard::{
    EmbeddingShard, Key, KeyRouter, Mode, ShardError, ShardGradient, ShardSnapshot,
};
use tracing::{info, warn};

use crate::config::DistributedEmbeddingConfig;
use crate::error::{EmbeddingError, Result};
use crate::executor::{DistributedExecutor, EmbeddingOutput};
use crate::input::SparseBatch;
use crate::wire::WireMessage;

type LocalExecutor = DistributedExecutor<ChannelCommunicator<WireMessage>>;

struct Worker {
    executor: LocalExecutor,
    shard: EmbeddingShard,
}

/// A group of workers living in one process.
///
/// Each call runs one step on every worker concurrently. After a failed step
/// the group's communicators are rebuilt, so the next step starts from a
/// clean round; pending forward state is dropped with them.
///
/// ```
/// use sparsekit_embedding::{Combiner, DistributedEmbeddingConfig, LocalCluster, SparseBatch};
/// use sparsekit_shard::Mode;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = DistributedEmbeddingConfig::new(Combiner::Sum, 16, 4, 1, 2);
/// let mut cluster = LocalCluster::new(config, 2).unwrap();
/// let batches = vec![
///     SparseBatch::from_rows(&[vec![1, 2]], 2),
///     SparseBatch::from_rows(&[vec![3]], 2),
/// ];
/// let outputs = cluster.forward(batches, Mode::Train).await.unwrap();
/// assert_eq!(outputs[0].shape(), [1, 1, 4]);
/// # }
/// ```
pub struct LocalCluster {
    config: DistributedEmbeddingConfig,
    group: CollectiveGroup,
    router: KeyRouter,
    workers: Vec<Worker>,
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("world_size", &self.world_size())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl LocalCluster {
    /// Creates `world_size` workers with empty shards.
    pub fn new(config: DistributedEmbeddingConfig, world_size: usize) -> Result<Self> {
        config.validate()?;
        let router = KeyRouter::new(world_size)
            .map_err(|e| EmbeddingError::InvalidConfig(e.to_string()))?;
        let group = config.collective_group(world_size);
        let comms = group.build::<WireMessage>()?;

        let workers = comms
            .into_iter()
            .map(|comm| {
                let executor = DistributedExecutor::new(config.clone(), comm)?;
                let shard = executor.create_shard()?;
                Ok(Worker { executor, shard })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            world_size,
            capacity = config.max_vocabulary_size_per_gpu,
            dim = config.embedding_vec_size,
            combiner = %config.combiner,
            "Created local cluster"
        );
        Ok(Self {
            config,
            group,
            router,
            workers,
        })
    }

    /// Workers in the group.
    pub fn world_size(&self) -> usize {
        self.router.worker_count()
    }

    /// The shared configuration.
    pub fn config(&self) -> &DistributedEmbeddingConfig {
        &self.config
    }

    /// The router deciding key ownership.
    pub fn router(&self) -> &KeyRouter {
        &self.router
    }

    /// Shard of worker `rank`.
    pub fn shard(&self, rank: usize) -> Option<&EmbeddingShard> {
        self.workers.get(rank).map(|w| &w.shard)
    }

    /// Mutable shard of worker `rank`.
    pub fn shard_mut(&mut self, rank: usize) -> Option<&mut EmbeddingShard> {
        self.workers.get_mut(rank).map(|w| &mut w.shard)
    }

    /// Stores `values` as the row of `key` on its owner's shard.
    pub fn assign(&mut self, key: Key, values: &[f32]) -> Result<usize> {
        let owner = self.router.owner(key);
        let shard = self.shard_mut(owner).ok_or_else(lost_worker)?;
        Ok(shard.assign(key, values)?)
    }

    /// Row of `key` on its owner's shard, if admitted.
    pub fn row(&self, key: Key) -> Option<&[f32]> {
        let shard = self.shard(self.router.owner(key))?;
        shard.lookup(shard.row_of(key)?).ok()
    }

    /// Forward pass on every worker; `batches[rank]` is worker `rank`'s input.
    pub async fn forward(
        &mut self,
        batches: Vec<SparseBatch>,
        mode: Mode,
    ) -> Result<Vec<EmbeddingOutput>> {
        self.check_inputs(batches.len(), "batches")?;
        self.run(batches, move |mut worker, batch| async move {
            let result = worker.executor.forward(&mut worker.shard, &batch, mode).await;
            (worker, result)
        })
        .await
    }

    /// Backward pass on every worker; `grads[rank]` is the upstream gradient
    /// of worker `rank`'s last training output.
    pub async fn backward(&mut self, grads: Vec<Vec<f32>>) -> Result<Vec<ShardGradient>> {
        self.check_inputs(grads.len(), "gradients")?;
        self.run(grads, |mut worker, grad| async move {
            let result = worker.executor.backward(&grad).await;
            (worker, result)
        })
        .await
    }

    /// Adds `scale * grads[rank]` to each worker's shard.
    ///
    /// Every gradient is checked before any shard changes.
    pub fn apply_gradients(&mut self, grads: &[ShardGradient], scale: f32) -> Result<()> {
        self.check_inputs(grads.len(), "gradients")?;
        for (worker, grad) in self.workers.iter().zip(grads) {
            check_gradient(&worker.shard, grad)?;
        }
        for (worker, grad) in self.workers.iter_mut().zip(grads) {
            worker.shard.apply_gradient(grad, scale)?;
        }
        Ok(())
    }

    /// Copies every shard.
    pub fn snapshots(&self) -> Vec<ShardSnapshot> {
        self.workers.iter().map(|w| w.shard.snapshot()).collect()
    }

    /// Replaces every shard's content; `snapshots[rank]` goes to worker `rank`.
    ///
    /// Every snapshot is checked before any shard changes: it must come from
    /// the same rank and hold only keys that worker owns. Pending forward
    /// state is dropped, since its rows no longer describe the shards.
    pub fn restore(&mut self, snapshots: &[ShardSnapshot]) -> Result<()> {
        self.check_inputs(snapshots.len(), "snapshots")?;
        for (worker, snapshot) in self.workers.iter().zip(snapshots) {
            worker.shard.check_snapshot(snapshot)?;
            self.check_ownership(snapshot)?;
        }
        for (worker, snapshot) in self.workers.iter_mut().zip(snapshots) {
            worker.shard.restore(snapshot)?;
            worker.executor.clear_forward_state();
        }
        Ok(())
    }

    /// Writes one checkpoint file per shard into `dir`.
    pub fn save_checkpoint(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(|source| EmbeddingError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for worker in &self.workers {
            save_snapshot(&shard_path(dir, worker.shard.rank()), &worker.shard.snapshot())?;
        }
        info!(path = %dir.display(), shards = self.workers.len(), "Saved checkpoint");
        Ok(())
    }

    /// Restores every shard from the files written by [`save_checkpoint`](Self::save_checkpoint).
    pub fn load_checkpoint(&mut self, dir: &Path) -> Result<()> {
        let snapshots = (0..self.world_size())
            .map(|rank| load_snapshot(&shard_path(dir, rank)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.restore(&snapshots)?;
        info!(path = %dir.display(), shards = snapshots.len(), "Loaded checkpoint");
        Ok(())
    }

    /// Runs `step` on every worker in its own task and collects the results.
    async fn run<I, T, F, Fut>(&mut self, inputs: Vec<I>, step: F) -> Result<Vec<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(Worker, I) -> Fut,
        Fut: std::future::Future<Output = (Worker, Result<T>)> + Send + 'static,
    {
        let workers = std::mem::take(&mut self.workers);
        let handles: Vec<_> = workers
            .into_iter()
            .zip(inputs)
            .map(|(worker, input)| tokio::spawn(step(worker, input)))
            .collect();

        let mut outputs = Vec::with_capacity(handles.len());
        let mut failure: Option<EmbeddingError> = None;
        for joined in join_all(handles).await {
            match joined {
                Ok((worker, result)) => {
                    self.workers.push(worker);
                    match result {
                        Ok(output) => outputs.push(output),
                        Err(err) => failure = Some(pick_root_cause(failure, err)),
                    }
                }
                Err(join_err) => {
                    failure = Some(EmbeddingError::Worker(join_err.to_string()));
                }
            }
        }

        match failure {
            None => Ok(outputs),
            Some(err) => {
                if self.workers.len() == self.world_size() {
                    self.reconnect()?;
                }
                Err(err)
            }
        }
    }

    /// Gives every worker a fresh communicator.
    fn reconnect(&mut self) -> Result<()> {
        let comms = self.group.build::<WireMessage>()?;
        for (worker, comm) in self.workers.iter_mut().zip(comms) {
            worker.executor.replace_communicator(comm)?;
        }
        warn!(world_size = self.world_size(), "Rebuilt collective group after failed step");
        Ok(())
    }

    fn check_ownership(&self, snapshot: &ShardSnapshot) -> Result<()> {
        match snapshot
            .entries
            .iter()
            .find(|entry| self.router.owner(entry.key) != snapshot.rank)
        {
            Some(entry) => Err(ShardError::InvalidSnapshot(format!(
                "key {} belongs to worker {}, not {} of {}",
                entry.key,
                self.router.owner(entry.key),
                snapshot.rank,
                self.world_size()
            ))
            .into()),
            None => Ok(()),
        }
    }

    fn check_inputs(&self, given: usize, what: &str) -> Result<()> {
        if self.workers.len() != self.world_size() {
            return Err(lost_worker());
        }
        if given != self.world_size() {
            return Err(EmbeddingError::InvalidConfig(format!(
                "expected {} {what}, one per worker, got {given}",
                self.world_size()
            )));
        }
        Ok(())
    }
}

/// The checks `apply_gradient` makes, without touching the shard.
fn check_gradient(shard: &EmbeddingShard, grad: &ShardGradient) -> Result<()> {
    if grad.dim() != shard.dim() {
        return Err(EmbeddingError::GradientShape {
            expected: shard.dim(),
            actual: grad.dim(),
        });
    }
    Ok(shard.check_gradient(grad)?)
}

fn lost_worker() -> EmbeddingError {
    EmbeddingError::Worker("cluster lost a worker in an earlier step".to_string())
}

/// Keeps the most informative error of a failed step: a local failure
/// explains the communication errors it caused on the peers.
fn pick_root_cause(current: Option<EmbeddingError>, new: EmbeddingError) -> EmbeddingError {
    match current {
        Some(existing) if !existing.is_communication() || new.is_communication() => existing,
        _ => new,
    }
}
