//! simulate command
//!
//! Trains a distributed embedding with an in-process worker group on random
//! batches. The objective pulls every combined vector towards zero
//! (`loss = 0.5 * |y|^2`, so the upstream gradient is the output itself),
//! which is enough to exercise forward, backward and the SGD update.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use sparsekit_embedding::{
    Combiner, DistributedEmbeddingConfig, EmbeddingOutput, LocalCluster, Mode, SparseBatch,
};
use sparsekit_shard::Key;
use tracing::{debug, info, warn};

/// Train an embedding on random batches with an in-process worker group
///
/// Without `--config` the embedding is configured from the flags below.
///
/// # Example
///
/// ```bash
/// sparsekit simulate --workers 4 --steps 100 --batch-size 64 --combiner mean
/// ```
#[derive(Args, Debug, Clone)]
pub struct SimulateCommand {
    /// Number of workers in the group
    #[arg(long, short = 'w', default_value = "2")]
    pub workers: usize,

    /// Number of training steps
    #[arg(long, short = 's', default_value = "10")]
    pub steps: u64,

    /// Samples per worker and step
    #[arg(long, short = 'b', default_value = "32")]
    pub batch_size: usize,

    /// Embedding configuration file (JSON)
    #[arg(long, short = 'c', env = "SPARSEKIT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Combiner, overriding the configuration file
    #[arg(long)]
    pub combiner: Option<Combiner>,

    /// SGD learning rate
    #[arg(long, default_value = "0.01")]
    pub learning_rate: f32,

    /// Keys are drawn uniformly from `0..key_space`
    #[arg(long, default_value = "10000")]
    pub key_space: u64,

    /// Seed of the batch generator
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Save shard checkpoints here after training
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Re-issue a step that failed in communication this many times
    #[arg(long, default_value = "1")]
    pub max_retries: usize,

    /// Slots per sample (without --config)
    #[arg(long, default_value = "4")]
    pub slot_num: usize,

    /// Maximum keys per slot (without --config)
    #[arg(long, default_value = "3")]
    pub max_nnz: usize,

    /// Embedding width (without --config)
    #[arg(long, default_value = "32")]
    pub embedding_vec_size: usize,

    /// Shard capacity (without --config; default fits the whole key space)
    #[arg(long)]
    pub vocab_per_worker: Option<usize>,
}

/// Outcome of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    /// Workers in the group.
    pub workers: usize,
    /// Training steps completed.
    pub steps: u64,
    /// Combiner used.
    pub combiner: Combiner,
    /// Loss of the first step.
    pub initial_loss: f64,
    /// Loss on the first step's batches after training.
    pub final_loss: f64,
    /// Keys requested over all steps and workers.
    pub total_requests: usize,
    /// Steps re-issued after a communication failure.
    pub retries: usize,
    /// Allocated rows of each shard at the end.
    pub rows_per_shard: Vec<usize>,
    /// Where the shards were saved.
    pub checkpoint_dir: Option<PathBuf>,
}

impl SimulateCommand {
    /// The embedding configuration this command runs with.
    pub fn embedding_config(&self) -> Result<DistributedEmbeddingConfig> {
        let mut config = match &self.config {
            Some(path) => DistributedEmbeddingConfig::from_json_file(path)
                .with_context(|| format!("Invalid configuration {}", path.display()))?,
            None => {
                let capacity = match self.vocab_per_worker {
                    Some(capacity) => capacity,
                    None => usize::try_from(self.key_space.div_ceil(self.workers.max(1) as u64))
                        .context("Key space does not fit in memory")?,
                };
                DistributedEmbeddingConfig::new(
                    Combiner::Sum,
                    capacity,
                    self.embedding_vec_size,
                    self.slot_num,
                    self.max_nnz,
                )
            }
        };
        if let Some(combiner) = self.combiner {
            config = config.with_combiner(combiner);
        }
        config.validate()?;
        Ok(config)
    }

    /// Runs the simulation and returns its report.
    pub async fn simulate(&self) -> Result<SimulationReport> {
        anyhow::ensure!(self.key_space > 0, "--key-space must be positive");
        let config = self.embedding_config()?;
        let mut cluster = LocalCluster::new(config.clone(), self.workers)
            .context("Failed to create worker group")?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        info!(
            workers = self.workers,
            steps = self.steps,
            batch_size = self.batch_size,
            combiner = %config.combiner,
            learning_rate = self.learning_rate,
            "Starting simulation"
        );

        let mut initial_loss = 0.0;
        let mut first_batches = None;
        let mut total_requests = 0;
        let mut retries = 0;
        for step in 1..=self.steps {
            let batches: Vec<SparseBatch> = (0..self.workers)
                .map(|_| random_batch(&mut rng, &config, self.batch_size, self.key_space))
                .collect();
            total_requests += batches.iter().map(SparseBatch::nnz).sum::<usize>();

            let (loss, attempts) = self.train_step(&mut cluster, &batches).await?;
            retries += attempts;
            info!(step, loss, "Step complete");
            if step == 1 {
                initial_loss = loss;
                first_batches = Some(batches);
            }
        }

        let final_loss = match first_batches {
            Some(batches) => {
                let outputs = cluster
                    .forward(batches, Mode::Inference)
                    .await
                    .context("Evaluation failed")?;
                loss(&outputs)
            }
            None => 0.0,
        };

        if let Some(dir) = &self.checkpoint_dir {
            cluster
                .save_checkpoint(dir)
                .with_context(|| format!("Failed to save checkpoint to {}", dir.display()))?;
        }

        let rows_per_shard = (0..self.workers)
            .filter_map(|rank| cluster.shard(rank).map(|s| s.len()))
            .collect();
        Ok(SimulationReport {
            workers: self.workers,
            steps: self.steps,
            combiner: config.combiner,
            initial_loss,
            final_loss,
            total_requests,
            retries,
            rows_per_shard,
            checkpoint_dir: self.checkpoint_dir.clone(),
        })
    }

    /// Execute the simulate command
    pub async fn run(&self) -> Result<()> {
        let report = self.simulate().await?;
        info!(
            initial_loss = report.initial_loss,
            final_loss = report.final_loss,
            "Simulation finished"
        );
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }

    /// Runs one step, re-issuing it after retryable failures.
    ///
    /// Returns the step loss and the number of retries.
    async fn train_step(
        &self,
        cluster: &mut LocalCluster,
        batches: &[SparseBatch],
    ) -> Result<(f64, usize)> {
        let mut attempt = 0;
        loop {
            match run_step(cluster, batches.to_vec(), self.learning_rate).await {
                Ok(loss) => return Ok((loss, attempt)),
                Err(err) if err.is_retryable_step() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "Re-issuing failed step");
                }
                Err(err) => return Err(err).context("Training step failed"),
            }
        }
    }
}

async fn run_step(
    cluster: &mut LocalCluster,
    batches: Vec<SparseBatch>,
    learning_rate: f32,
) -> sparsekit_embedding::Result<f64> {
    let outputs = cluster.forward(batches, Mode::Train).await?;
    let step_loss = loss(&outputs);
    let upstream = outputs.into_iter().map(EmbeddingOutput::into_values).collect();
    let grads = cluster.backward(upstream).await?;
    let touched: usize = grads.iter().map(|g| g.len()).sum();
    cluster.apply_gradients(&grads, -learning_rate)?;
    debug!(touched, "Applied SGD update");
    Ok(step_loss)
}

/// `0.5 * |y|^2` summed over every output.
fn loss(outputs: &[EmbeddingOutput]) -> f64 {
    outputs
        .iter()
        .flat_map(|o| o.values())
        .map(|&v| 0.5 * f64::from(v) * f64::from(v))
        .sum()
}

/// A batch of `batch_size` samples within every bound of `config`.
fn random_batch(
    rng: &mut StdRng,
    config: &DistributedEmbeddingConfig,
    batch_size: usize,
    key_space: u64,
) -> SparseBatch {
    let mut rows: Vec<Vec<Key>> = Vec::with_capacity(batch_size * config.slot_num);
    for _ in 0..batch_size {
        let mut budget = config.max_feature_num();
        for _ in 0..config.slot_num {
            let nnz = rng.gen_range(0..=config.max_nnz.min(budget));
            budget -= nnz;
            rows.push((0..nnz).map(|_| rng.gen_range(0..key_space)).collect());
        }
    }
    SparseBatch::from_rows(&rows, config.max_nnz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_batch_is_valid() {
        let config = DistributedEmbeddingConfig::new(Combiner::Sum, 100, 4, 3, 4)
            .with_max_feature_num(5);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let batch = random_batch(&mut rng, &config, 8, 1000);
            let validated = batch.validate(&config).unwrap();
            assert_eq!(validated.batch_size(), 8);
        }
    }
}
