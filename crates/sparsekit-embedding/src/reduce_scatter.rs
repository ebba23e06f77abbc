//! Reduce-scatter of partial sums to the workers that requested them, and
//! the inverse exchange of gradients during backward.

use std::collections::BTreeMap;

use sparsekit_collective::{Collective, CommunicationError};
use tracing::{debug, warn};

use crate::combiner::accumulate;
use crate::error::Result;
use crate::wire::{RowVector, WireMessage};

/// Per-origin partial sums computed by one worker from its own shard.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialSums {
    dim: usize,
    per_origin: Vec<BTreeMap<usize, Vec<f32>>>,
}

impl PartialSums {
    /// Empty partial sums for a group of `world_size` workers.
    pub fn new(world_size: usize, dim: usize) -> Self {
        Self {
            dim,
            per_origin: vec![BTreeMap::new(); world_size],
        }
    }

    /// Adds a shard row to output row `row_index` of worker `origin`.
    pub fn add(&mut self, origin: usize, row_index: usize, row: &[f32]) {
        let dim = self.dim;
        let sum = self.per_origin[origin]
            .entry(row_index)
            .or_insert_with(|| vec![0.0; dim]);
        accumulate(sum, row);
    }

    /// Partial sum for `(origin, row_index)`, if any row contributed.
    pub fn get(&self, origin: usize, row_index: usize) -> Option<&[f32]> {
        self.per_origin.get(origin)?.get(&row_index).map(Vec::as_slice)
    }

    /// Number of partial rows across all origins.
    pub fn num_rows(&self) -> usize {
        self.per_origin.iter().map(BTreeMap::len).sum()
    }

    /// Splits into one `Partials` message per origin plus the row indices
    /// each message carries.
    fn into_messages(self) -> (Vec<WireMessage>, Vec<Vec<usize>>) {
        let mut messages = Vec::with_capacity(self.per_origin.len());
        let mut sent_rows = Vec::with_capacity(self.per_origin.len());
        for rows in self.per_origin {
            sent_rows.push(rows.keys().copied().collect());
            messages.push(WireMessage::Partials(
                rows.into_iter()
                    .map(|(row_index, values)| RowVector { row_index, values })
                    .collect(),
            ));
        }
        (messages, sent_rows)
    }
}

/// Outcome of a reduce-scatter on one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduced {
    /// `output_rows * dim` sums, row-major by row index.
    pub sums: Vec<f32>,
    /// Row indices received from each peer, in the order received.
    pub received_rows: Vec<Vec<usize>>,
    /// Row indices sent to each peer, in the order sent.
    pub sent_rows: Vec<Vec<usize>>,
}

/// Routes partial sums to their origin and gradients back to contributors.
#[derive(Debug, Clone)]
pub struct ReduceScatterDispatcher {
    rank: usize,
    world_size: usize,
    dim: usize,
}

impl ReduceScatterDispatcher {
    /// Creates a dispatcher for worker `rank` of `world_size`.
    pub fn new(rank: usize, world_size: usize, dim: usize) -> Self {
        Self {
            rank,
            world_size,
            dim,
        }
    }

    /// Sends each origin its partial sums and sums what arrives here.
    ///
    /// Contributions are added in sender-rank order, so the result does not
    /// depend on arrival timing.
    pub async fn reduce_scatter<C>(
        &self,
        comm: &mut C,
        partials: PartialSums,
        output_rows: usize,
    ) -> Result<Reduced>
    where
        C: Collective<WireMessage> + ?Sized,
    {
        let partial_rows = partials.num_rows();
        let (outgoing, sent_rows) = partials.into_messages();
        let incoming = self.exchange(comm, outgoing).await?;

        let mut sums = vec![0.0; output_rows * self.dim];
        let mut received_rows = Vec::with_capacity(incoming.len());
        for (peer, message) in incoming.into_iter().enumerate() {
            let rows = match message {
                WireMessage::Partials(rows) => rows,
                other => return Err(self.unexpected(peer, "partials", other)),
            };
            let mut received = Vec::with_capacity(rows.len());
            for row in rows {
                self.check_row(peer, &row, output_rows, received.last().copied())?;
                let start = row.row_index * self.dim;
                accumulate(&mut sums[start..start + self.dim], &row.values);
                received.push(row.row_index);
            }
            received_rows.push(received);
        }

        debug!(
            rank = self.rank,
            partial_rows,
            received = received_rows.iter().map(Vec::len).sum::<usize>(),
            "Reduce-scatter complete"
        );
        Ok(Reduced {
            sums,
            received_rows,
            sent_rows,
        })
    }

    /// Sends each peer the gradients of the rows it contributed and returns
    /// the gradients of the rows this worker contributed.
    ///
    /// `outgoing[peer]` must follow `received_rows[peer]` of the forward
    /// reduce-scatter; the result is checked against `sent_rows`.
    pub async fn exchange_gradients<C>(
        &self,
        comm: &mut C,
        outgoing: Vec<Vec<RowVector>>,
        sent_rows: &[Vec<usize>],
    ) -> Result<Vec<Vec<RowVector>>>
    where
        C: Collective<WireMessage> + ?Sized,
    {
        let messages = outgoing.into_iter().map(WireMessage::Gradients).collect();
        let incoming = self.exchange(comm, messages).await?;

        let mut gradients = Vec::with_capacity(incoming.len());
        for (peer, message) in incoming.into_iter().enumerate() {
            let rows = match message {
                WireMessage::Gradients(rows) => rows,
                other => return Err(self.unexpected(peer, "gradients", other)),
            };
            let expected = sent_rows.get(peer).map(Vec::as_slice).unwrap_or(&[]);
            let matches = rows.len() == expected.len()
                && rows
                    .iter()
                    .zip(expected)
                    .all(|(row, &want)| row.row_index == want && row.values.len() == self.dim);
            if !matches {
                return Err(CommunicationError::MalformedMessage {
                    rank: self.rank,
                    peer,
                    reason: format!(
                        "gradients for {} rows do not match the {} partial rows sent",
                        rows.len(),
                        expected.len()
                    ),
                }
                .into());
            }
            gradients.push(rows);
        }
        Ok(gradients)
    }

    /// Takes part in the pending all-to-all only to abandon the step.
    pub async fn abort<C>(&self, comm: &mut C, reason: &str)
    where
        C: Collective<WireMessage> + ?Sized,
    {
        if self.world_size == 1 {
            return;
        }
        let notices = vec![WireMessage::Abort(reason.to_string()); self.world_size];
        if let Err(err) = comm.all_to_all(notices).await {
            warn!(rank = self.rank, error = %err, "Abort notice was not delivered");
        }
    }

    async fn exchange<C>(&self, comm: &mut C, outgoing: Vec<WireMessage>) -> Result<Vec<WireMessage>>
    where
        C: Collective<WireMessage> + ?Sized,
    {
        if self.world_size == 1 {
            return Ok(outgoing);
        }
        Ok(comm.all_to_all(outgoing).await?)
    }

    fn check_row(
        &self,
        peer: usize,
        row: &RowVector,
        output_rows: usize,
        previous: Option<usize>,
    ) -> Result<()> {
        let reason = if row.row_index >= output_rows {
            format!("row {} outside {} output rows", row.row_index, output_rows)
        } else if row.values.len() != self.dim {
            format!("row of width {}, expected {}", row.values.len(), self.dim)
        } else if previous.is_some_and(|p| p >= row.row_index) {
            format!("row {} repeated or out of order", row.row_index)
        } else {
            return Ok(());
        };
        Err(CommunicationError::MalformedMessage {
            rank: self.rank,
            peer,
            reason,
        }
        .into())
    }

    fn unexpected(&self, peer: usize, expected: &str, got: WireMessage) -> crate::EmbeddingError {
        match got {
            WireMessage::Abort(reason) => CommunicationError::PeerAborted {
                rank: self.rank,
                peer,
                reason,
            },
            other => CommunicationError::MalformedMessage {
                rank: self.rank,
                peer,
                reason: format!("expected {expected}, got {}", other.kind()),
            },
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use sparsekit_collective::CollectiveGroup;

    #[test]
    fn test_partial_sums_accumulate() {
        let mut partials = PartialSums::new(2, 2);
        partials.add(1, 3, &[1.0, 2.0]);
        partials.add(1, 3, &[0.5, 0.5]);
        partials.add(0, 0, &[1.0, 1.0]);
        assert_eq!(partials.get(1, 3), Some(&[1.5, 2.5][..]));
        assert_eq!(partials.num_rows(), 2);
        assert!(partials.get(0, 3).is_none());
    }

    #[tokio::test]
    async fn test_single_worker_reduces_locally() {
        let mut comms = CollectiveGroup::new(1).build::<WireMessage>().unwrap();
        let mut comm = comms.pop().unwrap();
        let reducer = ReduceScatterDispatcher::new(0, 1, 2);

        let mut partials = PartialSums::new(1, 2);
        partials.add(0, 1, &[2.0, 4.0]);
        let reduced = reducer.reduce_scatter(&mut comm, partials, 2).await.unwrap();
        assert_eq!(reduced.sums, vec![0.0, 0.0, 2.0, 4.0]);
        assert_eq!(reduced.received_rows, vec![vec![1]]);
        assert_eq!(reduced.sent_rows, vec![vec![1]]);
        assert_eq!(comm.round(), 0);
    }

    #[tokio::test]
    async fn test_sums_from_every_peer() {
        let comms = CollectiveGroup::new(3).build::<WireMessage>().unwrap();
        let tasks = comms.into_iter().map(|mut comm| async move {
            let rank = comm.rank();
            let reducer = ReduceScatterDispatcher::new(rank, 3, 1);
            let mut partials = PartialSums::new(3, 1);
            // Every worker contributes `rank + 1` to row 0 of worker 0.
            partials.add(0, 0, &[(rank + 1) as f32]);
            reducer.reduce_scatter(&mut comm, partials, 1).await.unwrap()
        });
        let results = join_all(tasks).await;
        assert_eq!(results[0].sums, vec![6.0]);
        assert_eq!(results[0].received_rows, vec![vec![0], vec![0], vec![0]]);
        assert_eq!(results[1].sums, vec![0.0]);
        assert!(results[1].received_rows.iter().all(Vec::is_empty));
    }

    #[tokio::test]
    async fn test_out_of_range_row_is_malformed() {
        let comms = CollectiveGroup::new(2).build::<WireMessage>().unwrap();
        let tasks = comms.into_iter().map(|mut comm| async move {
            let rank = comm.rank();
            let reducer = ReduceScatterDispatcher::new(rank, 2, 1);
            let mut partials = PartialSums::new(2, 1);
            if rank == 1 {
                partials.add(0, 5, &[1.0]);
            }
            reducer.reduce_scatter(&mut comm, partials, 2).await
        });
        let results = join_all(tasks).await;
        assert!(matches!(
            results[0],
            Err(crate::EmbeddingError::Communication(
                CommunicationError::MalformedMessage { peer: 1, .. }
            ))
        ));
        assert!(results[1].is_ok());
    }

    #[tokio::test]
    async fn test_gradients_must_match_sent_rows() {
        let comms = CollectiveGroup::new(2).build::<WireMessage>().unwrap();
        let tasks = comms.into_iter().map(|mut comm| async move {
            let rank = comm.rank();
            let reducer = ReduceScatterDispatcher::new(rank, 2, 1);
            let outgoing = vec![
                vec![],
                vec![RowVector {
                    row_index: 0,
                    values: vec![1.0],
                }],
            ];
            // Worker 0 expects a gradient for a row worker 1 never got.
            let sent_rows = if rank == 0 {
                vec![vec![], vec![3]]
            } else {
                vec![vec![0], vec![0]]
            };
            reducer
                .exchange_gradients(&mut comm, outgoing, &sent_rows)
                .await
        });
        let results = join_all(tasks).await;
        assert!(matches!(
            results[0],
            Err(crate::EmbeddingError::Communication(
                CommunicationError::MalformedMessage { peer: 1, .. }
            ))
        ));
        let at_one = results[1].as_ref().unwrap();
        assert!(at_one[0].is_empty());
        assert_eq!(at_one[1][0].values, vec![1.0]);
    }
}
