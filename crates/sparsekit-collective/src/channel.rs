//! Channel-backed collectives for workers running as tasks in one process.
//!
//! Every worker owns an unbounded inbox and a sender into every inbox
//! (including its own). A collective is one numbered round: each worker
//! posts exactly one envelope to every peer, then waits until it holds one
//! envelope from every peer for that round. Envelopes from a later round
//! (a fast peer already moved on) are parked until their round comes.

use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{CommResult, CommunicationError};
use crate::{Collective, CollectiveOp};

/// Default bound on how long a worker waits for its peers in one collective.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default period of the closed-peer check while waiting.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Envelope<M> {
    from: usize,
    round: u64,
    op: CollectiveOp,
    payload: Option<M>,
}

/// Builds the fully connected set of communicators for one worker group.
///
/// # Example
///
/// ```
/// use sparsekit_collective::{Collective, CollectiveGroup};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut comms = CollectiveGroup::new(2).build::<u32>().unwrap();
/// let mut c1 = comms.pop().unwrap();
/// let mut c0 = comms.pop().unwrap();
/// let (a, b) = tokio::join!(c0.all_gather(10), c1.all_gather(11));
/// assert_eq!(a.unwrap(), vec![10, 11]);
/// assert_eq!(b.unwrap(), vec![10, 11]);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CollectiveGroup {
    world_size: usize,
    timeout: Duration,
    liveness_interval: Duration,
}

impl CollectiveGroup {
    /// Describes a group of `world_size` workers.
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            timeout: DEFAULT_TIMEOUT,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
        }
    }

    /// Sets how long a collective waits for peers before failing.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how often a waiting worker checks whether missing peers are gone.
    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Number of workers.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Collective timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Creates one communicator per rank, indexed by rank.
    pub fn build<M>(&self) -> CommResult<Vec<ChannelCommunicator<M>>>
    where
        M: Clone + Send + 'static,
    {
        if self.world_size == 0 {
            return Err(CommunicationError::InvalidArgument(
                "world size must be greater than 0".to_string(),
            ));
        }
        if self.timeout.is_zero() || self.liveness_interval.is_zero() {
            return Err(CommunicationError::InvalidArgument(
                "timeout and liveness interval must be non-zero".to_string(),
            ));
        }

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..self.world_size)
            .map(|_| mpsc::unbounded_channel::<Envelope<M>>())
            .unzip();

        let comms = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelCommunicator {
                rank,
                world_size: self.world_size,
                peers: senders.clone(),
                inbox,
                parked: HashMap::new(),
                round: 0,
                timeout: self.timeout,
                liveness_interval: self.liveness_interval,
            })
            .collect();
        tracing::debug!(world_size = self.world_size, timeout = ?self.timeout, "Built collective group");
        Ok(comms)
    }
}

/// One worker's endpoint in a [`CollectiveGroup`].
///
/// Dropping a communicator makes the worker unreachable for its peers.
pub struct ChannelCommunicator<M> {
    rank: usize,
    world_size: usize,
    peers: Vec<UnboundedSender<Envelope<M>>>,
    inbox: UnboundedReceiver<Envelope<M>>,
    parked: HashMap<(u64, usize), Envelope<M>>,
    round: u64,
    timeout: Duration,
    liveness_interval: Duration,
}

impl<M> std::fmt::Debug for ChannelCommunicator<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCommunicator")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("round", &self.round)
            .field("parked", &self.parked.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<M> ChannelCommunicator<M>
where
    M: Send + 'static,
{
    /// Number of collectives this worker has started.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Posts `outgoing[peer]` to every peer and collects one payload per peer.
    async fn exchange(
        &mut self,
        op: CollectiveOp,
        outgoing: Vec<Option<M>>,
    ) -> CommResult<Vec<Option<M>>> {
        let round = self.round;
        self.round += 1;

        for (peer, payload) in outgoing.into_iter().enumerate() {
            let envelope = Envelope {
                from: self.rank,
                round,
                op,
                payload,
            };
            if self.peers[peer].send(envelope).is_err() {
                return Err(CommunicationError::PeerUnreachable {
                    rank: self.rank,
                    peer,
                    op,
                });
            }
        }

        let mut slots: Vec<Option<Option<M>>> = (0..self.world_size).map(|_| None).collect();
        let mut received = 0usize;
        for peer in 0..self.world_size {
            if let Some(envelope) = self.parked.remove(&(round, peer)) {
                self.accept(envelope, round, op, &mut slots, &mut received)?;
            }
        }

        let deadline = Instant::now() + self.timeout;
        let mut liveness = tokio::time::interval(self.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while received < self.world_size {
            tokio::select! {
                biased;
                message = self.inbox.recv() => match message {
                    Some(envelope) => self.accept(envelope, round, op, &mut slots, &mut received)?,
                    // We hold a sender into our own inbox, so it cannot close.
                    None => {
                        return Err(CommunicationError::PeerUnreachable {
                            rank: self.rank,
                            peer: self.rank,
                            op,
                        })
                    }
                },
                _ = liveness.tick() => {
                    self.check_liveness(round, op, &mut slots, &mut received)?;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let missing = missing_peers(&slots);
                    tracing::warn!(rank = self.rank, %op, round, ?missing, "Collective timed out");
                    return Err(CommunicationError::Timeout {
                        rank: self.rank,
                        op,
                        round,
                        after: self.timeout,
                        missing,
                    });
                }
            }
        }

        tracing::trace!(rank = self.rank, %op, round, "Collective complete");
        Ok(slots.into_iter().flatten().collect())
    }

    fn accept(
        &mut self,
        envelope: Envelope<M>,
        round: u64,
        op: CollectiveOp,
        slots: &mut [Option<Option<M>>],
        received: &mut usize,
    ) -> CommResult<()> {
        let peer = envelope.from;
        if peer >= self.world_size {
            return Err(self.malformed(peer, format!("sender rank {peer} is outside the group")));
        }
        if envelope.round > round {
            let key = (envelope.round, peer);
            if self.parked.insert(key, envelope).is_some() {
                return Err(self.malformed(peer, format!("duplicate message for round {}", key.0)));
            }
            return Ok(());
        }
        if envelope.round < round {
            return Err(self.malformed(
                peer,
                format!("stale message from round {} during round {round}", envelope.round),
            ));
        }
        if envelope.op != op {
            return Err(self.malformed(
                peer,
                format!("expected {op} in round {round}, got {}", envelope.op),
            ));
        }
        if slots[peer].is_some() {
            return Err(self.malformed(peer, format!("duplicate message for round {round}")));
        }
        slots[peer] = Some(envelope.payload);
        *received += 1;
        Ok(())
    }

    /// Drains whatever already arrived, then fails on a missing peer whose inbox is gone.
    fn check_liveness(
        &mut self,
        round: u64,
        op: CollectiveOp,
        slots: &mut [Option<Option<M>>],
        received: &mut usize,
    ) -> CommResult<()> {
        while let Ok(envelope) = self.inbox.try_recv() {
            self.accept(envelope, round, op, slots, received)?;
        }
        for peer in missing_peers(slots) {
            if self.peers[peer].is_closed() {
                tracing::warn!(rank = self.rank, peer, %op, round, "Peer went away during collective");
                return Err(CommunicationError::PeerUnreachable {
                    rank: self.rank,
                    peer,
                    op,
                });
            }
        }
        Ok(())
    }

    fn malformed(&self, peer: usize, reason: String) -> CommunicationError {
        CommunicationError::MalformedMessage {
            rank: self.rank,
            peer,
            reason,
        }
    }

    fn unwrap_payloads(&self, payloads: Vec<Option<M>>) -> CommResult<Vec<M>> {
        payloads
            .into_iter()
            .enumerate()
            .map(|(peer, payload)| {
                payload.ok_or_else(|| self.malformed(peer, "missing payload".to_string()))
            })
            .collect()
    }
}

fn missing_peers<T>(slots: &[Option<T>]) -> Vec<usize> {
    slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.is_none())
        .map(|(peer, _)| peer)
        .collect()
}

#[async_trait]
impl<M> Collective<M> for ChannelCommunicator<M>
where
    M: Clone + Send + 'static,
{
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_gather(&mut self, local: M) -> CommResult<Vec<M>> {
        let mut outgoing = Vec::with_capacity(self.world_size);
        for _ in 1..self.world_size {
            outgoing.push(Some(local.clone()));
        }
        outgoing.push(Some(local));
        let payloads = self.exchange(CollectiveOp::AllGather, outgoing).await?;
        self.unwrap_payloads(payloads)
    }

    async fn all_to_all(&mut self, outgoing: Vec<M>) -> CommResult<Vec<M>> {
        if outgoing.len() != self.world_size {
            return Err(CommunicationError::InvalidArgument(format!(
                "all_to_all needs {} payloads, got {}",
                self.world_size,
                outgoing.len()
            )));
        }
        let outgoing = outgoing.into_iter().map(Some).collect();
        let payloads = self.exchange(CollectiveOp::AllToAll, outgoing).await?;
        self.unwrap_payloads(payloads)
    }

    async fn barrier(&mut self) -> CommResult<()> {
        let outgoing = (0..self.world_size).map(|_| None).collect();
        self.exchange(CollectiveOp::Barrier, outgoing).await?;
        Ok(())
    }
}
