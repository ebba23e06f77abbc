//! All-gather dispatch of key requests to the workers that own them.

use sparsekit_collective::{Collective, CommunicationError};
use sparsekit_shard::{Key, KeyRouter};
use tracing::{debug, warn};

use crate::error::Result;
use crate::wire::{KeyRequest, WireMessage};

/// A request this worker must serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnedRequest {
    /// Requested key, owned by this worker.
    pub key: Key,
    /// Worker that issued the request.
    pub origin: usize,
    /// Output row on the origin worker.
    pub row_index: usize,
}

/// Requests owned by one worker for one step.
///
/// Requests are grouped by origin in rank order and keep, within an origin,
/// the order in which that origin listed them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchPlan {
    owned: Vec<OwnedRequest>,
    per_origin: Vec<usize>,
}

impl DispatchPlan {
    /// Owned requests in arrival order.
    pub fn owned(&self) -> &[OwnedRequest] {
        &self.owned
    }

    /// Number of owned requests.
    pub fn len(&self) -> usize {
        self.owned.len()
    }

    /// True if this worker serves nothing this step.
    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }

    /// Number of owned requests from each origin, indexed by rank.
    pub fn per_origin(&self) -> &[usize] {
        &self.per_origin
    }

    /// Keys of the owned requests, in arrival order.
    pub fn keys(&self) -> Vec<Key> {
        self.owned.iter().map(|r| r.key).collect()
    }
}

/// Sends every worker's requests to every worker and keeps the owned ones.
#[derive(Debug, Clone)]
pub struct AllGatherDispatcher {
    router: KeyRouter,
    rank: usize,
}

impl AllGatherDispatcher {
    /// Creates a dispatcher for worker `rank`.
    pub fn new(router: KeyRouter, rank: usize) -> Self {
        Self { router, rank }
    }

    /// The router deciding ownership.
    pub fn router(&self) -> &KeyRouter {
        &self.router
    }

    /// Plans a step without communicating; valid only for a group of one.
    pub fn local_plan(&self, requests: &[KeyRequest]) -> DispatchPlan {
        let mut plan = DispatchPlan {
            owned: Vec::with_capacity(requests.len()),
            per_origin: vec![0; self.router.worker_count()],
        };
        self.keep_owned(&mut plan, self.rank, requests);
        plan
    }

    /// All-gathers `requests` and returns the ones this worker owns.
    ///
    /// # Errors
    ///
    /// Any collective failure, or [`CommunicationError::PeerAborted`] if a
    /// peer abandoned the step at this collective.
    pub async fn dispatch<C>(&self, comm: &mut C, requests: &[KeyRequest]) -> Result<DispatchPlan>
    where
        C: Collective<WireMessage> + ?Sized,
    {
        if self.router.is_single_shard() {
            return Ok(self.local_plan(requests));
        }

        let gathered = comm
            .all_gather(WireMessage::Requests(requests.to_vec()))
            .await?;

        let mut plan = DispatchPlan {
            owned: Vec::new(),
            per_origin: vec![0; gathered.len()],
        };
        for (origin, message) in gathered.iter().enumerate() {
            match message {
                WireMessage::Requests(reqs) => self.keep_owned(&mut plan, origin, reqs),
                WireMessage::Abort(reason) => {
                    return Err(CommunicationError::PeerAborted {
                        rank: self.rank,
                        peer: origin,
                        reason: reason.clone(),
                    }
                    .into())
                }
                other => {
                    return Err(CommunicationError::MalformedMessage {
                        rank: self.rank,
                        peer: origin,
                        reason: format!("expected requests, got {}", other.kind()),
                    }
                    .into())
                }
            }
        }

        debug!(
            rank = self.rank,
            owned = plan.len(),
            per_origin = ?plan.per_origin,
            "Dispatched key requests"
        );
        Ok(plan)
    }

    /// Takes part in the request all-gather only to abandon the step.
    pub async fn abort<C>(&self, comm: &mut C, reason: &str)
    where
        C: Collective<WireMessage> + ?Sized,
    {
        if self.router.is_single_shard() {
            return;
        }
        if let Err(err) = comm.all_gather(WireMessage::Abort(reason.to_string())).await {
            warn!(rank = self.rank, error = %err, "Abort notice was not delivered");
        }
    }

    fn keep_owned(&self, plan: &mut DispatchPlan, origin: usize, requests: &[KeyRequest]) {
        for request in requests {
            if self.router.is_local(request.key, self.rank) {
                plan.owned.push(OwnedRequest {
                    key: request.key,
                    origin,
                    row_index: request.row_index,
                });
                plan.per_origin[origin] += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use sparsekit_collective::CollectiveGroup;

    #[test]
    fn test_local_plan_keeps_everything_for_one_worker() {
        let dispatcher = AllGatherDispatcher::new(KeyRouter::new(1).unwrap(), 0);
        let requests = vec![KeyRequest::new(9, 0), KeyRequest::new(3, 1)];
        let plan = dispatcher.local_plan(&requests);
        assert_eq!(plan.keys(), vec![9, 3]);
        assert_eq!(plan.per_origin(), &[2]);
    }

    #[tokio::test]
    async fn test_dispatch_partitions_by_owner() {
        let comms = CollectiveGroup::new(2).build::<WireMessage>().unwrap();
        let inputs = [
            vec![KeyRequest::new(4, 0), KeyRequest::new(5, 0), KeyRequest::new(2, 1)],
            vec![KeyRequest::new(7, 0), KeyRequest::new(8, 1)],
        ];

        let tasks = comms.into_iter().zip(inputs).map(|(mut comm, requests)| {
            let dispatcher = AllGatherDispatcher::new(KeyRouter::new(2).unwrap(), comm.rank());
            async move { dispatcher.dispatch(&mut comm, &requests).await.unwrap() }
        });
        let plans = join_all(tasks).await;

        assert_eq!(plans[0].keys(), vec![4, 2, 8]);
        assert_eq!(plans[0].per_origin(), &[2, 1]);
        assert_eq!(
            plans[0].owned()[2],
            OwnedRequest {
                key: 8,
                origin: 1,
                row_index: 1
            }
        );
        assert_eq!(plans[1].keys(), vec![5, 7]);
        assert_eq!(plans[1].per_origin(), &[1, 1]);
    }

    #[tokio::test]
    async fn test_abort_fails_peers() {
        let mut comms = CollectiveGroup::new(2).build::<WireMessage>().unwrap();
        let mut c1 = comms.pop().unwrap();
        let mut c0 = comms.pop().unwrap();
        let d0 = AllGatherDispatcher::new(KeyRouter::new(2).unwrap(), 0);
        let d1 = AllGatherDispatcher::new(KeyRouter::new(2).unwrap(), 1);

        let requests = [KeyRequest::new(1, 0)];
        let (_, result) = tokio::join!(
            d0.abort(&mut c0, "bad input"),
            d1.dispatch(&mut c1, &requests)
        );
        match result {
            Err(crate::EmbeddingError::Communication(CommunicationError::PeerAborted {
                peer,
                reason,
                ..
            })) => {
                assert_eq!(peer, 0);
                assert_eq!(reason, "bad input");
            }
            other => panic!("expected PeerAborted, got {other:?}"),
        }
    }
}
