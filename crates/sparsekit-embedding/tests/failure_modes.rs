use std::time::Duration;

use async_trait::async_trait;
use sparsekit_collective::{Collective, CollectiveGroup, CommResult, CommunicationError};
use sparsekit_embedding::{
    Combiner, DistributedEmbeddingConfig, DistributedExecutor, EmbeddingError, KeyRequest,
    LocalCluster, Mode, RowVector, SparseBatch, WireMessage,
};
use sparsekit_shard::InitializerConfig;

fn config() -> DistributedEmbeddingConfig {
    DistributedEmbeddingConfig::new(Combiner::Sum, 4, 2, 1, 2)
        .with_initializer(InitializerConfig::Zeros)
        .with_communication_timeout(Duration::from_millis(500))
}

#[tokio::test]
async fn test_unreachable_peer_fails_step_without_mutation() {
    let mut comms = CollectiveGroup::new(2)
        .with_timeout(Duration::from_secs(1))
        .build::<WireMessage>()
        .unwrap();
    drop(comms.pop());
    let comm = comms.pop().unwrap();

    let mut executor = DistributedExecutor::new(config(), comm).unwrap();
    let mut shard = executor.create_shard().unwrap();
    let batch = SparseBatch::from_rows(&[vec![2, 3]], 2);

    let result = executor.forward(&mut shard, &batch, Mode::Train).await;
    match result {
        Err(err @ EmbeddingError::Communication(CommunicationError::PeerUnreachable {
            peer: 1,
            ..
        })) => assert!(err.is_retryable_step()),
        other => panic!("expected PeerUnreachable, got {other:?}"),
    }
    assert!(shard.is_empty());
    assert!(!executor.has_forward_state());
}

#[tokio::test]
async fn test_capacity_failure_aborts_peers() {
    let mut cluster = LocalCluster::new(config(), 2).unwrap();
    // Worker 0 owns every even key; five of them overflow its four rows.
    let batches = vec![
        SparseBatch::from_rows(&[vec![0, 2], vec![4, 6]], 2),
        SparseBatch::from_rows(&[vec![8, 1]], 2),
    ];
    let result = cluster.forward(batches, Mode::Train).await;
    assert!(matches!(result, Err(EmbeddingError::OutOfRange(_))));
    assert!(cluster.shard(0).unwrap().is_empty());
    assert!(cluster.shard(1).unwrap().is_empty());

    // A step that fits succeeds on the rebuilt group.
    let batches = vec![
        SparseBatch::from_rows(&[vec![0, 2]], 2),
        SparseBatch::from_rows(&[vec![1]], 2),
    ];
    let outputs = cluster.forward(batches, Mode::Train).await.unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(cluster.shard(0).unwrap().len(), 2);
}

#[tokio::test]
async fn test_bad_gradient_on_one_worker_fails_step() {
    let mut cluster = LocalCluster::new(config(), 2).unwrap();
    let batches = vec![
        SparseBatch::from_rows(&[vec![1]], 2),
        SparseBatch::from_rows(&[vec![2]], 2),
    ];
    cluster.forward(batches, Mode::Train).await.unwrap();

    let result = cluster.backward(vec![vec![1.0; 2], vec![1.0; 3]]).await;
    assert!(matches!(
        result,
        Err(EmbeddingError::GradientShape {
            expected: 2,
            actual: 3
        })
    ));
}

/// Answers every collective with a message of the wrong kind.
struct ConfusedPeer {
    rank: usize,
}

#[async_trait]
impl Collective<WireMessage> for ConfusedPeer {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        2
    }

    async fn all_gather(&mut self, local: WireMessage) -> CommResult<Vec<WireMessage>> {
        Ok(vec![local, WireMessage::Gradients(Vec::new())])
    }

    async fn all_to_all(&mut self, outgoing: Vec<WireMessage>) -> CommResult<Vec<WireMessage>> {
        Ok(outgoing)
    }

    async fn barrier(&mut self) -> CommResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_wrong_message_kind_is_malformed() {
    let mut executor = DistributedExecutor::new(config(), ConfusedPeer { rank: 0 }).unwrap();
    let mut shard = executor.create_shard().unwrap();
    let batch = SparseBatch::from_rows(&[vec![2]], 2);

    let result = executor.forward(&mut shard, &batch, Mode::Train).await;
    assert!(matches!(
        result,
        Err(EmbeddingError::Communication(
            CommunicationError::MalformedMessage { peer: 1, .. }
        ))
    ));
    assert!(shard.is_empty());
}

/// Echoes requests back and returns partials for a row the worker does not have.
struct OutOfRangePeer;

#[async_trait]
impl Collective<WireMessage> for OutOfRangePeer {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        2
    }

    async fn all_gather(&mut self, local: WireMessage) -> CommResult<Vec<WireMessage>> {
        Ok(vec![local, WireMessage::Requests(vec![KeyRequest::new(1, 0)])])
    }

    async fn all_to_all(&mut self, mut outgoing: Vec<WireMessage>) -> CommResult<Vec<WireMessage>> {
        outgoing[1] = WireMessage::Partials(vec![RowVector {
            row_index: 9,
            values: vec![1.0, 1.0],
        }]);
        Ok(outgoing)
    }

    async fn barrier(&mut self) -> CommResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_partial_for_unknown_row_is_malformed() {
    let mut executor = DistributedExecutor::new(config(), OutOfRangePeer).unwrap();
    let mut shard = executor.create_shard().unwrap();
    let batch = SparseBatch::from_rows(&[vec![2]], 2);

    let result = executor.forward(&mut shard, &batch, Mode::Train).await;
    assert!(matches!(
        result,
        Err(EmbeddingError::Communication(
            CommunicationError::MalformedMessage { peer: 1, .. }
        ))
    ));
    assert!(shard.is_empty());
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let comms = CollectiveGroup::new(2)
        .with_timeout(Duration::from_millis(100))
        .build::<WireMessage>()
        .unwrap();
    let mut comms = comms.into_iter();
    let comm = comms.next().unwrap();
    // Peer 1 stays connected but never takes part.
    let _silent = comms.next().unwrap();

    let mut executor = DistributedExecutor::new(config(), comm).unwrap();
    let mut shard = executor.create_shard().unwrap();
    let batch = SparseBatch::from_rows(&[vec![2]], 2);
    let result = executor.forward(&mut shard, &batch, Mode::Train).await;
    assert!(matches!(
        result,
        Err(EmbeddingError::Communication(CommunicationError::Timeout { .. }))
    ));
    assert!(shard.is_empty());
}
