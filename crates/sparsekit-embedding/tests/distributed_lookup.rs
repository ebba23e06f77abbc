use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sparsekit_embedding::{
    Combiner, DistributedEmbeddingConfig, EmbeddingError, LocalCluster, Mode, SparseBatch,
};
use sparsekit_shard::{owner_of, InitializerConfig, Key};

fn config(combiner: Combiner, slot_num: usize, max_nnz: usize) -> DistributedEmbeddingConfig {
    DistributedEmbeddingConfig::new(combiner, 64, 2, slot_num, max_nnz)
        .with_initializer(InitializerConfig::Zeros)
}

async fn two_worker_lookup(combiner: Combiner) -> Vec<f32> {
    let mut cluster = LocalCluster::new(config(combiner, 1, 2), 2).unwrap();
    cluster.assign(4, &[1.0, 1.0]).unwrap();
    cluster.assign(5, &[2.0, 2.0]).unwrap();

    let batches = vec![
        SparseBatch::from_rows(&[vec![4, 5]], 2),
        SparseBatch::empty(1, 2),
    ];
    let outputs = cluster.forward(batches, Mode::Train).await.unwrap();
    assert_eq!(outputs[1].values(), &[0.0, 0.0]);
    outputs[0].values().to_vec()
}

#[tokio::test]
async fn test_two_workers_sum() {
    assert_eq!(two_worker_lookup(Combiner::Sum).await, vec![3.0, 3.0]);
}

#[tokio::test]
async fn test_two_workers_mean() {
    assert_eq!(two_worker_lookup(Combiner::Mean).await, vec![1.5, 1.5]);
}

#[tokio::test]
async fn test_zero_key_slot_is_zero_vector() {
    for combiner in [Combiner::Sum, Combiner::Mean] {
        let mut cluster = LocalCluster::new(config(combiner, 2, 2), 2).unwrap();
        cluster.assign(1, &[5.0, 5.0]).unwrap();
        let batches = vec![
            SparseBatch::from_rows(&[vec![1], vec![]], 2),
            SparseBatch::from_rows(&[vec![], vec![]], 2),
        ];
        let outputs = cluster.forward(batches, Mode::Inference).await.unwrap();
        assert_eq!(outputs[0].vector(0, 0), Some(&[5.0, 5.0][..]));
        assert_eq!(outputs[0].vector(0, 1), Some(&[0.0, 0.0][..]));
        assert!(outputs[1].values().iter().all(|&v| v == 0.0));
    }
}

#[tokio::test]
async fn test_max_feature_num_overflow_touches_no_shard() {
    let config = config(Combiner::Sum, 2, 2).with_max_feature_num(3);
    let mut cluster = LocalCluster::new(config, 2).unwrap();
    let before = cluster.snapshots();

    let batches = vec![
        SparseBatch::from_rows(&[vec![1, 2], vec![3, 4]], 2),
        SparseBatch::from_rows(&[vec![5], vec![6]], 2),
    ];
    let result = cluster.forward(batches, Mode::Train).await;
    assert!(matches!(result, Err(EmbeddingError::InputShape(_))));
    assert_eq!(cluster.snapshots(), before);
}

#[tokio::test]
async fn test_train_admits_keys_on_their_owner() {
    let mut cluster = LocalCluster::new(config(Combiner::Sum, 1, 3), 3).unwrap();
    let batches = vec![
        SparseBatch::from_rows(&[vec![10, 11, 12]], 3),
        SparseBatch::from_rows(&[vec![12, 13]], 3),
        SparseBatch::from_rows(&[vec![14]], 3),
    ];
    let outputs = cluster.forward(batches, Mode::Train).await.unwrap();

    for key in 10..=14u64 {
        let owner = owner_of(key, 3);
        for rank in 0..3 {
            let held = cluster.shard(rank).unwrap().row_of(key).is_some();
            assert_eq!(held, rank == owner, "key {key} on worker {rank}");
        }
    }
    let admitted: usize = outputs.iter().map(|o| o.stats().admitted_keys).sum();
    assert_eq!(admitted, 5);
}

#[tokio::test]
async fn test_inference_never_mutates_shards() {
    let mut cluster = LocalCluster::new(config(Combiner::Mean, 1, 2), 2).unwrap();
    cluster.assign(2, &[4.0, 8.0]).unwrap();
    let before = cluster.snapshots();

    let batches = vec![
        SparseBatch::from_rows(&[vec![2, 7]], 2),
        SparseBatch::from_rows(&[vec![9]], 2),
    ];
    let outputs = cluster.forward(batches, Mode::Inference).await.unwrap();
    // Unseen key 7 reads as zero but still counts towards the mean.
    assert_eq!(outputs[0].values(), &[2.0, 4.0]);
    assert_eq!(outputs[1].values(), &[0.0, 0.0]);
    assert_eq!(cluster.snapshots(), before);

    let grads = vec![vec![1.0; 2], vec![1.0; 2]];
    assert!(matches!(
        cluster.backward(grads).await,
        Err(EmbeddingError::MissingForwardState)
    ));
}

#[tokio::test]
async fn test_backward_round_trip_sum() {
    let mut cluster = LocalCluster::new(config(Combiner::Sum, 2, 2), 2).unwrap();
    let batches = vec![
        SparseBatch::from_rows(&[vec![1, 2], vec![3]], 2),
        SparseBatch::from_rows(&[vec![4], vec![5, 6]], 2),
    ];
    cluster.forward(batches, Mode::Train).await.unwrap();

    let grads = cluster
        .backward(vec![vec![1.0; 4], vec![1.0; 4]])
        .await
        .unwrap();
    let mut keys: Vec<Key> = grads.iter().flat_map(|g| g.keys().to_vec()).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec![1, 2, 3, 4, 5, 6]);
    for grad in &grads {
        assert!(grad.values().iter().all(|&v| v == 1.0));
    }
}

#[tokio::test]
async fn test_backward_round_trip_mean() {
    let mut cluster = LocalCluster::new(config(Combiner::Mean, 1, 4), 2).unwrap();
    let batches = vec![
        SparseBatch::from_rows(&[vec![1, 2, 3, 4]], 4),
        SparseBatch::from_rows(&[vec![5, 6]], 4),
    ];
    cluster.forward(batches, Mode::Train).await.unwrap();

    let grads = cluster
        .backward(vec![vec![1.0; 2], vec![1.0; 2]])
        .await
        .unwrap();
    for grad in &grads {
        for &key in grad.keys() {
            let expected = if key <= 4 { 0.25 } else { 0.5 };
            assert_eq!(grad.grad_for_key(key), Some(&[expected, expected][..]));
        }
    }
}

#[tokio::test]
async fn test_sgd_update_moves_rows() {
    let mut cluster = LocalCluster::new(config(Combiner::Sum, 1, 2), 2).unwrap();
    cluster.assign(4, &[1.0, 1.0]).unwrap();
    cluster.assign(5, &[2.0, 2.0]).unwrap();

    let batches = vec![
        SparseBatch::from_rows(&[vec![4, 5]], 2),
        SparseBatch::from_rows(&[vec![5]], 2),
    ];
    cluster.forward(batches, Mode::Train).await.unwrap();
    let grads = cluster
        .backward(vec![vec![1.0, 2.0], vec![1.0, 1.0]])
        .await
        .unwrap();
    cluster.apply_gradients(&grads, -0.5).unwrap();

    assert_eq!(cluster.row(4), Some(&[0.5, 0.0][..]));
    // Key 5 was read by both workers.
    assert_eq!(cluster.row(5), Some(&[1.0, 0.5][..]));

    // The same step cannot be applied twice.
    assert!(cluster.apply_gradients(&grads, -0.5).is_err());
    assert_eq!(cluster.row(4), Some(&[0.5, 0.0][..]));
}

fn random_batches(rng: &mut StdRng, world: usize, key_space: u64) -> Vec<SparseBatch> {
    (0..world)
        .map(|_| {
            let rows: Vec<Vec<Key>> = (0..6)
                .map(|_| {
                    let nnz = rng.gen_range(0..=3);
                    (0..nnz).map(|_| rng.gen_range(0..key_space)).collect()
                })
                .collect();
            SparseBatch::from_rows(&rows, 3)
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_matches_single_worker_reference() {
    let mut rng = StdRng::seed_from_u64(7);
    let key_space = 20;
    let config = config(Combiner::Sum, 2, 3);
    let mut distributed = LocalCluster::new(config.clone(), 4).unwrap();

    for key in 0..key_space {
        let row = [key as f32, 1.0];
        distributed.assign(key, &row).unwrap();
    }

    for _ in 0..5 {
        let batches = random_batches(&mut rng, 4, key_space);
        let outputs = distributed
            .forward(batches.clone(), Mode::Inference)
            .await
            .unwrap();

        for (batch, output) in batches.iter().zip(&outputs) {
            let mut reference = LocalCluster::new(config.clone(), 1).unwrap();
            for key in 0..key_space {
                reference.assign(key, &[key as f32, 1.0]).unwrap();
            }
            let expected = reference
                .forward(vec![batch.clone()], Mode::Inference)
                .await
                .unwrap();
            assert_eq!(output.values(), expected[0].values());
        }
    }
}

#[tokio::test]
async fn test_results_are_deterministic() {
    let config = config(Combiner::Mean, 2, 3).with_initializer(InitializerConfig::Constant {
        value: 0.25,
    });
    let mut rng = StdRng::seed_from_u64(11);
    let batches = random_batches(&mut rng, 3, 50);

    let mut first = LocalCluster::new(config.clone(), 3).unwrap();
    let mut second = LocalCluster::new(config, 3).unwrap();
    let a = first.forward(batches.clone(), Mode::Train).await.unwrap();
    let b = second.forward(batches, Mode::Train).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(first.snapshots(), second.snapshots());
}

#[tokio::test]
async fn test_checkpoint_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = LocalCluster::new(config(Combiner::Sum, 1, 2), 2).unwrap();
    cluster.assign(3, &[1.0, 2.0]).unwrap();
    cluster.assign(8, &[3.0, 4.0]).unwrap();
    cluster.save_checkpoint(dir.path()).unwrap();

    let mut restored = LocalCluster::new(config(Combiner::Sum, 1, 2), 2).unwrap();
    restored.load_checkpoint(dir.path()).unwrap();
    assert_eq!(restored.snapshots(), cluster.snapshots());
    assert_eq!(restored.row(8), Some(&[3.0, 4.0][..]));
}

#[test]
fn test_router_is_stable() {
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..1000 {
        let key: Key = rng.gen();
        let world = rng.gen_range(1..=16);
        let owner = owner_of(key, world);
        assert!(owner < world);
        assert_eq!(owner, owner_of(key, world));
        assert_eq!(owner as u64, key % world as u64);
    }
}
