//! Tests for workers and their coroutines
//!
//! These tests verify:
//! - Concurrent increments from several threads and coroutines are never lost
//! - Every attempt ends up committed, aborted or failed
//! - Failed attempts leave no locks or buffers behind

use std::sync::Arc;
use std::thread;

use rtxkv::config::OneSidedOps;
use rtxkv::node::NodeId;
use rtxkv::worker::TxnFuture;
use rtxkv::{Cluster, Config, Protocol, TxnAlgorithm, Worker, WorkerStats};

const TABLE: u8 = 0;
const LEN: usize = 8;
const HOT_KEYS: u64 = 4;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_cluster(protocol: Protocol, ops: OneSidedOps) -> Arc<Cluster> {
    let config = Config::builder()
        .nodes(3)
        .protocol(protocol)
        .one_sided(ops)
        .replication_factor(1)
        .coroutines(3)
        .build();
    let cluster = Cluster::new(config).unwrap();
    for node in cluster.nodes() {
        for key in 0..HOT_KEYS {
            node.load(TABLE, key, &0u64.to_le_bytes()).unwrap();
        }
    }
    cluster
}

fn decode(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[..8].try_into().unwrap())
}

/// Add one to a hot counter picked by the attempt number
fn increment<'a>(txn: &'a mut dyn TxnAlgorithm, attempt: u64, nodes: u64) -> TxnFuture<'a> {
    Box::pin(async move {
        txn.begin().await?;
        let node = (attempt % nodes) as NodeId;
        let key = (attempt / nodes) % HOT_KEYS;
        let idx = txn.write(node, TABLE, key, LEN).await?;
        let value = decode(txn.load_write(idx, LEN)?);
        txn.load_write(idx, LEN)?.copy_from_slice(&(value + 1).to_le_bytes());
        txn.commit().await
    })
}

fn remote_increment<'a>(txn: &'a mut dyn TxnAlgorithm, attempt: u64) -> TxnFuture<'a> {
    increment(txn, attempt, 3)
}

/// Lock one record, then touch a key that does not exist
fn write_missing<'a>(txn: &'a mut dyn TxnAlgorithm, _attempt: u64) -> TxnFuture<'a> {
    Box::pin(async move {
        txn.begin().await?;
        txn.write(1, TABLE, 0, LEN).await?;
        // an error, not an abort: the record stays locked until the worker aborts
        txn.write(2, TABLE, 99, LEN).await?;
        txn.commit().await
    })
}

/// Run two workers per node on their own threads
fn run_workers(cluster: &Arc<Cluster>, iterations: u64) -> WorkerStats {
    let nodes = cluster.nodes().len() as u64;
    let mut handles = Vec::new();
    for node in 0..nodes {
        for id in 0..2u8 {
            let worker = Worker::new(cluster.clone(), node as NodeId, id);
            handles.push(thread::spawn(move || {
                worker.run(iterations, move |txn, attempt| increment(txn, attempt, nodes))
            }));
        }
    }

    let mut stats = WorkerStats::default();
    for handle in handles {
        stats.merge(handle.join().unwrap().unwrap());
    }
    stats
}

fn counter_total(cluster: &Arc<Cluster>) -> u64 {
    cluster
        .nodes()
        .iter()
        .flat_map(|node| (0..HOT_KEYS).map(move |key| decode(&node.committed_value(TABLE, key).unwrap())))
        .sum()
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_no_lost_updates() {
    let protocols = [Protocol::Occ, Protocol::Nowait, Protocol::Mvcc, Protocol::Sundial];
    for protocol in protocols {
        for ops in [OneSidedOps::all(), OneSidedOps::none()] {
            let cluster = setup_cluster(protocol, ops);
            let stats = run_workers(&cluster, 40);

            // 3 nodes x 2 workers x 3 coroutines x 40 attempts
            assert_eq!(stats.attempts(), 720, "{:?}", protocol);
            assert_eq!(stats.failed, 0, "{:?}", protocol);
            assert!(stats.committed > 0, "{:?}", protocol);
            assert_eq!(counter_total(&cluster), stats.committed, "{:?}", protocol);
            assert_eq!(cluster.total_commits(), stats.committed, "{:?}", protocol);
            assert_eq!(cluster.total_aborts(), stats.aborted, "{:?}", protocol);

            for node in cluster.nodes() {
                assert_eq!(node.heap().outstanding(), 0, "{:?}", protocol);
                assert!(node.prepared().in_doubt().is_empty(), "{:?}", protocol);
            }
        }
    }
}

#[tokio::test]
async fn test_coroutines_interleave_on_one_runtime() {
    let cluster = setup_cluster(Protocol::Occ, OneSidedOps::all());
    let worker = Worker::new(cluster.clone(), 0, 0).with_coroutines(6);

    let stats = worker.run_async(25, Arc::new(remote_increment)).await.unwrap();

    assert_eq!(stats.attempts(), 150);
    assert_eq!(stats.failed, 0);
    assert_eq!(counter_total(&cluster), stats.committed);
    assert_eq!(cluster.node(0).unwrap().collector().commits(), stats.committed);
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_failed_attempts_are_cleaned_up() {
    let cluster = setup_cluster(Protocol::Nowait, OneSidedOps::all());
    let worker = Worker::new(cluster.clone(), 0, 0).with_coroutines(1);

    let stats = worker.run(10, write_missing).unwrap();

    assert_eq!(stats.failed, 10);
    assert_eq!(stats.committed, 0);

    let node = cluster.node(1).unwrap();
    let loc = node.store().lookup(TABLE, 0).unwrap();
    assert_eq!(node.region().load(loc.off).unwrap(), 0);
    assert_eq!(cluster.node(0).unwrap().heap().outstanding(), 0);
}

#[test]
fn test_worker_stats_merge() {
    let mut total = WorkerStats::default();
    total.merge(WorkerStats {
        committed: 3,
        aborted: 2,
        failed: 1,
    });
    total.merge(WorkerStats {
        committed: 1,
        aborted: 0,
        failed: 0,
    });
    assert_eq!(total.committed, 4);
    assert_eq!(total.attempts(), 7);
}
