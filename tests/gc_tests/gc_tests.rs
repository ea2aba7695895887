//! Tests for staged buffer reclamation
//!
//! These tests verify:
//! - Remote one-sided reads stage into the node's RDMA heap, local and RPC
//!   reads into the ordinary heap
//! - Every commit and abort path returns what it staged
//! - The RDMA heap recycles its chunks across attempts

use std::sync::Arc;

use rtxkv::config::OneSidedOps;
use rtxkv::gc::{BufferOrigin, Gc, RdmaHeap};
use rtxkv::node::NodeId;
use rtxkv::{new_txn, Cluster, Config, Protocol, TxnAlgorithm, TxnContext};

const TABLE: u8 = 0;
const LEN: usize = 8;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_cluster(protocol: Protocol, ops: OneSidedOps) -> Arc<Cluster> {
    let config = Config::builder()
        .nodes(2)
        .protocol(protocol)
        .one_sided(ops)
        .replication_factor(1)
        .lease(1_000_000, 1_000)
        .build();
    let cluster = Cluster::new(config).unwrap();
    for node in cluster.nodes() {
        for key in 0..4u64 {
            node.load(TABLE, key, &10u64.to_le_bytes()).unwrap();
        }
    }
    cluster
}

/// Read key 0 and increment key 1 on both nodes
async fn touch_both(txn: &mut dyn TxnAlgorithm) -> rtxkv::Result<bool> {
    txn.begin().await?;
    for node in [0 as NodeId, 1] {
        txn.read(node, TABLE, 0, LEN).await?;
        let idx = txn.write(node, TABLE, 1, LEN).await?;
        let value = u64::from_le_bytes(txn.load_write(idx, LEN)?[..8].try_into().unwrap());
        txn.load_write(idx, LEN)?.copy_from_slice(&(value + 1).to_le_bytes());
    }
    txn.commit().await
}

fn protocols() -> [Protocol; 4] {
    [Protocol::Occ, Protocol::Nowait, Protocol::Mvcc, Protocol::Sundial]
}

// =============================================================================
// Collector Tests
// =============================================================================

#[test]
fn test_collector_tracks_both_origins() {
    let heap = Arc::new(RdmaHeap::new(128));
    let mut gc = Gc::new(heap.clone());

    let bufs: Vec<_> = (0..4)
        .map(|i| if i % 2 == 0 { gc.local(32, 16, 8) } else { gc.rdma(32, 16, 8) })
        .collect();
    assert_eq!(gc.local_outstanding(), 2);
    assert_eq!(heap.outstanding(), 2);
    assert_eq!(
        bufs.iter().filter(|b| b.origin() == BufferOrigin::RdmaRegion).count(),
        2
    );

    for buf in bufs {
        gc.release(buf);
    }
    assert_eq!(gc.local_outstanding(), 0);
    assert_eq!(heap.outstanding(), 0);
    assert_eq!(heap.pooled(), 2);
}

#[test]
fn test_collectors_share_a_heap() {
    let heap = Arc::new(RdmaHeap::new(64));
    let mut first = Gc::new(heap.clone());
    let mut second = Gc::new(heap.clone());

    let buf = first.rdma(48, 16, 32);
    assert_eq!(heap.outstanding(), 1);
    // the heap takes the buffer back whichever collector returns it
    second.release(buf);
    assert_eq!(heap.outstanding(), 0);

    let again = second.rdma(48, 16, 32);
    assert_eq!(heap.pooled(), 0);
    first.release(again);
    assert_eq!(heap.pooled(), 1);
}

// =============================================================================
// Transaction Tests
// =============================================================================

#[tokio::test]
async fn test_commit_returns_every_buffer() {
    for protocol in protocols() {
        for ops in [OneSidedOps::all(), OneSidedOps::none()] {
            let cluster = setup_cluster(protocol, ops);
            let mut txn = new_txn(TxnContext::new(cluster.clone(), 0, 0, 0).unwrap());

            assert!(touch_both(txn.as_mut()).await.unwrap(), "{:?}", protocol);
            assert_eq!(txn.context().gc().local_outstanding(), 0, "{:?}", protocol);
            assert_eq!(cluster.node(0).unwrap().heap().outstanding(), 0, "{:?}", protocol);
            assert_eq!(txn.context().write_set().len(), 0);
        }
    }
}

#[tokio::test]
async fn test_one_sided_reads_recycle_heap_chunks() {
    let cluster = setup_cluster(Protocol::Occ, OneSidedOps::all());
    let heap = cluster.node(0).unwrap().heap().clone();
    let mut txn = new_txn(TxnContext::new(cluster.clone(), 0, 0, 0).unwrap());

    for _ in 0..50 {
        assert!(touch_both(txn.as_mut()).await.unwrap());
    }
    assert_eq!(heap.outstanding(), 0);
    // two remote records per attempt: the pool never grows past that
    assert!(heap.pooled() >= 1 && heap.pooled() <= 2);
}

#[tokio::test]
async fn test_rpc_path_stays_off_the_rdma_heap() {
    let cluster = setup_cluster(Protocol::Occ, OneSidedOps::none());
    let mut txn = new_txn(TxnContext::new(cluster.clone(), 0, 0, 0).unwrap());
    assert!(touch_both(txn.as_mut()).await.unwrap());
    assert_eq!(cluster.node(0).unwrap().heap().pooled(), 0);
}

#[tokio::test]
async fn test_abort_paths_return_every_buffer() {
    for protocol in protocols() {
        let cluster = setup_cluster(protocol, OneSidedOps::all());
        let mut holder = new_txn(TxnContext::new(cluster.clone(), 1, 0, 0).unwrap());
        let mut txn = new_txn(TxnContext::new(cluster.clone(), 0, 0, 0).unwrap());

        // user abort with staged reads and writes
        txn.begin().await.unwrap();
        txn.read(1, TABLE, 0, LEN).await.unwrap();
        txn.write(1, TABLE, 2, LEN).await.unwrap();
        txn.abort().await.unwrap();
        assert_eq!(txn.context().gc().local_outstanding(), 0, "{:?}", protocol);

        // OCC only conflicts at commit time
        if protocol == Protocol::Occ {
            continue;
        }

        // conflict abort in the middle of the write set
        holder.begin().await.unwrap();
        holder.write(1, TABLE, 3, LEN).await.unwrap();
        txn.begin().await.unwrap();
        txn.write(0, TABLE, 3, LEN).await.unwrap();
        let err = txn.write(1, TABLE, 3, LEN).await.unwrap_err();
        assert!(err.is_abort(), "{:?}", protocol);
        holder.abort().await.unwrap();

        assert_eq!(txn.context().gc().local_outstanding(), 0, "{:?}", protocol);
        assert_eq!(holder.context().gc().local_outstanding(), 0, "{:?}", protocol);
        for node in cluster.nodes() {
            assert_eq!(node.heap().outstanding(), 0, "{:?}", protocol);
        }
    }
}
