//! Tests for the MVCC protocol
//!
//! These tests verify:
//! - Snapshot reads see the newest version no younger than the reader
//! - Late writers abort once a younger transaction read or wrote the record
//! - Lock ownership by timestamp, local spin and remote no-wait
//! - The version ring overwrites its oldest slot
//! - Readers stop on a lock held by an older writer

use std::sync::Arc;

use rtxkv::clock::ManualClock;
use rtxkv::config::OneSidedOps;
use rtxkv::events::AbortReason;
use rtxkv::node::NodeId;
use rtxkv::store::{RecordLayout, LOCK_OFF, MV_RTS_OFF};
use rtxkv::{new_txn, Cluster, Config, Protocol, TxnAlgorithm, TxnContext};

const TABLE: u8 = 0;
const LEN: usize = 8;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_cluster(ops: OneSidedOps) -> (Arc<Cluster>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let config = Config::builder()
        .nodes(2)
        .protocol(Protocol::Mvcc)
        .one_sided(ops)
        .replication_factor(1)
        .mvcc_lock_spin_limit(4)
        .build();
    let cluster = Cluster::with_clock(config, clock.clone()).unwrap();
    for node in cluster.nodes() {
        for key in 0..4u64 {
            node.load(TABLE, key, &100u64.to_le_bytes()).unwrap();
        }
    }
    (cluster, clock)
}

fn txn_on(cluster: &Arc<Cluster>, node: NodeId, cor: u16) -> Box<dyn TxnAlgorithm> {
    new_txn(TxnContext::new(cluster.clone(), node, 0, cor).unwrap())
}

fn balance(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[..8].try_into().unwrap())
}

fn header_word(cluster: &Arc<Cluster>, node: NodeId, key: u64, field: u64) -> u64 {
    let node = cluster.node(node).unwrap();
    let loc = node.store().lookup(TABLE, key).unwrap();
    node.region().load(loc.off + field).unwrap()
}

async fn put(txn: &mut dyn TxnAlgorithm, node: NodeId, key: u64, value: u64) -> rtxkv::Result<bool> {
    txn.begin().await?;
    let idx = txn.write(node, TABLE, key, LEN).await?;
    txn.load_write(idx, LEN)?.copy_from_slice(&value.to_le_bytes());
    txn.commit().await
}

fn both_paths() -> [OneSidedOps; 2] {
    [OneSidedOps::all(), OneSidedOps::none()]
}

// =============================================================================
// Read Tests
// =============================================================================

#[tokio::test]
async fn test_reader_sees_its_snapshot() {
    for ops in both_paths() {
        let (cluster, clock) = setup_cluster(ops);
        let mut old = txn_on(&cluster, 0, 0);
        let mut young = txn_on(&cluster, 0, 1);

        old.begin().await.unwrap();
        clock.advance(10);
        assert!(put(young.as_mut(), 1, 0, 200).await.unwrap());

        let idx = old.read(1, TABLE, 0, LEN).await.unwrap();
        assert_eq!(balance(old.load_read(idx, LEN).unwrap()), 100);
        assert!(old.commit().await.unwrap());

        // a transaction started after the write sees it
        clock.advance(10);
        old.begin().await.unwrap();
        let idx = old.read(1, TABLE, 0, LEN).await.unwrap();
        assert_eq!(balance(old.load_read(idx, LEN).unwrap()), 200);
        assert!(old.commit().await.unwrap());
    }
}

#[tokio::test]
async fn test_read_raises_read_timestamp() {
    let (cluster, _clock) = setup_cluster(OneSidedOps::all());
    let mut txn = txn_on(&cluster, 0, 0);

    txn.begin().await.unwrap();
    let ts = txn.context().txn_id();
    txn.read(1, TABLE, 2, LEN).await.unwrap();
    assert_eq!(header_word(&cluster, 1, 2, MV_RTS_OFF), ts);
    assert!(txn.commit().await.unwrap());
}

#[tokio::test]
async fn test_reader_stops_at_older_writers_lock() {
    for ops in both_paths() {
        let (cluster, clock) = setup_cluster(ops);
        let mut writer = txn_on(&cluster, 0, 0);
        let mut reader = txn_on(&cluster, 0, 1);

        writer.begin().await.unwrap();
        writer.write(1, TABLE, 1, LEN).await.unwrap();

        clock.advance(10);
        reader.begin().await.unwrap();
        let err = reader.read(1, TABLE, 1, LEN).await.unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::LockConflict));
        writer.abort().await.unwrap();
    }
}

#[tokio::test]
async fn test_older_reader_ignores_younger_lock() {
    let (cluster, clock) = setup_cluster(OneSidedOps::all());
    let mut reader = txn_on(&cluster, 0, 0);
    let mut writer = txn_on(&cluster, 0, 1);

    reader.begin().await.unwrap();
    clock.advance(10);
    writer.begin().await.unwrap();
    writer.write(1, TABLE, 1, LEN).await.unwrap();

    let idx = reader.read(1, TABLE, 1, LEN).await.unwrap();
    assert_eq!(balance(reader.load_read(idx, LEN).unwrap()), 100);
    assert!(reader.commit().await.unwrap());

    // the younger writer was not invalidated by the older read
    assert!(writer.commit().await.unwrap());
}

#[tokio::test]
async fn test_version_ring_overwrites_oldest() {
    for ops in both_paths() {
        let (cluster, clock) = setup_cluster(ops);
        let mut ancient = txn_on(&cluster, 0, 0);
        let mut writer = txn_on(&cluster, 0, 1);

        ancient.begin().await.unwrap();
        for value in 1..=4u64 {
            clock.advance(10);
            assert!(put(writer.as_mut(), 1, 3, value).await.unwrap());
        }

        let node = cluster.node(1).unwrap();
        assert_eq!(balance(&node.committed_value(TABLE, 3).unwrap()), 4);
        // the initial version (slot 0) was the last one overwritten
        assert_ne!(header_word(&cluster, 1, 3, RecordLayout::wts_offset(0)), 1);

        let err = ancient.read(1, TABLE, 3, LEN).await.unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::VersionInvisible));
    }
}

// =============================================================================
// Write Tests
// =============================================================================

#[tokio::test]
async fn test_write_after_younger_read_aborts() {
    for ops in both_paths() {
        let (cluster, clock) = setup_cluster(ops);
        let mut old = txn_on(&cluster, 0, 0);
        let mut young = txn_on(&cluster, 0, 1);

        old.begin().await.unwrap();
        clock.advance(10);
        young.begin().await.unwrap();
        young.read(1, TABLE, 2, LEN).await.unwrap();
        assert!(young.commit().await.unwrap());

        let err = old.write(1, TABLE, 2, LEN).await.unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::LockConflict));
        assert_eq!(header_word(&cluster, 1, 2, LOCK_OFF), 0);
    }
}

#[tokio::test]
async fn test_younger_lock_holder_wins() {
    for ops in both_paths() {
        let (cluster, clock) = setup_cluster(ops);
        let mut old = txn_on(&cluster, 0, 0);
        let mut young = txn_on(&cluster, 0, 1);

        old.begin().await.unwrap();
        clock.advance(10);
        young.begin().await.unwrap();
        young.write(1, TABLE, 0, LEN).await.unwrap();

        assert!(old.write(1, TABLE, 0, LEN).await.unwrap_err().is_abort());
        assert_eq!(
            header_word(&cluster, 1, 0, LOCK_OFF),
            young.context().txn_id()
        );
        assert!(young.commit().await.unwrap());
        assert_eq!(header_word(&cluster, 1, 0, LOCK_OFF), 0);
    }
}

#[tokio::test]
async fn test_local_writer_gives_up_after_spinning() {
    let (cluster, clock) = setup_cluster(OneSidedOps::all());
    let mut old = txn_on(&cluster, 0, 0);
    let mut young = txn_on(&cluster, 0, 1);

    old.begin().await.unwrap();
    old.write(0, TABLE, 1, LEN).await.unwrap();

    clock.advance(10);
    young.begin().await.unwrap();
    let err = young.write(0, TABLE, 1, LEN).await.unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::LockConflict));

    // the older holder still commits
    assert!(old.commit().await.unwrap());
    assert_eq!(header_word(&cluster, 0, 1, LOCK_OFF), 0);
}

#[tokio::test]
async fn test_write_reads_newest_version() {
    let (cluster, clock) = setup_cluster(OneSidedOps::all());
    let mut txn = txn_on(&cluster, 0, 0);

    assert!(put(txn.as_mut(), 1, 0, 7).await.unwrap());
    clock.advance(10);

    txn.begin().await.unwrap();
    let idx = txn.write(1, TABLE, 0, LEN).await.unwrap();
    assert_eq!(balance(txn.load_write(idx, LEN).unwrap()), 7);
    assert_eq!(txn.write(1, TABLE, 0, LEN).await.unwrap(), idx);
    let value = balance(txn.load_write(idx, LEN).unwrap());
    txn.load_write(idx, LEN).unwrap().copy_from_slice(&(value * 2).to_le_bytes());
    assert!(txn.commit().await.unwrap());

    let node = cluster.node(1).unwrap();
    assert_eq!(balance(&node.committed_value(TABLE, 0).unwrap()), 14);
}

#[tokio::test]
async fn test_abort_unlocks_every_record() {
    let (cluster, _clock) = setup_cluster(OneSidedOps::none());
    let mut txn = txn_on(&cluster, 0, 0);

    txn.begin().await.unwrap();
    for key in 0..3 {
        txn.write(1, TABLE, key, LEN).await.unwrap();
    }
    txn.abort().await.unwrap();

    for key in 0..3 {
        assert_eq!(header_word(&cluster, 1, key, LOCK_OFF), 0);
    }
    assert_eq!(txn.context().gc().local_outstanding(), 0);
}
