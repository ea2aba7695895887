//! Tests for the NOWAIT protocol
//!
//! These tests verify:
//! - Immediate abort on a held write lock or an unexpired read lease
//! - Shared read leases, their release by a sole reader and their expiry
//! - Promotion of the attempt's own read lease to a write lock
//! - Stale read leases abort the commit
//! - Locks are released on every abort path

use std::sync::Arc;

use rtxkv::clock::ManualClock;
use rtxkv::config::OneSidedOps;
use rtxkv::events::AbortReason;
use rtxkv::node::NodeId;
use rtxkv::store::{lease, LOCK_OFF};
use rtxkv::{new_txn, Cluster, Config, Protocol, RtxError, TxnAlgorithm, TxnContext};

const TABLE: u8 = 0;
const LEN: usize = 8;
const START_US: u64 = 1_000_000;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_cluster(ops: OneSidedOps) -> (Arc<Cluster>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START_US));
    let config = Config::builder()
        .nodes(3)
        .protocol(Protocol::Nowait)
        .one_sided(ops)
        .replication_factor(1)
        .lease(400, 50)
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

fn lock_word(cluster: &Arc<Cluster>, node: NodeId, key: u64) -> u64 {
    let node = cluster.node(node).unwrap();
    let loc = node.store().lookup(TABLE, key).unwrap();
    node.region().load(loc.off + LOCK_OFF).unwrap()
}

fn both_paths() -> [OneSidedOps; 2] {
    [OneSidedOps::all(), OneSidedOps::none()]
}

// =============================================================================
// Lock Tests
// =============================================================================

#[tokio::test]
async fn test_write_lock_held_until_commit() {
    for ops in both_paths() {
        let (cluster, _clock) = setup_cluster(ops);
        let mut txn = txn_on(&cluster, 0, 0);

        txn.begin().await.unwrap();
        let idx = txn.write(1, TABLE, 0, LEN).await.unwrap();
        assert!(lease::is_write_locked(lock_word(&cluster, 1, 0)));
        assert_eq!(lease::owner(lock_word(&cluster, 1, 0)), Some(0));

        txn.load_write(idx, LEN).unwrap().copy_from_slice(&150u64.to_le_bytes());
        assert!(txn.commit().await.unwrap());

        assert_eq!(lock_word(&cluster, 1, 0), 0);
        let value = cluster.node(1).unwrap().committed_value(TABLE, 0).unwrap();
        assert_eq!(balance(&value), 150);
    }
}

#[tokio::test]
async fn test_conflicting_write_aborts_immediately() {
    for ops in both_paths() {
        let (cluster, _clock) = setup_cluster(ops);
        let mut holder = txn_on(&cluster, 0, 0);
        let mut other = txn_on(&cluster, 2, 0);

        holder.begin().await.unwrap();
        holder.write(1, TABLE, 1, LEN).await.unwrap();

        other.begin().await.unwrap();
        other.write(1, TABLE, 2, LEN).await.unwrap();
        let err = other.write(1, TABLE, 1, LEN).await.unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::LockConflict));

        // the aborted attempt gave back the lock it did get
        assert!(!other.context().is_active());
        assert_eq!(lock_word(&cluster, 1, 2), 0);
        assert!(lease::is_write_locked(lock_word(&cluster, 1, 1)));

        holder.abort().await.unwrap();
        assert_eq!(lock_word(&cluster, 1, 1), 0);

        // a fresh attempt now gets the record at once
        other.begin().await.unwrap();
        other.write(1, TABLE, 1, LEN).await.unwrap();
        assert!(other.commit().await.unwrap());
    }
}

#[tokio::test]
async fn test_readers_share_a_lease() {
    for ops in both_paths() {
        let (cluster, _clock) = setup_cluster(ops);
        let mut first = txn_on(&cluster, 0, 0);
        let mut second = txn_on(&cluster, 2, 0);

        first.begin().await.unwrap();
        let a = first.read(1, TABLE, 3, LEN).await.unwrap();
        let word = lock_word(&cluster, 1, 3);
        assert!(!lease::is_write_locked(word));
        assert_eq!(lease::end_time(word), START_US + 400);
        assert_eq!(lease::sole_reader(word), Some(0));

        // joining keeps the end time and clears the installer's tag
        second.begin().await.unwrap();
        let b = second.read(1, TABLE, 3, LEN).await.unwrap();
        let shared = lock_word(&cluster, 1, 3);
        assert_eq!(shared, lease::r_lease(START_US + 400));
        assert_eq!(lease::sole_reader(shared), None);

        assert_eq!(balance(first.load_read(a, LEN).unwrap()), 100);
        assert_eq!(balance(second.load_read(b, LEN).unwrap()), 100);
        assert!(first.commit().await.unwrap());
        assert!(second.commit().await.unwrap());

        // nobody can hand a shared lease back: it stays until it runs out
        assert_eq!(lock_word(&cluster, 1, 3), shared);
    }
}

#[tokio::test]
async fn test_sole_reader_releases_lease() {
    for ops in both_paths() {
        let (cluster, _clock) = setup_cluster(ops);
        let mut reader = txn_on(&cluster, 0, 0);
        let mut writer = txn_on(&cluster, 2, 0);

        reader.begin().await.unwrap();
        reader.read(1, TABLE, 0, LEN).await.unwrap();
        assert_ne!(lock_word(&cluster, 1, 0), 0);
        assert!(reader.commit().await.unwrap());
        assert_eq!(lock_word(&cluster, 1, 0), 0);

        // the writer does not wait for the lease to run out
        writer.begin().await.unwrap();
        writer.write(1, TABLE, 0, LEN).await.unwrap();
        assert!(writer.commit().await.unwrap());

        // an aborted reader hands its lease back too
        reader.begin().await.unwrap();
        reader.read(1, TABLE, 1, LEN).await.unwrap();
        reader.abort().await.unwrap();
        assert_eq!(lock_word(&cluster, 1, 1), 0);
    }
}

#[tokio::test]
async fn test_write_waits_out_shared_lease() {
    let (cluster, clock) = setup_cluster(OneSidedOps::all());
    let mut first = txn_on(&cluster, 0, 0);
    let mut second = txn_on(&cluster, 0, 1);
    let mut writer = txn_on(&cluster, 2, 0);

    first.begin().await.unwrap();
    first.read(1, TABLE, 0, LEN).await.unwrap();
    second.begin().await.unwrap();
    second.read(1, TABLE, 0, LEN).await.unwrap();
    assert!(first.commit().await.unwrap());
    assert!(second.commit().await.unwrap());

    // lease still running: no writer gets in
    writer.begin().await.unwrap();
    let err = writer.write(1, TABLE, 0, LEN).await.unwrap_err();
    assert!(err.is_abort());

    // past the lease plus the skew margin the record is free again
    clock.advance(400 + 51);
    writer.begin().await.unwrap();
    writer.write(1, TABLE, 0, LEN).await.unwrap();
    assert!(writer.commit().await.unwrap());
}

#[tokio::test]
async fn test_read_of_write_locked_record_aborts() {
    let (cluster, _clock) = setup_cluster(OneSidedOps::all());
    let mut writer = txn_on(&cluster, 0, 0);
    let mut reader = txn_on(&cluster, 0, 1);

    writer.begin().await.unwrap();
    writer.write(1, TABLE, 2, LEN).await.unwrap();

    reader.begin().await.unwrap();
    let err = reader.read(1, TABLE, 2, LEN).await.unwrap_err();
    assert!(matches!(err, RtxError::Aborted(AbortReason::LockConflict)));
    writer.abort().await.unwrap();
}

// =============================================================================
// Commit Tests
// =============================================================================

#[tokio::test]
async fn test_expired_read_lease_aborts_commit() {
    let (cluster, clock) = setup_cluster(OneSidedOps::all());
    let mut txn = txn_on(&cluster, 0, 0);

    txn.begin().await.unwrap();
    txn.read(1, TABLE, 1, LEN).await.unwrap();
    let w = txn.write(2, TABLE, 1, LEN).await.unwrap();
    txn.load_write(w, LEN).unwrap().copy_from_slice(&1u64.to_le_bytes());

    clock.advance(400);
    assert!(!txn.commit().await.unwrap());

    let collector = cluster.node(0).unwrap().collector();
    assert_eq!(collector.aborts(AbortReason::StaleLease), 1);
    assert_eq!(lock_word(&cluster, 2, 1), 0);
    let value = cluster.node(2).unwrap().committed_value(TABLE, 1).unwrap();
    assert_eq!(balance(&value), 100);
}

#[tokio::test]
async fn test_read_then_write_promotes_lease() {
    for ops in both_paths() {
        let (cluster, _clock) = setup_cluster(ops);
        let mut txn = txn_on(&cluster, 0, 0);

        txn.begin().await.unwrap();
        let r = txn.read(1, TABLE, 0, LEN).await.unwrap();
        let seen = balance(txn.load_read(r, LEN).unwrap());
        let w = txn.write(1, TABLE, 0, LEN).await.unwrap();
        assert_eq!(lock_word(&cluster, 1, 0), lease::locked(0));
        assert_eq!(txn.read(1, TABLE, 0, LEN).await.unwrap(), r);

        txn.load_write(w, LEN).unwrap().copy_from_slice(&(seen + 7).to_le_bytes());
        assert!(txn.commit().await.unwrap());
        assert_eq!(lock_word(&cluster, 1, 0), 0);
        let value = cluster.node(1).unwrap().committed_value(TABLE, 0).unwrap();
        assert_eq!(balance(&value), 107);
    }
}

#[tokio::test]
async fn test_shared_lease_cannot_be_promoted() {
    let (cluster, _clock) = setup_cluster(OneSidedOps::all());
    let mut txn = txn_on(&cluster, 0, 0);
    let mut other = txn_on(&cluster, 2, 0);

    txn.begin().await.unwrap();
    txn.read(1, TABLE, 2, LEN).await.unwrap();
    other.begin().await.unwrap();
    other.read(1, TABLE, 2, LEN).await.unwrap();

    let err = txn.write(1, TABLE, 2, LEN).await.unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::LockConflict));
    assert!(other.commit().await.unwrap());
}

#[tokio::test]
async fn test_read_after_own_write() {
    for ops in both_paths() {
        let (cluster, clock) = setup_cluster(ops);
        let mut txn = txn_on(&cluster, 0, 0);

        txn.begin().await.unwrap();
        let w = txn.write(1, TABLE, 1, LEN).await.unwrap();
        let r = txn.read(1, TABLE, 1, LEN).await.unwrap();
        assert_eq!(balance(txn.load_read(r, LEN).unwrap()), 100);
        assert_eq!(lock_word(&cluster, 1, 1), lease::locked(0));

        // the write lock keeps the read safe past any lease
        clock.advance(1_000);
        txn.load_write(w, LEN).unwrap().copy_from_slice(&1u64.to_le_bytes());
        assert!(txn.commit().await.unwrap());
        assert_eq!(lock_word(&cluster, 1, 1), 0);
    }
}

#[tokio::test]
async fn test_begin_releases_abandoned_attempt() {
    for ops in both_paths() {
        let (cluster, _clock) = setup_cluster(ops);
        let mut txn = txn_on(&cluster, 0, 0);
        let mut other = txn_on(&cluster, 2, 0);

        txn.begin().await.unwrap();
        txn.write(1, TABLE, 0, LEN).await.unwrap();
        txn.read(1, TABLE, 1, LEN).await.unwrap();
        // never committed: the next begin gives everything back
        txn.begin().await.unwrap();
        txn.abort().await.unwrap();

        assert_eq!(lock_word(&cluster, 1, 0), 0);
        assert_eq!(lock_word(&cluster, 1, 1), 0);
        let collector = cluster.node(0).unwrap().collector();
        assert_eq!(collector.aborts(AbortReason::UserAbort), 2);

        other.begin().await.unwrap();
        other.write(1, TABLE, 0, LEN).await.unwrap();
        assert!(other.commit().await.unwrap());
    }
}

#[tokio::test]
async fn test_abort_frees_staged_buffers() {
    let (cluster, _clock) = setup_cluster(OneSidedOps::all());
    let mut txn = txn_on(&cluster, 0, 0);

    for _ in 0..100 {
        txn.begin().await.unwrap();
        txn.write(1, TABLE, 3, LEN).await.unwrap();
        txn.write(0, TABLE, 3, LEN).await.unwrap();
        txn.abort().await.unwrap();
    }
    assert_eq!(txn.context().gc().local_outstanding(), 0);
    assert_eq!(cluster.node(0).unwrap().heap().outstanding(), 0);
    assert_eq!(lock_word(&cluster, 1, 3), 0);
    assert_eq!(lock_word(&cluster, 0, 3), 0);
}
