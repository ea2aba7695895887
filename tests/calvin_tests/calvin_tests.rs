//! Tests for the Calvin protocol
//!
//! These tests verify:
//! - Active, passive and uninvolved machines per request
//! - Value forwarding over one-sided slots and the RPC mailbox
//! - Deterministic lock order across concurrently running lanes
//! - Sequencer and assignment checks
//! - Lock release when request logic fails

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rtxkv::config::OneSidedOps;
use rtxkv::node::NodeId;
use rtxkv::txn::calvin::{run_request, CalvinTxn, DeclaredSets, Participation, Sequencer};
use rtxkv::{Cluster, Config, Protocol, Result, RtxError, TxnAlgorithm, TxnContext};

const TABLE: u8 = 0;
const LEN: usize = 8;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_cluster(ops: OneSidedOps) -> Arc<Cluster> {
    let config = Config::builder()
        .nodes(3)
        .protocol(Protocol::Calvin)
        .one_sided(ops)
        .replication_factor(1)
        .coroutines(2)
        .build();
    let cluster = Cluster::new(config).unwrap();
    for node in cluster.nodes() {
        let base = node.id() as u64 * 100;
        for key in 0..4u64 {
            node.load(TABLE, key, &(base + key).to_le_bytes()).unwrap();
        }
    }
    cluster
}

/// One Calvin context per node on `lane`
fn lane_txns(cluster: &Arc<Cluster>, lane: u16) -> Vec<CalvinTxn> {
    cluster
        .nodes()
        .iter()
        .map(|node| CalvinTxn::new(TxnContext::new(cluster.clone(), node.id(), 0, lane).unwrap()))
        .collect()
}

fn decode(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[..8].try_into().unwrap())
}

fn committed(cluster: &Arc<Cluster>, node: NodeId, key: u64) -> u64 {
    decode(&cluster.node(node).unwrap().committed_value(TABLE, key).unwrap())
}

/// Move 5 from write 0 to write 1 when write 0 can cover it
fn transfer(t: &mut CalvinTxn) -> Result<()> {
    let from = decode(t.load_write(0, LEN)?);
    let to = decode(t.load_write(1, LEN)?);
    if from < 5 {
        return Ok(());
    }
    t.load_write(0, LEN)?.copy_from_slice(&(from - 5).to_le_bytes());
    t.load_write(1, LEN)?.copy_from_slice(&(to + 5).to_le_bytes());
    Ok(())
}

fn both_paths() -> [OneSidedOps; 2] {
    [OneSidedOps::all(), OneSidedOps::none()]
}

// =============================================================================
// Participation Tests
// =============================================================================

#[tokio::test]
async fn test_passive_and_idle_machines_skip_logic() {
    for ops in both_paths() {
        let cluster = setup_cluster(ops);
        let sequencer = Sequencer::new(cluster.clone());
        let runs = Arc::new(AtomicUsize::new(0));

        let sets = DeclaredSets::new()
            .read(1, TABLE, 2, LEN)
            .write(0, TABLE, 2, LEN);
        let request = sequencer.submit(0, sets).unwrap();

        let counter = runs.clone();
        let logic = Arc::new(move |t: &mut CalvinTxn| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            let seen = decode(t.load_read(0, LEN)?);
            t.load_write(0, LEN)?.copy_from_slice(&seen.to_le_bytes());
            Ok(())
        });
        let (_txns, participation) = run_request(lane_txns(&cluster, 0), request, logic)
            .await
            .unwrap();

        assert_eq!(
            participation,
            vec![
                Some(Participation::Active),
                Some(Participation::NotParticipating),
                None
            ]
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // node 1's value reached node 0
        assert_eq!(committed(&cluster, 0, 2), 102);
        assert_eq!(cluster.node(0).unwrap().collector().commits(), 1);
        assert_eq!(cluster.node(1).unwrap().collector().commits(), 0);
    }
}

#[tokio::test]
async fn test_reader_also_writing_is_active() {
    let cluster = setup_cluster(OneSidedOps::all());
    let sequencer = Sequencer::new(cluster.clone());

    let sets = DeclaredSets::new()
        .read(0, TABLE, 1, LEN)
        .read(2, TABLE, 1, LEN)
        .write(0, TABLE, 3, LEN)
        .write(2, TABLE, 3, LEN);
    assert_eq!(sets.passive().len(), 0);
    let request = sequencer.submit(1, sets).unwrap();

    let logic = Arc::new(|t: &mut CalvinTxn| -> Result<()> {
        let sum = decode(t.load_read(0, LEN)?) + decode(t.load_read(1, LEN)?);
        t.load_write(0, LEN)?.copy_from_slice(&sum.to_le_bytes());
        t.load_write(1, LEN)?.copy_from_slice(&sum.to_le_bytes());
        Ok(())
    });
    let (_txns, participation) = run_request(lane_txns(&cluster, 1), request, logic)
        .await
        .unwrap();

    assert_eq!(participation[0], Some(Participation::Active));
    assert_eq!(participation[1], None);
    assert_eq!(participation[2], Some(Participation::Active));
    assert_eq!(committed(&cluster, 0, 3), 1 + 201);
    assert_eq!(committed(&cluster, 2, 3), 1 + 201);
}

// =============================================================================
// Execution Tests
// =============================================================================

#[tokio::test]
async fn test_cross_node_transfer() {
    for ops in both_paths() {
        let cluster = setup_cluster(ops);
        let sequencer = Sequencer::new(cluster.clone());
        let mut txns = lane_txns(&cluster, 0);

        for _ in 0..3 {
            let sets = DeclaredSets::new()
                .write(0, TABLE, 0, LEN)
                .write(1, TABLE, 0, LEN);
            let request = sequencer.submit(0, sets).unwrap();
            let (back, _) = run_request(txns, request, Arc::new(transfer)).await.unwrap();
            txns = back;
        }

        // account 0 on node 0 starts empty: nothing moves
        assert_eq!(committed(&cluster, 0, 0), 0);
        assert_eq!(committed(&cluster, 1, 0), 100);

        for _ in 0..3 {
            let sets = DeclaredSets::new()
                .write(1, TABLE, 0, LEN)
                .write(0, TABLE, 0, LEN);
            let request = sequencer.submit(0, sets).unwrap();
            let (back, _) = run_request(txns, request, Arc::new(transfer)).await.unwrap();
            txns = back;
        }
        assert_eq!(committed(&cluster, 1, 0), 85);
        assert_eq!(committed(&cluster, 0, 0), 15);

        for node in cluster.nodes() {
            assert_eq!(node.lock_queue().pending(), 0);
            assert!(node.mailbox().is_empty());
        }
    }
}

#[tokio::test]
async fn test_lanes_apply_conflicting_requests_in_order() {
    for ops in both_paths() {
        let cluster = setup_cluster(ops);
        let sequencer = Sequencer::new(cluster.clone());

        let sets = || {
            DeclaredSets::new()
                .write(1, TABLE, 1, LEN)
                .write(2, TABLE, 1, LEN)
        };
        let first = sequencer.submit(0, sets()).unwrap();
        let second = sequencer.submit(1, sets()).unwrap();
        assert!(first.seq < second.seq);

        let (a, b) = tokio::join!(
            run_request(lane_txns(&cluster, 0), first, Arc::new(transfer)),
            run_request(lane_txns(&cluster, 1), second, Arc::new(transfer)),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(committed(&cluster, 1, 1), 101 - 10);
        assert_eq!(committed(&cluster, 2, 1), 201 + 10);
    }
}

#[tokio::test]
async fn test_failed_logic_releases_locks() {
    let cluster = setup_cluster(OneSidedOps::all());
    let sequencer = Sequencer::new(cluster.clone());

    let sets = DeclaredSets::new().write(0, TABLE, 1, LEN).read(1, TABLE, 1, LEN);
    let request = sequencer.submit(0, sets).unwrap();
    let logic = Arc::new(|t: &mut CalvinTxn| -> Result<()> {
        t.load_write(0, LEN)?.copy_from_slice(&0u64.to_le_bytes());
        // index 3 was never declared
        t.load_read(3, LEN)?;
        Ok(())
    });

    let err = run_request(lane_txns(&cluster, 0), request, logic)
        .await
        .unwrap_err();
    assert!(matches!(err, RtxError::InvalidIndex { index: 3, .. }));

    assert_eq!(committed(&cluster, 0, 1), 1);
    for node in cluster.nodes() {
        assert_eq!(node.lock_queue().pending(), 0);
    }

    // the next request on the same records is not held up
    let sets = DeclaredSets::new().write(0, TABLE, 1, LEN);
    let request = sequencer.submit(0, sets).unwrap();
    let logic = Arc::new(|t: &mut CalvinTxn| -> Result<()> {
        t.load_write(0, LEN)?.copy_from_slice(&42u64.to_le_bytes());
        Ok(())
    });
    run_request(lane_txns(&cluster, 0), request, logic).await.unwrap();
    assert_eq!(committed(&cluster, 0, 1), 42);
}

#[tokio::test]
async fn test_undeclared_access_is_rejected() {
    let cluster = setup_cluster(OneSidedOps::all());
    let sequencer = Sequencer::new(cluster.clone());
    let request = sequencer
        .submit(0, DeclaredSets::new().write(0, TABLE, 0, LEN))
        .unwrap();

    let mut txn = CalvinTxn::new(TxnContext::new(cluster.clone(), 0, 0, 0).unwrap());
    txn.assign(request).unwrap();
    txn.begin().await.unwrap();
    assert_eq!(txn.write(0, TABLE, 0, LEN).await.unwrap(), 0);
    assert!(matches!(
        txn.read(0, TABLE, 3, LEN).await,
        Err(RtxError::Protocol(_))
    ));
    txn.abort().await.unwrap();
    assert_eq!(cluster.node(0).unwrap().lock_queue().pending(), 0);
}

// =============================================================================
// Sequencer Tests
// =============================================================================

#[test]
fn test_sequencer_rejects_bad_requests() {
    let cluster = setup_cluster(OneSidedOps::all());
    let sequencer = Sequencer::new(cluster.clone());

    let sets = DeclaredSets::new().write(0, TABLE, 0, LEN);
    assert!(matches!(
        sequencer.submit(2, sets.clone()),
        Err(RtxError::Config(_))
    ));

    let mut wide = DeclaredSets::new();
    for key in 0..9 {
        wide = wide.write(0, TABLE, key, LEN);
    }
    assert!(matches!(sequencer.submit(0, wide), Err(RtxError::Config(_))));

    assert!(matches!(
        sequencer.submit(0, DeclaredSets::new().write(7, TABLE, 0, LEN)),
        Err(RtxError::Network(_))
    ));

    // nothing was queued by the rejected requests
    for node in cluster.nodes() {
        assert_eq!(node.lock_queue().pending(), 0);
    }
    let request = sequencer.submit(1, sets).unwrap();
    assert_eq!(request.seq, 1);
    assert_eq!(request.lane, 1);
}

#[test]
fn test_assign_checks_lane() {
    let cluster = setup_cluster(OneSidedOps::all());
    let sequencer = Sequencer::new(cluster.clone());
    let request = sequencer
        .submit(1, DeclaredSets::new().write(0, TABLE, 0, LEN))
        .unwrap();

    let mut txn = CalvinTxn::new(TxnContext::new(cluster.clone(), 0, 0, 0).unwrap());
    assert!(matches!(txn.assign(request.clone()), Err(RtxError::Config(_))));
    assert!(txn.request().is_none());

    let mut txn = CalvinTxn::new(TxnContext::new(cluster, 0, 0, 1).unwrap());
    txn.assign(request).unwrap();
    assert_eq!(txn.request().map(|r| r.seq), Some(1));
}
