//! Transaction Module
//!
//! The concurrency-control protocols behind one interface.
//!
//! ## Lifecycle
//! ```text
//!   Idle ──begin──▶ Active ──commit──▶ Committed ─┐
//!                     │                            ├──▶ Idle
//!                     └──abort / failed commit──▶ Aborted ─┘
//! ```
//!
//! `read`/`write` return the stable set index of the record, or an error:
//! `KeyNotFound` for a missing key, `Aborted` when the protocol had to give up
//! at access time (every lock and buffer is already released by then).
//! `commit` returns `Ok(false)` on abort. Retrying is the caller's business.
//!
//! A protocol is picked once per worker through [`new_txn`]; the
//! `TxnAlgorithm` trait object is what workload code drives.

pub mod calvin;
mod mvcc;
mod nowait;
mod occ;
mod sundial;

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::txn_timestamp;
use crate::commit::{TwoPhaseCommit, Vote};
use crate::config::{Config, Protocol};
use crate::error::{Result, RtxError};
use crate::events::AbortReason;
use crate::gc::Gc;
use crate::log::{LogEntry, LogRecord, LoggedWrite, RemoteLogger};
use crate::network::Cluster;
use crate::node::{Node, NodeId};
use crate::rwset::RwSet;
use crate::store::{LockOwner, TableId};

pub use calvin::{CalvinTxn, DeclaredKey, DeclaredSets, DetRequest, Participation, Sequencer};
pub use mvcc::MvccTxn;
pub use nowait::NowaitTxn;
pub use occ::OccTxn;
pub use sundial::SundialTxn;

pub(crate) use mvcc::{install_version, lock_version, read_version, release_version, MvccLock, MvccRead};
pub(crate) use nowait::{lock_exclusive, lock_shared, release_lease};
pub(crate) use occ::{lock_record, release_record, validate_record, write_back};
pub(crate) use sundial::{lock_lease, read_lease, release_lease_lock, renew_lease, update_record};

/// The capability every protocol implements
#[async_trait]
pub trait TxnAlgorithm: Send {
    fn protocol(&self) -> Protocol;

    /// Start a new attempt; clears both sets
    ///
    /// An attempt still active from before is aborted first.
    async fn begin(&mut self) -> Result<()>;

    /// Add a record to the read set
    async fn read(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize>;

    /// Add a record to the write set
    async fn write(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize>;

    /// Staged value of read-set item `idx`
    fn load_read(&self, idx: usize, len: usize) -> Result<&[u8]>;

    /// Mutable staged value of write-set item `idx`
    fn load_write(&mut self, idx: usize, len: usize) -> Result<&mut [u8]>;

    /// Protocol-specific pre-commit step (lease renewal for Sundial)
    async fn prepare(&mut self) -> Result<bool> {
        Ok(true)
    }

    /// Try to commit; `Ok(false)` means the attempt aborted
    ///
    /// On `Err` the attempt stays active and still holds its locks and any
    /// prepared participants; `abort` (or the next `begin`) releases them.
    async fn commit(&mut self) -> Result<bool>;

    /// Give up the attempt, releasing everything it holds
    async fn abort(&mut self) -> Result<()>;

    fn context(&self) -> &TxnContext;
}

/// Build the protocol selected in the cluster's config
pub fn new_txn(ctx: TxnContext) -> Box<dyn TxnAlgorithm> {
    match ctx.config().protocol {
        Protocol::Occ => Box::new(OccTxn::new(ctx)),
        Protocol::Mvcc => Box::new(MvccTxn::new(ctx)),
        Protocol::Nowait => Box::new(NowaitTxn::new(ctx)),
        Protocol::Sundial => Box::new(SundialTxn::new(ctx)),
        Protocol::Calvin => Box::new(CalvinTxn::new(ctx)),
    }
}

// =============================================================================
// Transaction Context
// =============================================================================

/// State shared by every protocol: identity, sets and buffers
///
/// One context belongs to one coroutine and is reused across attempts.
pub struct TxnContext {
    pub(crate) cluster: Arc<Cluster>,
    pub(crate) node: Arc<Node>,
    worker: u8,
    cor: u16,
    pub(crate) gc: Gc,
    pub(crate) read_set: RwSet,
    pub(crate) write_set: RwSet,
    txn_id: u64,
    last_ts: u64,
    active: bool,
    /// Prepare round whose outcome has not been broadcast yet
    pending_vote: Option<Vote>,
}

impl TxnContext {
    /// Context for coroutine `cor` of worker `worker` on node `node`
    pub fn new(cluster: Arc<Cluster>, node: NodeId, worker: u8, cor: u16) -> Result<Self> {
        if worker >= 64 || cor >= 1024 {
            return Err(RtxError::Config(format!(
                "worker {} / coroutine {} do not fit the lock owner encoding",
                worker, cor
            )));
        }
        let node = cluster.node(node)?.clone();
        let gc = Gc::new(node.heap().clone());
        Ok(Self {
            cluster,
            node,
            worker,
            cor,
            gc,
            read_set: RwSet::new(),
            write_set: RwSet::new(),
            txn_id: 0,
            last_ts: 0,
            active: false,
            pending_vote: None,
        })
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn config(&self) -> &Config {
        self.cluster.config()
    }

    pub fn worker(&self) -> u8 {
        self.worker
    }

    pub fn cor(&self) -> u16 {
        self.cor
    }

    /// Lock word identity of this coroutine
    pub fn owner(&self) -> LockOwner {
        LockOwner::new(self.node.id(), self.worker, self.cor)
    }

    /// Id (start timestamp) of the current attempt
    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn read_set(&self) -> &RwSet {
        &self.read_set
    }

    pub fn write_set(&self) -> &RwSet {
        &self.write_set
    }

    pub fn gc(&self) -> &Gc {
        &self.gc
    }

    // =========================================================================
    // Lifecycle Helpers
    // =========================================================================

    /// Reset for a new attempt and return its start timestamp
    pub(crate) fn start(&mut self) -> u64 {
        self.release_buffers();
        self.txn_id = self.next_timestamp();
        self.active = true;
        self.txn_id
    }

    /// Next start timestamp, strictly increasing for this coroutine
    fn next_timestamp(&mut self) -> u64 {
        let mut ts = txn_timestamp(self.node.now_us(), self.node.id(), self.worker, self.cor);
        if ts <= self.last_ts {
            // same clock reading as last time: move up a tick, keep the low bits
            ts = self.last_ts + (1 << crate::clock::TIMESTAMP_SHIFT);
        }
        self.last_ts = ts;
        ts
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(RtxError::NotActive)
        }
    }

    pub(crate) fn release_buffers(&mut self) {
        self.gc.release_set(&mut self.read_set);
        self.gc.release_set(&mut self.write_set);
    }

    /// Close a committed attempt
    pub(crate) fn finish_commit(&mut self) -> bool {
        self.release_buffers();
        self.active = false;
        self.node.collector().record_commit();
        tracing::trace!(
            node = self.node.id(),
            worker = self.worker,
            cor = self.cor,
            txn = self.txn_id,
            "transaction committed"
        );
        true
    }

    /// Close an aborted attempt; locks must already be released
    pub(crate) fn finish_abort(&mut self, reason: AbortReason) -> bool {
        self.release_buffers();
        self.active = false;
        self.node.collector().record_abort(reason);
        tracing::debug!(
            node = self.node.id(),
            worker = self.worker,
            cor = self.cor,
            txn = self.txn_id,
            reason = reason.as_str(),
            "transaction aborted"
        );
        false
    }

    /// Close an attempt that neither commits nor aborts on this node
    pub(crate) fn finish_passive(&mut self) {
        self.release_buffers();
        self.active = false;
        tracing::trace!(
            node = self.node.id(),
            worker = self.worker,
            cor = self.cor,
            txn = self.txn_id,
            "transaction finished without local commit"
        );
    }

    /// Prepare round over the remote write set
    ///
    /// The participants are remembered until [`TxnContext::decide`] runs, so
    /// an abort after a failed log or apply still reaches them. A no vote is
    /// decided on the spot.
    pub(crate) async fn prepare_writes(&mut self) -> Result<bool> {
        let prepared = TwoPhaseCommit::new(&self.cluster, &self.node)
            .prepare(self.txn_id, &self.write_set)
            .await;
        let vote = match prepared {
            Ok(vote) => vote,
            Err(e) if self.config().two_phase_commit => {
                // some participants may have voted before the round failed
                let local = self.node.id();
                self.pending_vote = Some(Vote {
                    yes: false,
                    participants: self.write_set.participants().into_iter().filter(|pid| *pid != local).collect(),
                });
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let yes = vote.yes;
        self.pending_vote = Some(vote);
        if !yes {
            self.decide(false).await?;
        }
        Ok(yes)
    }

    /// Broadcast the outcome of the pending prepare round, if there is one
    pub(crate) async fn decide(&mut self, commit: bool) -> Result<()> {
        if let Some(vote) = self.pending_vote.take() {
            TwoPhaseCommit::new(&self.cluster, &self.node)
                .decide(self.txn_id, &vote, commit)
                .await?;
        }
        Ok(())
    }

    /// Whether a prepare round of this attempt still waits for its outcome
    pub fn undecided(&self) -> bool {
        self.pending_vote.is_some()
    }

    /// Replicate the staged write set to the backups of every written machine
    ///
    /// With `local_only` just the records owned by this node are logged.
    pub(crate) async fn log_writes(&self, timestamp: u64, local_only: bool) -> Result<()> {
        let local = self.node.id();
        let logged = |pid: NodeId| !local_only || pid == local;
        if !self.write_set.iter().any(|item| logged(item.pid())) {
            return Ok(());
        }
        let mut writes = Vec::with_capacity(self.write_set.len());
        let mut macs = std::collections::BTreeSet::new();
        for (idx, item) in self.write_set.iter().enumerate() {
            if !logged(item.pid()) {
                continue;
            }
            macs.insert(item.pid());
            writes.push(LoggedWrite {
                table: item.table(),
                key: item.key(),
                value: self.write_set.staged(idx, item.len())?.to_vec(),
            });
        }
        let entry = LogEntry::new(
            self.txn_id,
            LogRecord {
                coordinator: self.node.id(),
                timestamp,
                writes,
            },
        );
        RemoteLogger::new(&self.cluster, &self.node)
            .log(&entry, &macs)
            .await
    }
}

impl std::fmt::Debug for TxnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnContext")
            .field("node", &self.node.id())
            .field("worker", &self.worker)
            .field("cor", &self.cor)
            .field("txn", &self.txn_id)
            .field("reads", &self.read_set.len())
            .field("writes", &self.write_set.len())
            .finish()
    }
}

/// Abort error for `read`/`write`
pub(crate) fn aborted(reason: AbortReason) -> RtxError {
    RtxError::Aborted(reason)
}
