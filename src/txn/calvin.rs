//! Calvin: deterministic execution of pre-declared transactions
//!
//! A request declares its read and write sets up front. The [`Sequencer`]
//! gives it a global sequence number and queues its locks on every machine
//! it touches, in sequence order, so every machine grants conflicting
//! requests in the same order and no request ever aborts on a conflict.
//!
//! Each participant then runs the same request:
//!
//! 1. `begin` waits for its local locks and stages its local records
//! 2. `sync_reads` forwards the local values to every *active* participant
//!    (a machine that writes something); *passive* participants (read-only)
//!    and machines not involved at all stop here
//! 3. active participants wait for every forwarded value, run the logic on
//!    the now complete sets, and `commit` applies only their local writes
//!
//! Forwarded values travel through the target's forwarding slots (one-sided
//! writes, the length word written last) or through a `CalvinForward` RPC
//! into its mailbox.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::access::{self, RecordRef};
use crate::config::Protocol;
use crate::error::{Result, RtxError};
use crate::events::AbortReason;
use crate::network::Cluster;
use crate::node::NodeId;
use crate::rpc::{BatchOp, RequestEntry, RpcKind};
use crate::rwset::ReadSetItem;
use crate::store::TableId;

use super::occ::write_back;
use super::{TxnAlgorithm, TxnContext};

/// Bits of a forwarding key below the request sequence number
const FORWARD_KEY_SHIFT: u32 = 16;

// =============================================================================
// Requests
// =============================================================================

/// One record a request declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredKey {
    pub pid: NodeId,
    pub table: TableId,
    pub key: u64,
    pub len: u32,
}

/// Read and write sets of a request, fixed before it runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredSets {
    pub reads: Vec<DeclaredKey>,
    pub writes: Vec<DeclaredKey>,
}

impl DeclaredSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a read of `(pid, table, key)`
    pub fn read(mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Self {
        self.reads.push(DeclaredKey {
            pid,
            table,
            key,
            len: len as u32,
        });
        self
    }

    /// Declare a write of `(pid, table, key)`
    pub fn write(mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Self {
        self.writes.push(DeclaredKey {
            pid,
            table,
            key,
            len: len as u32,
        });
        self
    }

    /// Machines owning a written record
    pub fn active(&self) -> BTreeSet<NodeId> {
        self.writes.iter().map(|k| k.pid).collect()
    }

    /// Machines owning only read records
    pub fn passive(&self) -> BTreeSet<NodeId> {
        let active = self.active();
        self.reads
            .iter()
            .map(|k| k.pid)
            .filter(|pid| !active.contains(pid))
            .collect()
    }

    pub fn participants(&self) -> BTreeSet<NodeId> {
        self.reads.iter().chain(&self.writes).map(|k| k.pid).collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Locks `node` must queue for this request, writes exclusive
    fn local_locks(&self, node: NodeId) -> Vec<LockRequest> {
        let mut locks: Vec<LockRequest> = self
            .writes
            .iter()
            .filter(|k| k.pid == node)
            .map(|k| LockRequest::new(k.table, k.key, LockMode::Exclusive))
            .collect();
        for k in self.reads.iter().filter(|k| k.pid == node) {
            if !locks.iter().any(|l| l.table == k.table && l.key == k.key) {
                locks.push(LockRequest::new(k.table, k.key, LockMode::Shared));
            }
        }
        locks
    }
}

/// A sequenced request, bound to the coroutine lane that runs it everywhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetRequest {
    pub seq: u64,
    pub lane: u16,
    pub sets: DeclaredSets,
}

/// What `sync_reads` left this machine with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participation {
    /// Every value is staged; run the logic and commit
    Active,
    /// Nothing more to do here for this request
    NotParticipating,
}

// =============================================================================
// Lock Queue
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LockRequest {
    table: TableId,
    key: u64,
    mode: LockMode,
}

impl LockRequest {
    fn new(table: TableId, key: u64, mode: LockMode) -> Self {
        Self { table, key, mode }
    }
}

/// Per-node FIFO lock queues in request sequence order
///
/// A request holds a record once every request ahead of it in that record's
/// queue is compatible: shared behind shared only, exclusive at the head only.
#[derive(Debug, Default)]
pub struct LockQueue {
    queues: Mutex<HashMap<(TableId, u64), VecDeque<(u64, LockMode)>>>,
}

impl LockQueue {
    fn enqueue(&self, seq: u64, locks: &[LockRequest]) {
        let mut queues = self.queues.lock();
        for lock in locks {
            queues
                .entry((lock.table, lock.key))
                .or_default()
                .push_back((seq, lock.mode));
        }
    }

    fn granted(&self, seq: u64, locks: &[LockRequest]) -> bool {
        let queues = self.queues.lock();
        locks.iter().all(|lock| {
            let Some(queue) = queues.get(&(lock.table, lock.key)) else {
                return false;
            };
            for (waiting, mode) in queue {
                if *waiting == seq {
                    return true;
                }
                if lock.mode == LockMode::Exclusive || *mode == LockMode::Exclusive {
                    return false;
                }
            }
            false
        })
    }

    fn release(&self, seq: u64, locks: &[LockRequest]) {
        let mut queues = self.queues.lock();
        for lock in locks {
            let key = (lock.table, lock.key);
            if let Some(queue) = queues.get_mut(&key) {
                queue.retain(|(waiting, _)| *waiting != seq);
                if queue.is_empty() {
                    queues.remove(&key);
                }
            }
        }
    }

    /// Lock requests queued or held
    pub fn pending(&self) -> usize {
        self.queues.lock().values().map(|q| q.len()).sum()
    }
}

// =============================================================================
// Sequencer
// =============================================================================

/// Global ordering of deterministic requests
pub struct Sequencer {
    cluster: Arc<Cluster>,
    next: AtomicU64,
    order: Mutex<()>,
}

impl Sequencer {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            next: AtomicU64::new(1),
            order: Mutex::new(()),
        }
    }

    /// Sequence a request for `lane` and queue its locks on every participant
    pub fn submit(&self, lane: u16, sets: DeclaredSets) -> Result<DetRequest> {
        let config = self.cluster.config();
        if lane as usize >= config.coroutines {
            return Err(RtxError::Config(format!(
                "lane {} out of range ({} coroutines)",
                lane, config.coroutines
            )));
        }
        let positions = config.forward_window / crate::node::FORWARD_GENERATIONS;
        if 2 * sets.reads.len().max(sets.writes.len()) > positions {
            return Err(RtxError::Config(format!(
                "request declares {} reads and {} writes, forwarding window fits {} per set",
                sets.reads.len(),
                sets.writes.len(),
                positions / 2
            )));
        }
        let participants = sets.participants();
        for pid in &participants {
            self.cluster.node(*pid)?;
        }

        // sequence numbers and queue positions must agree on every node
        let _order = self.order.lock();
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        for pid in &participants {
            self.cluster
                .node(*pid)?
                .lock_queue()
                .enqueue(seq, &sets.local_locks(*pid));
        }
        tracing::debug!(seq, lane, participants = participants.len(), "request sequenced");
        Ok(DetRequest { seq, lane, sets })
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Protocol
// =============================================================================

/// Key of a forwarded value: request, item position and set
fn forward_key(seq: u64, idx: usize, write: bool) -> u64 {
    (seq << FORWARD_KEY_SHIFT) | ((idx as u64) << 1) | write as u64
}

/// Calvin transaction bound to one coroutine (its lane)
#[derive(Debug)]
pub struct CalvinTxn {
    ctx: TxnContext,
    request: Option<DetRequest>,
    locks: Vec<LockRequest>,
}

impl CalvinTxn {
    pub fn new(ctx: TxnContext) -> Self {
        Self {
            ctx,
            request: None,
            locks: Vec::new(),
        }
    }

    /// Bind the next request; it must belong to this coroutine's lane
    pub fn assign(&mut self, request: DetRequest) -> Result<()> {
        if self.ctx.is_active() {
            return Err(RtxError::Protocol(format!(
                "request {} assigned while another is running",
                request.seq
            )));
        }
        if request.lane != self.ctx.cor() {
            return Err(RtxError::Config(format!(
                "request {} for lane {} assigned to coroutine {}",
                request.seq,
                request.lane,
                self.ctx.cor()
            )));
        }
        self.request = Some(request);
        Ok(())
    }

    pub fn request(&self) -> Option<&DetRequest> {
        self.request.as_ref()
    }

    fn current(&self) -> Result<DetRequest> {
        self.request
            .clone()
            .ok_or_else(|| RtxError::Protocol("no request assigned".to_string()))
    }

    /// Exchange local values with the other participants
    pub async fn sync_reads(&mut self) -> Result<Participation> {
        self.ctx.ensure_active()?;
        let request = self.current()?;
        let me = self.ctx.node.id();
        let active = request.sets.active();

        if !request.sets.participants().contains(&me) {
            self.finish_quietly();
            return Ok(Participation::NotParticipating);
        }
        self.forward_local(&request, &active).await?;
        if !active.contains(&me) {
            self.finish_quietly();
            return Ok(Participation::NotParticipating);
        }

        while !self.collect_forwarded(&request).await? {
            tokio::task::yield_now().await;
        }
        Ok(Participation::Active)
    }

    /// Run a whole request: begin, exchange values, then `logic` and commit if active
    pub async fn execute<F>(&mut self, request: DetRequest, logic: F) -> Result<Participation>
    where
        F: FnOnce(&mut CalvinTxn) -> Result<()>,
    {
        self.assign(request)?;
        self.begin().await?;
        let outcome = self.finish_request(logic).await;
        if outcome.is_err() {
            self.abort().await?;
        }
        outcome
    }

    async fn finish_request<F>(&mut self, logic: F) -> Result<Participation>
    where
        F: FnOnce(&mut CalvinTxn) -> Result<()>,
    {
        let participation = self.sync_reads().await?;
        if participation == Participation::Active {
            logic(self)?;
            self.commit().await?;
        }
        Ok(participation)
    }

    /// Stage every declared record owned by this node
    async fn stage_local(&mut self, write: bool) -> Result<()> {
        let me = self.ctx.node.id();
        let ctx = &mut self.ctx;
        let count = if write { ctx.write_set.len() } else { ctx.read_set.len() };
        for idx in 0..count {
            let set = if write { &ctx.write_set } else { &ctx.read_set };
            let item = set.get(idx)?;
            if item.pid() != me {
                continue;
            }
            let (table, key, len) = (item.table(), item.key(), item.len());
            let fetched = access::fetch(&ctx.cluster, &ctx.node, &mut ctx.gc, me, table, key, len).await?;
            let set = if write { &mut ctx.write_set } else { &mut ctx.read_set };
            let item = set.get_mut(idx)?;
            item.handle = fetched.handle;
            item.seq = fetched.header.seq;
            item.staged = Some(fetched.staged);
        }
        Ok(())
    }

    async fn forward_local(&self, request: &DetRequest, active: &BTreeSet<NodeId>) -> Result<()> {
        let ctx = &self.ctx;
        let me = ctx.node.id();
        let targets: Vec<NodeId> = active.iter().copied().filter(|pid| *pid != me).collect();
        if targets.is_empty() {
            return Ok(());
        }
        let one_sided = ctx.config().one_sided.forward;
        let zone = ctx.node.forward_zone();

        let mut batch = BatchOp::new(RpcKind::CalvinForward);
        for (write, set) in [(false, &ctx.read_set), (true, &ctx.write_set)] {
            for (idx, item) in set.iter().enumerate().filter(|(_, i)| i.pid() == me) {
                let value = set.staged(idx, item.len())?;
                let key = forward_key(request.seq, idx, write);
                for target in &targets {
                    if !one_sided {
                        batch.add_entry(
                            RequestEntry::new(*target, item.table(), key, item.len(), idx)
                                .payload(value.to_vec()),
                        );
                        continue;
                    }
                    if value.len() > zone.max_value {
                        return Err(RtxError::Config(format!(
                            "value of {} bytes exceeds the forwarding slot ({} bytes)",
                            value.len(),
                            zone.max_value
                        )));
                    }
                    let off = zone.slot_off(request.lane, request.seq, idx * 2 + write as usize)?;
                    // an earlier request may not have been picked up yet
                    loop {
                        let mut word = [0u8; 8];
                        ctx.cluster.rdma_read(*target, off + 8, &mut word).await?;
                        if u64::from_le_bytes(word) == 0 {
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                    ctx.cluster.rdma_write(*target, off + 16, value).await?;
                    ctx.cluster.rdma_write(*target, off, &key.to_le_bytes()).await?;
                    ctx.cluster
                        .rdma_write(*target, off + 8, &(value.len() as u64 + 1).to_le_bytes())
                        .await?;
                }
            }
        }
        batch.send(&ctx.cluster).await?;
        Ok(())
    }

    /// Pick up forwarded values; `true` once every item has one
    async fn collect_forwarded(&mut self, request: &DetRequest) -> Result<bool> {
        let one_sided = self.ctx.config().one_sided.forward;
        let ctx = &mut self.ctx;
        let node = ctx.node.clone();
        let zone = node.forward_zone();
        let layout = node.layout();

        let mut complete = true;
        for write in [false, true] {
            let count = if write { ctx.write_set.len() } else { ctx.read_set.len() };
            for idx in 0..count {
                let set = if write { &ctx.write_set } else { &ctx.read_set };
                let item = set.get(idx)?;
                if item.has_data() {
                    continue;
                }
                let len = item.len();
                let key = forward_key(request.seq, idx, write);

                let value = if one_sided {
                    let off = zone.slot_off(request.lane, request.seq, idx * 2 + write as usize)?;
                    let region = node.region();
                    let stored = region.load(off + 8)?;
                    if stored == 0 || region.load(off)? != key {
                        None
                    } else if stored - 1 != len as u64 {
                        return Err(RtxError::Protocol(format!(
                            "forwarded value of {} bytes for a {}-byte record",
                            stored - 1,
                            len
                        )));
                    } else {
                        let mut value = vec![0u8; len];
                        region.read_bytes(off + 16, &mut value)?;
                        region.store(off + 8, 0)?;
                        Some(value)
                    }
                } else {
                    node.mailbox().take(key).map(|bytes| bytes.to_vec())
                };

                let Some(value) = value else {
                    complete = false;
                    continue;
                };
                if value.len() != len {
                    return Err(RtxError::Protocol(format!(
                        "forwarded value of {} bytes for a {}-byte record",
                        value.len(),
                        len
                    )));
                }
                let mut staged = ctx.gc.local(layout.record_bytes(len), layout.value_offset(0, len) as usize, len);
                staged.value_mut().copy_from_slice(&value);
                let set = if write { &mut ctx.write_set } else { &mut ctx.read_set };
                set.get_mut(idx)?.staged = Some(staged);
            }
        }
        Ok(complete)
    }

    fn release_locks(&mut self) {
        if let Some(request) = &self.request {
            self.ctx.node.lock_queue().release(request.seq, &self.locks);
        }
        self.locks.clear();
        self.request = None;
    }

    /// Close an attempt that neither commits nor aborts here
    fn finish_quietly(&mut self) {
        self.release_locks();
        self.ctx.finish_passive();
    }
}

#[async_trait]
impl TxnAlgorithm for CalvinTxn {
    fn protocol(&self) -> Protocol {
        Protocol::Calvin
    }

    /// Declare the assigned request's sets, wait for local locks and stage
    /// local records
    async fn begin(&mut self) -> Result<()> {
        let request = self.current()?;
        self.ctx.start();
        let me = self.ctx.node.id();

        for k in &request.sets.reads {
            self.ctx
                .read_set
                .add(ReadSetItem::new(k.pid, k.table, k.key, k.len as usize));
        }
        for k in &request.sets.writes {
            self.ctx
                .write_set
                .add(ReadSetItem::new(k.pid, k.table, k.key, k.len as usize));
        }

        self.locks = request.sets.local_locks(me);
        if !self.locks.is_empty() {
            while !self.ctx.node.lock_queue().granted(request.seq, &self.locks) {
                tokio::task::yield_now().await;
            }
        }

        let staged = match self.stage_local(false).await {
            Ok(()) => self.stage_local(true).await,
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            self.finish_quietly();
            return Err(e);
        }
        Ok(())
    }

    /// Index of a declared read; undeclared records are an error
    async fn read(&mut self, pid: NodeId, table: TableId, key: u64, _len: usize) -> Result<usize> {
        self.ctx.ensure_active()?;
        self.ctx.read_set.position(pid, table, key).ok_or_else(|| {
            RtxError::Protocol(format!(
                "read of undeclared record node {} table {} key {}",
                pid, table, key
            ))
        })
    }

    async fn write(&mut self, pid: NodeId, table: TableId, key: u64, _len: usize) -> Result<usize> {
        self.ctx.ensure_active()?;
        self.ctx.write_set.position(pid, table, key).ok_or_else(|| {
            RtxError::Protocol(format!(
                "write of undeclared record node {} table {} key {}",
                pid, table, key
            ))
        })
    }

    fn load_read(&self, idx: usize, len: usize) -> Result<&[u8]> {
        self.ctx.read_set.staged(idx, len)
    }

    fn load_write(&mut self, idx: usize, len: usize) -> Result<&mut [u8]> {
        self.ctx.write_set.staged_mut(idx, len)
    }

    /// Apply and log the local part of the write set
    async fn commit(&mut self) -> Result<bool> {
        self.ctx.ensure_active()?;
        let request = self.current()?;
        let me = self.ctx.node.id();

        self.ctx.log_writes(request.seq, true).await?;
        let ctx = &self.ctx;
        for (idx, item) in ctx.write_set.iter().enumerate().filter(|(_, i)| i.pid() == me) {
            let Some(off) = item.handle().offset() else {
                continue;
            };
            let rec = RecordRef::local(&ctx.node, off, item.len());
            write_back(&rec, ctx.write_set.staged(idx, item.len())?, 0).await?;
        }

        self.release_locks();
        Ok(self.ctx.finish_commit())
    }

    async fn abort(&mut self) -> Result<()> {
        if self.ctx.is_active() {
            self.release_locks();
            self.ctx.finish_abort(AbortReason::UserAbort);
        }
        Ok(())
    }

    fn context(&self) -> &TxnContext {
        &self.ctx
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Run `request` on every participant, each through its own Calvin context
///
/// `txns` holds one context per node (index = node id) on the request's
/// lane; they are handed back afterwards with each node's participation.
pub async fn run_request<F>(
    txns: Vec<CalvinTxn>,
    request: DetRequest,
    logic: Arc<F>,
) -> Result<(Vec<CalvinTxn>, Vec<Option<Participation>>)>
where
    F: Fn(&mut CalvinTxn) -> Result<()> + Send + Sync + 'static,
{
    let participants = request.sets.participants();
    let mut tasks = JoinSet::new();
    let mut idle: Vec<(usize, CalvinTxn)> = Vec::new();

    for (slot, mut txn) in txns.into_iter().enumerate() {
        if !participants.contains(&txn.ctx.node.id()) {
            idle.push((slot, txn));
            continue;
        }
        let request = request.clone();
        let logic = logic.clone();
        tasks.spawn(async move {
            let outcome = txn.execute(request, |t| (*logic)(t)).await;
            (slot, txn, outcome)
        });
    }

    let mut done: Vec<(usize, CalvinTxn, Option<Participation>)> =
        idle.into_iter().map(|(slot, txn)| (slot, txn, None)).collect();
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let (slot, txn, outcome) =
            joined.map_err(|e| RtxError::Protocol(format!("calvin task failed: {}", e)))?;
        match outcome {
            Ok(participation) => done.push((slot, txn, Some(participation))),
            Err(e) => {
                first_error.get_or_insert(e);
                done.push((slot, txn, None));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    done.sort_by_key(|(slot, _, _)| *slot);
    Ok(done
        .into_iter()
        .map(|(_, txn, participation)| (txn, participation))
        .unzip())
}
