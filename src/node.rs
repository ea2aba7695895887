//! Node: the state of one machine
//!
//! A node owns one memory region split into three zones:
//!
//! ```text
//! ┌────────────────────┬───────────────────────────┬──────────────────────────┐
//! │ records            │ log ring                  │ forwarding slots         │
//! │ [0, record_zone)   │ tail (8) + slots          │ lanes × window slots     │
//! └────────────────────┴───────────────────────────┴──────────────────────────┘
//! ```
//!
//! Everything a remote machine can reach with a one-sided verb lives in that
//! region. Everything reached only through RPC handlers (location cache,
//! forwarding mailbox, prepared transactions, Calvin lock queue) hangs off
//! the node behind `parking_lot` locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Result, RtxError};
use crate::events::AbortCollector;
use crate::gc::RdmaHeap;
use crate::store::{pad8, MemoryRegion, RecordHeader, RecordLayout, Store, TableId};
use crate::txn::calvin::LockQueue;

/// Machine identifier
pub type NodeId = u8;

// =============================================================================
// Zones
// =============================================================================

/// Geometry of the remote log ring
#[derive(Debug, Clone, Copy)]
pub struct LogZone {
    pub base: u64,
    pub slots: usize,
    pub slot_bytes: usize,
}

impl LogZone {
    /// Word counting appended entries; FAA on it reserves a slot
    pub fn tail_off(&self) -> u64 {
        self.base
    }

    /// Offset of ring position `seq % slots`
    pub fn slot_off(&self, seq: u64) -> u64 {
        self.base + 8 + (seq % self.slots as u64) * self.slot_bytes as u64
    }

    pub fn bytes(&self) -> usize {
        8 + self.slots * self.slot_bytes
    }
}

/// Number of request generations a lane's forwarding window is split into
pub const FORWARD_GENERATIONS: usize = 4;

/// Geometry of the Calvin forwarding slots
///
/// Slot layout: `tag (8) | len + 1 (8) | value (max_value, padded)`. The
/// length word is written last and a zero length means empty.
#[derive(Debug, Clone, Copy)]
pub struct ForwardZone {
    pub base: u64,
    pub lanes: usize,
    pub window: usize,
    pub max_value: usize,
}

impl ForwardZone {
    pub fn slot_bytes(&self) -> usize {
        16 + pad8(self.max_value)
    }

    pub fn bytes(&self) -> usize {
        self.lanes * self.window * self.slot_bytes()
    }

    /// Slot for entry `position` of request `req_seq` on `lane`
    pub fn slot_off(&self, lane: u16, req_seq: u64, position: usize) -> Result<u64> {
        let per_generation = self.window / FORWARD_GENERATIONS;
        if lane as usize >= self.lanes || position >= per_generation {
            return Err(RtxError::Config(format!(
                "forwarding slot out of range: lane {} position {} (lanes {}, {} per request)",
                lane, position, self.lanes, per_generation
            )));
        }
        let generation = (req_seq % FORWARD_GENERATIONS as u64) as usize;
        let index = lane as usize * self.window + generation * per_generation + position;
        Ok(self.base + (index * self.slot_bytes()) as u64)
    }
}

// =============================================================================
// Side Tables
// =============================================================================

/// Cache of remote record offsets, keyed by `(node, table, key)`
///
/// Records never move, so entries are never invalidated.
#[derive(Debug, Default)]
pub struct LocationCache {
    entries: RwLock<HashMap<(NodeId, TableId, u64), u64>>,
}

impl LocationCache {
    pub fn get(&self, node: NodeId, table: TableId, key: u64) -> Option<u64> {
        self.entries.read().get(&(node, table, key)).copied()
    }

    pub fn insert(&self, node: NodeId, table: TableId, key: u64, off: u64) {
        self.entries.write().insert((node, table, key), off);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Values forwarded to this node by RPC, keyed by forwarding slot key
#[derive(Debug, Default)]
pub struct Mailbox {
    slots: Mutex<HashMap<u64, Bytes>>,
}

impl Mailbox {
    pub fn deposit(&self, key: u64, value: Bytes) {
        self.slots.lock().insert(key, value);
    }

    pub fn take(&self, key: u64) -> Option<Bytes> {
        self.slots.lock().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A transaction this node voted yes for and has not heard the decision of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedTxn {
    pub coordinator: NodeId,
    pub records: usize,
}

/// Participant-side 2PC state
#[derive(Debug, Default)]
pub struct PreparedSet {
    txns: Mutex<HashMap<u64, PreparedTxn>>,
}

impl PreparedSet {
    pub fn prepare(&self, txn: u64, coordinator: NodeId, records: usize) {
        self.txns.lock().insert(
            txn,
            PreparedTxn {
                coordinator,
                records,
            },
        );
    }

    /// Forget a transaction once its outcome is known
    pub fn decide(&self, txn: u64) -> Option<PreparedTxn> {
        self.txns.lock().remove(&txn)
    }

    /// Transactions prepared here whose outcome is still unknown
    pub fn in_doubt(&self) -> Vec<u64> {
        let mut txns: Vec<u64> = self.txns.lock().keys().copied().collect();
        txns.sort_unstable();
        txns
    }
}

/// Inbound verb counts
#[derive(Debug, Default)]
pub struct VerbCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    cas: AtomicU64,
    faa: AtomicU64,
    rpcs: AtomicU64,
}

/// Snapshot of [`VerbCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerbStats {
    pub reads: u64,
    pub writes: u64,
    pub cas: u64,
    pub faa: u64,
    pub rpcs: u64,
}

impl VerbCounters {
    pub(crate) fn read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cas(&self) {
        self.cas.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn faa(&self) {
        self.faa.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rpc(&self) {
        self.rpcs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VerbStats {
        VerbStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            cas: self.cas.load(Ordering::Relaxed),
            faa: self.faa.load(Ordering::Relaxed),
            rpcs: self.rpcs.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Node
// =============================================================================

/// One machine of the cluster
///
/// ## Concurrency:
/// - record, log and forwarding memory: atomic words (CAS/FAA only)
/// - side tables: `parking_lot` locks, never held across a suspension point
/// - all methods use `&self`
pub struct Node {
    id: NodeId,
    config: Arc<Config>,
    store: Store,
    heap: Arc<RdmaHeap>,
    log_zone: LogZone,
    forward_zone: ForwardZone,
    locations: LocationCache,
    mailbox: Mailbox,
    prepared: PreparedSet,
    lock_queue: LockQueue,
    collector: AbortCollector,
    counters: VerbCounters,
    clock: Arc<dyn Clock>,
}

impl Node {
    /// Build a node and carve its region into zones
    pub fn new(id: NodeId, config: Arc<Config>, clock: Arc<dyn Clock>) -> Self {
        let layout = RecordLayout::for_protocol(config.protocol);
        let record_zone = pad8(config.record_zone_bytes);

        let log_zone = LogZone {
            base: record_zone as u64,
            slots: config.log_slots,
            slot_bytes: config.log_slot_bytes,
        };
        let forward_zone = ForwardZone {
            base: log_zone.base + log_zone.bytes() as u64,
            lanes: config.coroutines,
            window: config.forward_window,
            max_value: config.max_forward_value,
        };
        let region_bytes = record_zone + log_zone.bytes() + forward_zone.bytes();

        tracing::debug!(
            node = id,
            region_bytes,
            record_zone,
            log_base = log_zone.base,
            forward_base = forward_zone.base,
            "node region laid out"
        );

        Self {
            id,
            heap: Arc::new(RdmaHeap::new(config.rdma_heap_chunk)),
            store: Store::new(layout, region_bytes, record_zone),
            config,
            log_zone,
            forward_zone,
            locations: LocationCache::default(),
            mailbox: Mailbox::default(),
            prepared: PreparedSet::default(),
            lock_queue: LockQueue::default(),
            collector: AbortCollector::new(),
            counters: VerbCounters::default(),
            clock,
        }
    }

    /// Load a record with its initial value
    pub fn load(&self, table: TableId, key: u64, value: &[u8]) -> Result<u64> {
        self.store.insert(table, key, value)
    }

    /// Latest committed value of a local record (for loaders, checks and tests)
    pub fn committed_value(&self, table: TableId, key: u64) -> Result<Vec<u8>> {
        let loc = self.store.lookup(table, key).ok_or(RtxError::KeyNotFound {
            node: self.id,
            table,
            key,
        })?;
        let layout = self.layout();
        let mut header = vec![0u8; layout.header_bytes()];
        self.region().read_bytes(loc.off, &mut header)?;
        let header = RecordHeader::decode(layout, &header)?;

        let slot = match layout {
            RecordLayout::MultiVersion => header.newest_version(),
            _ => 0,
        };
        let mut value = vec![0u8; loc.len];
        self.region()
            .read_bytes(loc.off + layout.value_offset(slot, loc.len), &mut value)?;
        Ok(value)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn region(&self) -> &MemoryRegion {
        self.store.region()
    }

    pub fn layout(&self) -> RecordLayout {
        self.store.layout()
    }

    pub fn heap(&self) -> &Arc<RdmaHeap> {
        &self.heap
    }

    pub fn log_zone(&self) -> LogZone {
        self.log_zone
    }

    pub fn forward_zone(&self) -> ForwardZone {
        self.forward_zone
    }

    pub fn locations(&self) -> &LocationCache {
        &self.locations
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn prepared(&self) -> &PreparedSet {
        &self.prepared
    }

    pub fn lock_queue(&self) -> &LockQueue {
        &self.lock_queue
    }

    pub fn collector(&self) -> &AbortCollector {
        &self.collector
    }

    pub fn counters(&self) -> &VerbCounters {
        &self.counters
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("protocol", &self.config.protocol)
            .field("records", &self.store.len())
            .finish()
    }
}
