//! Record Store Module
//!
//! The addressable record store behind every node: one RDMA-visible memory
//! region, a bump allocator for records, and an index from `(table, key)` to
//! the record's offset.
//!
//! ## Responsibilities
//! - Own the node's memory region (records, log ring, forwarding slots)
//! - Place records with the header layout the protocol expects
//! - Resolve keys for local access, lookups and RPC handlers
//!
//! Records never move once inserted, so an offset handed to a remote machine
//! stays valid for the lifetime of the node.

mod layout;
pub mod lease;
mod region;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{Result, RtxError};

pub use layout::{
    LockOwner, RecordHeader, RecordLayout, LOCKED_FLAG, LOCK_OFF, MVCC_VERSIONS, MV_RTS_OFF,
    MV_WTS_OFF, RTS_OFF, SEQ_OFF, WTS_OFF,
};
pub use region::{pad8, MemoryRegion};

/// Table identifier
pub type TableId = u8;

/// Where a record lives inside its node's region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub off: u64,
    pub len: usize,
}

/// Per-node record store
///
/// ## Concurrency:
/// - `index`: Protected by RwLock (loaded once, then read-mostly)
/// - `next`: Atomic bump pointer (lock-free)
/// - record contents: atomic words inside `region`
pub struct Store {
    region: MemoryRegion,
    layout: RecordLayout,
    index: RwLock<HashMap<(TableId, u64), RecordLocation>>,
    next: AtomicU64,
    record_limit: u64,
}

impl Store {
    /// Create a store whose region spans `region_bytes`, of which the first
    /// `record_zone_bytes` hold records
    pub fn new(layout: RecordLayout, region_bytes: usize, record_zone_bytes: usize) -> Self {
        Self {
            region: MemoryRegion::new(region_bytes),
            layout,
            index: RwLock::new(HashMap::new()),
            // offset 0 is never a record, so a zero offset can mean "unresolved"
            next: AtomicU64::new(8),
            record_limit: pad8(record_zone_bytes) as u64,
        }
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Insert a record with its initial value
    ///
    /// Initial versions carry timestamp 1 so that 0 keeps meaning "empty".
    pub fn insert(&self, table: TableId, key: u64, value: &[u8]) -> Result<u64> {
        let mut index = self.index.write();
        if index.contains_key(&(table, key)) {
            return Err(RtxError::Storage(format!(
                "record already exists: table {} key {}",
                table, key
            )));
        }

        let size = self.layout.record_bytes(value.len()) as u64;
        let off = self.next.fetch_add(size, Ordering::SeqCst);
        if off + size > self.record_limit {
            return Err(RtxError::Storage(format!(
                "record zone full: need {} bytes at offset {} (limit {})",
                size, off, self.record_limit
            )));
        }

        match self.layout {
            RecordLayout::Versioned => {}
            RecordLayout::Leased => {
                self.region.store(off + WTS_OFF, 1)?;
                self.region.store(off + RTS_OFF, 1)?;
            }
            RecordLayout::MultiVersion => {
                self.region.store(off + RecordLayout::wts_offset(0), 1)?;
            }
        }
        self.region
            .write_bytes(off + self.layout.value_offset(0, value.len()), value)?;

        index.insert(
            (table, key),
            RecordLocation {
                off,
                len: value.len(),
            },
        );
        Ok(off)
    }

    pub fn lookup(&self, table: TableId, key: u64) -> Option<RecordLocation> {
        self.index.read().get(&(table, key)).copied()
    }

    /// Number of records loaded
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of the record zone in use (for testing and debugging)
    pub fn used_bytes(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}
