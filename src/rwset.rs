//! Read/write set manager
//!
//! Append-only, insertion-ordered sets of the records a transaction touched.
//! The position returned by [`RwSet::add`] is the handle the workload passes
//! back to `load_read`/`load_write`; it stays valid until the next `begin`.

use std::collections::BTreeSet;

use crate::error::{Result, RtxError};
use crate::gc::StagedBuffer;
use crate::store::TableId;

/// Position of a record inside its node's region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u64);

/// How a set item reaches its canonical record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordHandle {
    /// Record on this node
    Local(SlotId),
    /// Offset of the record on a remote node
    Remote(u64),
    /// Declared but not yet resolved (Calvin items owned by other nodes)
    Unresolved,
}

impl RecordHandle {
    /// Offset inside the owning node's region, if resolved
    pub fn offset(&self) -> Option<u64> {
        match self {
            RecordHandle::Local(SlotId(off)) => Some(*off),
            RecordHandle::Remote(off) => Some(*off),
            RecordHandle::Unresolved => None,
        }
    }
}

/// One record touched by a transaction
///
/// Identity (table, key, length, owner) is fixed at insertion; the staged copy
/// and version metadata are filled in or refreshed as the protocol proceeds.
#[derive(Debug)]
pub struct ReadSetItem {
    table: TableId,
    key: u64,
    len: usize,
    pid: u8,
    pub(crate) handle: RecordHandle,
    pub(crate) staged: Option<StagedBuffer>,
    /// Version stamp at access time (OCC/NOWAIT/Calvin sequence number)
    pub(crate) seq: u64,
    /// Write timestamp (Sundial lease, MVCC version read)
    pub(crate) wts: u64,
    /// Read timestamp (Sundial lease)
    pub(crate) rts: u64,
    /// Lock word this transaction installed, 0 when it holds none
    pub(crate) lock_word: u64,
    /// Value slot the commit writes (MVCC)
    pub(crate) slot: usize,
}

impl ReadSetItem {
    pub fn new(pid: u8, table: TableId, key: u64, len: usize) -> Self {
        Self {
            table,
            key,
            len,
            pid,
            handle: RecordHandle::Unresolved,
            staged: None,
            seq: 0,
            wts: 0,
            rts: 0,
            lock_word: 0,
            slot: 0,
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Machine owning the record
    pub fn pid(&self) -> u8 {
        self.pid
    }

    pub fn handle(&self) -> RecordHandle {
        self.handle
    }

    pub fn has_data(&self) -> bool {
        self.staged.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_word != 0
    }
}

/// Ordered collection of [`ReadSetItem`]s
#[derive(Debug, Default)]
pub struct RwSet {
    items: Vec<ReadSetItem>,
}

impl RwSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item and return its stable index
    pub fn add(&mut self, item: ReadSetItem) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    pub fn get(&self, index: usize) -> Result<&ReadSetItem> {
        let len = self.items.len();
        self.items
            .get(index)
            .ok_or(RtxError::InvalidIndex { index, len })
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut ReadSetItem> {
        let len = self.items.len();
        self.items
            .get_mut(index)
            .ok_or(RtxError::InvalidIndex { index, len })
    }

    /// Staged value of item `index`, checked against the requested length
    pub fn staged(&self, index: usize, len: usize) -> Result<&[u8]> {
        let item = self.checked(index, len)?;
        item.staged
            .as_ref()
            .map(|buf| buf.value())
            .ok_or(RtxError::ValueNotReady { index })
    }

    pub fn staged_mut(&mut self, index: usize, len: usize) -> Result<&mut [u8]> {
        self.checked(index, len)?;
        self.items[index]
            .staged
            .as_mut()
            .map(|buf| buf.value_mut())
            .ok_or(RtxError::ValueNotReady { index })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadSetItem> {
        self.items.iter()
    }

    pub(crate) fn items_mut(&mut self) -> impl Iterator<Item = &mut ReadSetItem> {
        self.items.iter_mut()
    }

    /// Machines owning at least one item, ascending
    pub fn participants(&self) -> BTreeSet<u8> {
        self.items.iter().map(|item| item.pid).collect()
    }

    /// Index of the item for `(pid, table, key)`, if present
    pub fn position(&self, pid: u8, table: TableId, key: u64) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.pid == pid && item.table == table && item.key == key)
    }

    /// Drop every item. Staged buffers must be released through the Gc first.
    pub fn clear(&mut self) {
        debug_assert!(self.items.iter().all(|item| item.staged.is_none()));
        self.items.clear();
    }

    fn checked(&self, index: usize, len: usize) -> Result<&ReadSetItem> {
        let item = self.get(index)?;
        if item.len != len {
            return Err(RtxError::LengthMismatch {
                index,
                expected: item.len,
                actual: len,
            });
        }
        Ok(item)
    }
}
