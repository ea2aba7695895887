//! Record layouts
//!
//! Every record is a fixed header of 64-bit words followed by one or more
//! value slots, all at a stable offset inside the node's region:
//!
//! ```text
//! Versioned    (OCC, NOWAIT, Calvin)
//! ┌──────────┬──────────┬──────────────┐
//! │ lock (8) │ seq (8)  │ value        │
//! └──────────┴──────────┴──────────────┘
//!
//! Leased       (Sundial)
//! ┌──────────┬──────────┬──────────┬──────────────┐
//! │ lock (8) │ wts (8)  │ rts (8)  │ value        │
//! └──────────┴──────────┴──────────┴──────────────┘
//!
//! MultiVersion (MVCC)
//! ┌──────────┬──────────┬──────────────────┬──────────────────────┐
//! │ lock (8) │ rts (8)  │ wts[V] (8 each)  │ value[V] (padded)    │
//! └──────────┴──────────┴──────────────────┴──────────────────────┘
//! ```
//!
//! A wts of 0 marks an empty or in-flux slot. Writers clear it before
//! overwriting a value and publish the new timestamp afterwards, so a reader
//! that sees the same non-zero wts before and after its copy read a stable
//! value.

use crate::config::Protocol;
use crate::error::{Result, RtxError};

use super::pad8;

/// Number of versions kept per MVCC record
pub const MVCC_VERSIONS: usize = 4;

/// Offset of the lock word in every layout
pub const LOCK_OFF: u64 = 0;
/// Sequence number (Versioned)
pub const SEQ_OFF: u64 = 8;
/// Write timestamp (Leased)
pub const WTS_OFF: u64 = 8;
/// Read timestamp (Leased)
pub const RTS_OFF: u64 = 16;
/// Read timestamp (MultiVersion)
pub const MV_RTS_OFF: u64 = 8;
/// First write timestamp (MultiVersion)
pub const MV_WTS_OFF: u64 = 16;

/// Header + value-slot arrangement of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    Versioned,
    Leased,
    MultiVersion,
}

impl RecordLayout {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Occ | Protocol::Nowait | Protocol::Calvin => RecordLayout::Versioned,
            Protocol::Sundial => RecordLayout::Leased,
            Protocol::Mvcc => RecordLayout::MultiVersion,
        }
    }

    pub fn header_bytes(&self) -> usize {
        match self {
            RecordLayout::Versioned => 16,
            RecordLayout::Leased => 24,
            RecordLayout::MultiVersion => 16 + 8 * MVCC_VERSIONS,
        }
    }

    pub fn value_slots(&self) -> usize {
        match self {
            RecordLayout::MultiVersion => MVCC_VERSIONS,
            _ => 1,
        }
    }

    /// Total bytes a record with a `len`-byte value occupies
    pub fn record_bytes(&self, len: usize) -> usize {
        self.header_bytes() + self.value_slots() * pad8(len)
    }

    /// Offset of value slot `slot`, relative to the record start
    pub fn value_offset(&self, slot: usize, len: usize) -> u64 {
        (self.header_bytes() + slot * pad8(len)) as u64
    }

    /// Offset of version `slot`'s write timestamp (MultiVersion)
    pub fn wts_offset(slot: usize) -> u64 {
        MV_WTS_OFF + 8 * slot as u64
    }
}

/// Decoded record header
///
/// `seq` is meaningful for Versioned records, `wts`/`rts` for Leased ones,
/// `rts`/`versions` for MultiVersion ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordHeader {
    pub lock: u64,
    pub seq: u64,
    pub wts: u64,
    pub rts: u64,
    pub versions: [u64; MVCC_VERSIONS],
}

impl RecordHeader {
    /// Decode a header from the raw little-endian image of a record
    pub fn decode(layout: RecordLayout, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < layout.header_bytes() {
            return Err(RtxError::Protocol(format!(
                "record header needs {} bytes, got {}",
                layout.header_bytes(),
                bytes.len()
            )));
        }
        let word = |off: u64| {
            let at = off as usize;
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(w)
        };

        let mut header = RecordHeader {
            lock: word(LOCK_OFF),
            ..Default::default()
        };
        match layout {
            RecordLayout::Versioned => header.seq = word(SEQ_OFF),
            RecordLayout::Leased => {
                header.wts = word(WTS_OFF);
                header.rts = word(RTS_OFF);
            }
            RecordLayout::MultiVersion => {
                header.rts = word(MV_RTS_OFF);
                for (slot, v) in header.versions.iter_mut().enumerate() {
                    *v = word(RecordLayout::wts_offset(slot));
                }
            }
        }
        Ok(header)
    }

    /// Newest version visible at `ts`: the slot with the largest non-zero wts <= ts
    pub fn visible_version(&self, ts: u64) -> Option<usize> {
        self.versions
            .iter()
            .enumerate()
            .filter(|(_, wts)| **wts != 0 && **wts <= ts)
            .max_by_key(|(_, wts)| **wts)
            .map(|(slot, _)| slot)
    }

    /// Slot an MVCC writer overwrites: the one with the smallest wts
    pub fn oldest_version(&self) -> usize {
        self.versions
            .iter()
            .enumerate()
            .min_by_key(|(_, wts)| **wts)
            .map(|(slot, _)| slot)
            .unwrap_or(0)
    }

    /// Slot holding the newest version
    pub fn newest_version(&self) -> usize {
        self.versions
            .iter()
            .enumerate()
            .max_by_key(|(_, wts)| **wts)
            .map(|(slot, _)| slot)
            .unwrap_or(0)
    }

    pub fn max_wts(&self) -> u64 {
        self.versions.iter().copied().max().unwrap_or(0)
    }
}

// =============================================================================
// Lock Owner Encoding
// =============================================================================

/// Set in every owner-encoded lock word so owner (0, 0, 0) differs from unlocked
pub const LOCKED_FLAG: u64 = 1 << 32;

/// Identity of the coroutine holding an exclusive lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner {
    pub node: u8,
    pub worker: u8,
    pub cor: u16,
}

impl LockOwner {
    pub fn new(node: u8, worker: u8, cor: u16) -> Self {
        Self { node, worker, cor }
    }

    /// `LOCKED_FLAG | node << 16 | worker << 10 | cor`
    ///
    /// `worker` must fit 6 bits and `cor` 10 bits.
    pub fn encode(&self) -> u64 {
        debug_assert!(self.worker < 64 && self.cor < 1024);
        LOCKED_FLAG | (self.node as u64) << 16 | (self.worker as u64) << 10 | self.cor as u64
    }

    pub fn decode(word: u64) -> Option<Self> {
        if word & LOCKED_FLAG == 0 {
            return None;
        }
        Some(Self {
            node: (word >> 16) as u8,
            worker: ((word >> 10) & 0x3f) as u8,
            cor: (word & 0x3ff) as u16,
        })
    }
}
