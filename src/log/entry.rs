//! Log entry definitions
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬──────────────────────┐
//! │ LSN (8) │ CRC (4) │ Len (4) │ Data (bincode)       │
//! └─────────┴─────────┴─────────┴──────────────────────┘
//! ```
//!
//! The LSN is the transaction id; the CRC covers `Data` only. A zero length
//! marks an empty log slot.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RtxError};
use crate::node::NodeId;
use crate::store::TableId;

/// LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// One written record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedWrite {
    pub table: TableId,
    pub key: u64,
    pub value: Vec<u8>,
}

/// The durable image of a transaction's write set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Machine that coordinated the transaction
    pub coordinator: NodeId,

    /// Commit timestamp (or sequence) the writes are applied at
    pub timestamp: u64,

    pub writes: Vec<LoggedWrite>,
}

/// A single entry of a node's log ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub lsn: u64,
    pub record: LogRecord,
}

impl LogEntry {
    pub fn new(lsn: u64, record: LogRecord) -> Self {
        Self { lsn, record }
    }

    /// Serialize with header and checksum
    pub fn encode(&self) -> Result<Vec<u8>> {
        let data = bincode::serialize(&self.record)?;
        let crc = crc32fast::hash(&data);

        let mut bytes = Vec::with_capacity(HEADER_SIZE + data.len());
        bytes.extend_from_slice(&self.lsn.to_be_bytes());
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes.extend_from_slice(&(data.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&data);
        Ok(bytes)
    }

    /// Parse an entry from the start of `bytes`
    ///
    /// Returns `Ok(None)` for an empty slot and `LogCorruption` when the
    /// length overruns the buffer or the checksum does not match.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.len() < HEADER_SIZE {
            return Err(RtxError::LogCorruption(format!(
                "entry header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let lsn = u64::from_be_bytes(word8(&bytes[0..8]));
        let crc = u32::from_be_bytes(word4(&bytes[8..12]));
        let len = u32::from_be_bytes(word4(&bytes[12..16])) as usize;
        if len == 0 {
            return Ok(None);
        }

        let data = bytes.get(HEADER_SIZE..HEADER_SIZE + len).ok_or_else(|| {
            RtxError::LogCorruption(format!(
                "entry {} claims {} bytes, slot holds {}",
                lsn,
                len,
                bytes.len() - HEADER_SIZE
            ))
        })?;
        let actual = crc32fast::hash(data);
        if actual != crc {
            return Err(RtxError::LogCorruption(format!(
                "entry {} checksum mismatch: stored {:08x}, computed {:08x}",
                lsn, crc, actual
            )));
        }

        let record = bincode::deserialize(data)?;
        Ok(Some(Self { lsn, record }))
    }
}

fn word8(bytes: &[u8]) -> [u8; 8] {
    let mut w = [0u8; 8];
    w.copy_from_slice(bytes);
    w
}

fn word4(bytes: &[u8]) -> [u8; 4] {
    let mut w = [0u8; 4];
    w.copy_from_slice(bytes);
    w
}
