//! Log reader
//!
//! Scans a node's log ring and verifies every slot.

use crate::error::{Result, RtxError};
use crate::node::Node;

use super::LogEntry;

/// Outcome of scanning a log ring
#[derive(Debug, Default)]
pub struct LogScan {
    /// Valid entries in append order
    pub entries: Vec<LogEntry>,
    /// Slots never written
    pub empty: usize,
    /// Slots whose entry failed the length or checksum check
    pub corrupted: usize,
    /// Entries ever appended (may exceed the ring size)
    pub appended: u64,
}

/// Reads the log ring of one node
pub struct LogReader<'a> {
    node: &'a Node,
}

impl<'a> LogReader<'a> {
    pub fn new(node: &'a Node) -> Self {
        Self { node }
    }

    /// Decode every slot of the ring
    pub fn scan(&self) -> Result<LogScan> {
        let zone = self.node.log_zone();
        let appended = self.node.region().load(zone.tail_off())?;

        // oldest surviving entry first
        let first = appended.saturating_sub(zone.slots as u64);
        let mut scan = LogScan {
            appended,
            ..Default::default()
        };
        let mut slot = vec![0u8; zone.slot_bytes];
        for seq in first..first + zone.slots as u64 {
            self.node.region().read_bytes(zone.slot_off(seq), &mut slot)?;
            match LogEntry::decode(&slot) {
                Ok(Some(entry)) => scan.entries.push(entry),
                Ok(None) => scan.empty += 1,
                Err(RtxError::LogCorruption(reason)) => {
                    tracing::warn!(node = self.node.id(), seq, %reason, "corrupted log slot");
                    scan.corrupted += 1;
                }
                Err(RtxError::Serialization(reason)) => {
                    tracing::warn!(node = self.node.id(), seq, %reason, "undecodable log slot");
                    scan.corrupted += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(scan)
    }
}
