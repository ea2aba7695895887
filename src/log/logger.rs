//! Remote logger
//!
//! Replicates a transaction's write set to the log rings of the backups of
//! every machine it wrote to, plus the coordinator's own ring, then runs an
//! acknowledgement round trip before the caller applies the writes.
//!
//! A one-sided append reserves a ring slot with fetch-and-add on the target's
//! tail word and writes the entry into it. The RPC path sends `LogAppend`
//! and lets the target do the same locally.

use std::collections::BTreeSet;

use crate::error::{Result, RtxError};
use crate::network::Cluster;
use crate::node::{Node, NodeId};
use crate::rpc::{BatchOp, RequestEntry, RpcKind};

use super::LogEntry;

/// Append an encoded entry to a local log ring; returns its sequence number
pub fn append_local(node: &Node, bytes: &[u8]) -> Result<u64> {
    let zone = node.log_zone();
    check_fits(bytes, zone.slot_bytes)?;
    let seq = node.region().fetch_add(zone.tail_off(), 1)?;
    node.region().write_bytes(zone.slot_off(seq), bytes)?;
    Ok(seq)
}

fn check_fits(bytes: &[u8], slot_bytes: usize) -> Result<()> {
    if bytes.len() > slot_bytes {
        return Err(RtxError::Log(format!(
            "log entry of {} bytes does not fit a {}-byte slot",
            bytes.len(),
            slot_bytes
        )));
    }
    Ok(())
}

/// Replicates write sets for one coordinator node
pub struct RemoteLogger<'a> {
    cluster: &'a Cluster,
    local: &'a Node,
}

impl<'a> RemoteLogger<'a> {
    pub fn new(cluster: &'a Cluster, local: &'a Node) -> Self {
        Self { cluster, local }
    }

    /// Machines that receive the log of a transaction writing to `macs`
    pub fn targets(&self, macs: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        let mut targets: BTreeSet<NodeId> = macs
            .iter()
            .flat_map(|mac| self.cluster.backups_of(*mac))
            .collect();
        targets.insert(self.local.id());
        targets
    }

    /// Log `entry` and wait for every target's acknowledgement
    pub async fn log(&self, entry: &LogEntry, macs: &BTreeSet<NodeId>) -> Result<()> {
        let bytes = entry.encode()?;
        let zone = self.local.log_zone();
        check_fits(&bytes, zone.slot_bytes)?;

        let targets = self.targets(macs);
        let one_sided = self.cluster.config().one_sided.log;
        let mut appends = BatchOp::new(RpcKind::LogAppend);

        for target in &targets {
            if *target == self.local.id() {
                append_local(self.local, &bytes)?;
            } else if one_sided {
                let seq = self.cluster.rdma_faa(*target, zone.tail_off(), 1).await?;
                self.cluster
                    .rdma_write(*target, zone.slot_off(seq), &bytes)
                    .await?;
            } else {
                appends.add_entry(
                    RequestEntry::new(*target, 0, entry.lsn, bytes.len(), 0)
                        .payload(bytes.clone()),
                );
            }
        }
        for item in appends.send(self.cluster).await? {
            if !item.status.is_ok() {
                return Err(RtxError::Log(format!(
                    "log append for txn {} refused",
                    entry.lsn
                )));
            }
        }

        let mut acks = BatchOp::new(RpcKind::LogAck);
        for target in targets.iter().filter(|t| **t != self.local.id()) {
            acks.add_entry(RequestEntry::new(*target, 0, entry.lsn, 0, 0));
        }
        let expected = acks.len();
        let replies = acks.send(self.cluster).await?;
        if replies.len() != expected || replies.iter().any(|r| !r.status.is_ok()) {
            return Err(RtxError::Log(format!(
                "log ack for txn {}: {} of {} backups answered",
                entry.lsn,
                replies.iter().filter(|r| r.status.is_ok()).count(),
                expected
            )));
        }

        tracing::trace!(
            node = self.local.id(),
            txn = entry.lsn,
            targets = targets.len(),
            "write set logged"
        );
        Ok(())
    }
}
