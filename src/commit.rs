//! Two-phase commit coordinator
//!
//! `prepare` asks every remote machine holding a written record to vote; a
//! participant votes yes only if each record in the request still carries
//! the exact lock word the coordinator installed, and then remembers the
//! transaction as prepared. `decide` broadcasts the outcome so participants
//! can forget it. Transactions that wrote nothing remote skip both rounds.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::network::Cluster;
use crate::node::{Node, NodeId};
use crate::rpc::{BatchOp, RequestEntry, RpcKind};
use crate::rwset::RwSet;

/// Result of the prepare round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub yes: bool,
    /// Remote machines that took part
    pub participants: BTreeSet<NodeId>,
}

impl Vote {
    /// Outcome when no prepare round is needed
    pub fn unanimous() -> Self {
        Self {
            yes: true,
            participants: BTreeSet::new(),
        }
    }
}

/// Coordinator side of 2PC for one node
pub struct TwoPhaseCommit<'a> {
    cluster: &'a Cluster,
    local: &'a Node,
}

impl<'a> TwoPhaseCommit<'a> {
    pub fn new(cluster: &'a Cluster, local: &'a Node) -> Self {
        Self { cluster, local }
    }

    /// Collect votes from the remote owners of `writes`
    pub async fn prepare(&self, txn: u64, writes: &RwSet) -> Result<Vote> {
        if !self.cluster.config().two_phase_commit {
            return Ok(Vote::unanimous());
        }

        let mut batch = BatchOp::new(RpcKind::Prepare);
        for (idx, item) in writes.iter().enumerate() {
            if item.pid() == self.local.id() {
                continue;
            }
            batch.add_entry(
                RequestEntry::new(item.pid(), item.table(), item.key(), item.len(), idx)
                    .args(txn, item.lock_word)
                    .payload(vec![self.local.id()]),
            );
        }
        if batch.is_empty() {
            return Ok(Vote::unanimous());
        }

        let participants = batch.macs().clone();
        let expected = batch.len();
        let replies = batch.send(self.cluster).await?;
        let yes = replies.len() == expected && replies.iter().all(|r| r.status.is_ok());
        if !yes {
            tracing::debug!(
                node = self.local.id(),
                txn,
                participants = participants.len(),
                "prepare vote failed"
            );
        }
        Ok(Vote { yes, participants })
    }

    /// Broadcast the outcome to the participants of a prepare round
    pub async fn decide(&self, txn: u64, vote: &Vote, commit: bool) -> Result<()> {
        if vote.participants.is_empty() {
            return Ok(());
        }
        let mut batch = BatchOp::new(RpcKind::Decide);
        for pid in &vote.participants {
            batch.add_entry(RequestEntry::new(*pid, 0, 0, 0, 0).args(txn, commit as u64));
        }
        batch.send(self.cluster).await?;
        Ok(())
    }
}
