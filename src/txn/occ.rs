//! Optimistic concurrency control
//!
//! Reads and writes stage a copy and remember the record's sequence number.
//! Nothing is locked until commit:
//!
//! 1. lock every written record (no-wait: any conflict aborts), checking the
//!    sequence number did not move since it was staged
//! 2. validate every read record: same sequence number, not locked by others
//! 3. prepare remote participants (2PC), log the write set to backups
//! 4. write back, bumping the sequence number, and unlock
//!
//! Each step uses one-sided verbs or a batched RPC per the config toggles.

use async_trait::async_trait;

use crate::access::{self, RecordRef};
use crate::config::Protocol;
use crate::error::Result;
use crate::events::AbortReason;
use crate::node::NodeId;
use crate::rpc::{BatchOp, RequestEntry, RpcKind, Status};
use crate::rwset::ReadSetItem;
use crate::store::{TableId, LOCK_OFF, SEQ_OFF};

use super::{TxnAlgorithm, TxnContext};

// =============================================================================
// Record Operations
// =============================================================================

/// Take the exclusive lock; returns the sequence number on success
///
/// A lock already held by `owner` counts as acquired.
pub(crate) async fn lock_record(rec: &RecordRef<'_>, owner: u64) -> Result<Option<u64>> {
    let old = rec.cas(LOCK_OFF, 0, owner).await?;
    if old != 0 && old != owner {
        return Ok(None);
    }
    Ok(Some(rec.load(SEQ_OFF).await?))
}

/// Sequence number unchanged and no foreign lock
pub(crate) async fn validate_record(rec: &RecordRef<'_>, seq: u64, owner: u64) -> Result<bool> {
    let lock = rec.load(LOCK_OFF).await?;
    if lock != 0 && lock != owner {
        return Ok(false);
    }
    Ok(rec.load(SEQ_OFF).await? == seq)
}

/// Install a value, bump the sequence number and drop the lock
pub(crate) async fn write_back(rec: &RecordRef<'_>, value: &[u8], owner: u64) -> Result<()> {
    rec.write_value(0, value).await?;
    let seq = rec.load(SEQ_OFF).await?;
    rec.store(SEQ_OFF, seq + 1).await?;
    release_record(rec, owner).await
}

pub(crate) async fn release_record(rec: &RecordRef<'_>, owner: u64) -> Result<()> {
    rec.cas(LOCK_OFF, owner, 0).await?;
    Ok(())
}

// =============================================================================
// Protocol
// =============================================================================

/// OCC transaction bound to one coroutine
pub struct OccTxn {
    ctx: TxnContext,
}

impl OccTxn {
    pub fn new(ctx: TxnContext) -> Self {
        Self { ctx }
    }

    async fn stage(&mut self, write: bool, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.ctx.ensure_active()?;
        let ctx = &mut self.ctx;
        if write {
            if let Some(idx) = ctx.write_set.position(pid, table, key) {
                return Ok(idx);
            }
        }
        let fetched = access::fetch(&ctx.cluster, &ctx.node, &mut ctx.gc, pid, table, key, len).await?;

        let mut item = ReadSetItem::new(pid, table, key, len);
        item.handle = fetched.handle;
        item.seq = fetched.header.seq;
        item.staged = Some(fetched.staged);
        let set = if write { &mut ctx.write_set } else { &mut ctx.read_set };
        Ok(set.add(item))
    }

    /// Lock the write set; `Some(reason)` on failure
    async fn lock_writes(&mut self) -> Result<Option<AbortReason>> {
        let owner = self.ctx.owner().encode();
        let one_sided = self.ctx.config().one_sided.lock;
        let ctx = &mut self.ctx;

        let mut batch = BatchOp::new(RpcKind::OccLock);
        for idx in 0..ctx.write_set.len() {
            let item = ctx.write_set.get(idx)?;
            let (pid, handle, len, seq) = (item.pid(), item.handle(), item.len(), item.seq);
            let (table, key) = (item.table(), item.key());

            match access::direct(&ctx.cluster, &ctx.node, pid, handle, len, one_sided) {
                Some(rec) => match lock_record(&rec, owner).await? {
                    Some(current) => {
                        ctx.write_set.get_mut(idx)?.lock_word = owner;
                        if current != seq {
                            return Ok(Some(AbortReason::ValidationFailure));
                        }
                    }
                    None => return Ok(Some(AbortReason::LockConflict)),
                },
                None => batch.add_entry(RequestEntry::new(pid, table, key, len, idx).args(owner, 0)),
            }
        }

        let mut outcome = None;
        for reply in batch.send(&ctx.cluster).await? {
            let item = ctx.write_set.get_mut(reply.idx as usize)?;
            if reply.status == Status::Ok {
                item.lock_word = owner;
                if reply.seq != item.seq {
                    outcome.get_or_insert(AbortReason::ValidationFailure);
                }
            } else {
                outcome = Some(AbortReason::LockConflict);
            }
        }
        Ok(outcome)
    }

    /// Re-check every read; `Some(reason)` on failure
    async fn validate_reads(&mut self) -> Result<Option<AbortReason>> {
        let owner = self.ctx.owner().encode();
        let config = self.ctx.config().clone();
        let ctx = &self.ctx;

        let mut failed = 0usize;
        let mut batch = BatchOp::new(RpcKind::OccValidate);
        for (idx, item) in ctx.read_set.iter().enumerate() {
            match access::direct(&ctx.cluster, &ctx.node, item.pid(), item.handle(), item.len(), config.one_sided.validate) {
                Some(rec) => {
                    if !validate_record(&rec, item.seq, owner).await? {
                        failed += 1;
                    }
                }
                None => batch.add_entry(
                    RequestEntry::new(item.pid(), item.table(), item.key(), item.len(), idx)
                        .args(item.seq, owner),
                ),
            }
        }
        failed += batch
            .send(&ctx.cluster)
            .await?
            .iter()
            .filter(|r| !r.status.is_ok())
            .count();

        if failed == 0 {
            return Ok(None);
        }
        if config.no_abort {
            tracing::warn!(
                node = ctx.node.id(),
                txn = ctx.txn_id(),
                failed,
                "validation failed, committing anyway (no_abort)"
            );
            return Ok(None);
        }
        Ok(Some(AbortReason::ValidationFailure))
    }

    async fn write_back_all(&mut self) -> Result<()> {
        let owner = self.ctx.owner().encode();
        let one_sided = self.ctx.config().one_sided.commit;
        let ctx = &mut self.ctx;

        let mut batch = BatchOp::new(RpcKind::OccCommit);
        for idx in 0..ctx.write_set.len() {
            let item = ctx.write_set.get(idx)?;
            let value = ctx.write_set.staged(idx, item.len())?;
            match access::direct(&ctx.cluster, &ctx.node, item.pid(), item.handle(), item.len(), one_sided) {
                Some(rec) => write_back(&rec, value, owner).await?,
                None => batch.add_entry(
                    RequestEntry::new(item.pid(), item.table(), item.key(), item.len(), idx)
                        .args(owner, 0)
                        .payload(value.to_vec()),
                ),
            }
        }
        batch.send(&ctx.cluster).await?;
        for item in ctx.write_set.items_mut() {
            item.lock_word = 0;
        }
        Ok(())
    }

    /// Unlock every record this attempt locked
    async fn release_writes(&mut self) -> Result<()> {
        let one_sided = self.ctx.config().one_sided.release;
        let ctx = &mut self.ctx;

        let mut batch = BatchOp::new(RpcKind::OccRelease);
        for (idx, item) in ctx.write_set.iter().enumerate().filter(|(_, i)| i.is_locked()) {
            match access::direct(&ctx.cluster, &ctx.node, item.pid(), item.handle(), item.len(), one_sided) {
                Some(rec) => release_record(&rec, item.lock_word).await?,
                None => batch.add_entry(
                    RequestEntry::new(item.pid(), item.table(), item.key(), item.len(), idx)
                        .args(item.lock_word, 0),
                ),
            }
        }
        batch.send(&ctx.cluster).await?;
        for item in ctx.write_set.items_mut() {
            item.lock_word = 0;
        }
        Ok(())
    }

    async fn abort_with(&mut self, reason: AbortReason) -> Result<bool> {
        self.ctx.decide(false).await?;
        self.release_writes().await?;
        Ok(self.ctx.finish_abort(reason))
    }
}

#[async_trait]
impl TxnAlgorithm for OccTxn {
    fn protocol(&self) -> Protocol {
        Protocol::Occ
    }

    async fn begin(&mut self) -> Result<()> {
        if self.ctx.is_active() {
            self.abort_with(AbortReason::UserAbort).await?;
        }
        self.ctx.start();
        Ok(())
    }

    async fn read(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.stage(false, pid, table, key, len).await
    }

    async fn write(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.stage(true, pid, table, key, len).await
    }

    fn load_read(&self, idx: usize, len: usize) -> Result<&[u8]> {
        self.ctx.read_set.staged(idx, len)
    }

    fn load_write(&mut self, idx: usize, len: usize) -> Result<&mut [u8]> {
        self.ctx.write_set.staged_mut(idx, len)
    }

    async fn commit(&mut self) -> Result<bool> {
        self.ctx.ensure_active()?;

        if let Some(reason) = self.lock_writes().await? {
            return self.abort_with(reason).await;
        }
        if let Some(reason) = self.validate_reads().await? {
            return self.abort_with(reason).await;
        }

        let txn = self.ctx.txn_id();
        if !self.ctx.prepare_writes().await? {
            return self.abort_with(AbortReason::PrepareVoteFailed).await;
        }

        self.ctx.log_writes(txn, false).await?;
        self.write_back_all().await?;
        self.ctx.decide(true).await?;
        Ok(self.ctx.finish_commit())
    }

    async fn abort(&mut self) -> Result<()> {
        if self.ctx.is_active() {
            self.abort_with(AbortReason::UserAbort).await?;
        }
        Ok(())
    }

    fn context(&self) -> &TxnContext {
        &self.ctx
    }
}
