//! Multi-version concurrency control
//!
//! Each record keeps up to four versions, each tagged with the timestamp of
//! the transaction that wrote it, plus a read timestamp (the largest
//! timestamp that has read the record). A transaction with start timestamp
//! `ts`:
//!
//! - reads the newest version with `wts <= ts` and raises `rts` to `ts`
//! - write-locks with its own `ts` as lock word, and gives up if the record
//!   was read or written by a younger transaction
//! - commits by overwriting the oldest slot and publishing it under `ts`
//!
//! A slot is cleared (`wts = 0`) while its value is rewritten, so readers
//! never copy a half-written version.

use async_trait::async_trait;

use crate::access::{self, RecordRef};
use crate::config::Protocol;
use crate::error::Result;
use crate::events::AbortReason;
use crate::node::NodeId;
use crate::rpc::{BatchOp, ReplyItem, RequestEntry, RpcKind};
use crate::rwset::ReadSetItem;
use crate::store::{RecordLayout, TableId, LOCK_OFF, MV_RTS_OFF};

use super::{aborted, TxnAlgorithm, TxnContext};

// =============================================================================
// Record Operations
// =============================================================================

/// Outcome of a versioned read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MvccRead {
    /// Slot `slot` holds the version written at `wts`
    Visible { slot: usize, wts: u64 },
    /// No version is old enough
    Invisible,
    /// An older transaction holds the write lock
    Locked,
    /// The version moved while it was copied
    Changed,
}

impl MvccRead {
    /// Wire code carried in a failed reply's `seq`
    pub(crate) fn code(&self) -> u64 {
        match self {
            MvccRead::Visible { .. } | MvccRead::Locked => 0,
            MvccRead::Invisible => 1,
            MvccRead::Changed => 2,
        }
    }

    fn abort_reason(code: u64) -> AbortReason {
        match code {
            1 => AbortReason::VersionInvisible,
            2 => AbortReason::VersionChanged,
            _ => AbortReason::LockConflict,
        }
    }
}

/// Outcome of a write-lock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MvccLock {
    /// Locked; `slot` is the one to overwrite, `newest` holds the current value
    Acquired { slot: usize, newest: usize },
    Conflict,
}

/// Read the version visible at `ts` into its slot of `image`
pub(crate) async fn read_version(rec: &RecordRef<'_>, ts: u64, image: &mut [u8]) -> Result<MvccRead> {
    let header = rec.header().await?;
    if header.lock != 0 && header.lock < ts {
        return Ok(MvccRead::Locked);
    }
    let Some(slot) = header.visible_version(ts) else {
        return Ok(MvccRead::Invisible);
    };

    let mut rts = header.rts;
    while rts < ts {
        let seen = rec.cas(MV_RTS_OFF, rts, ts).await?;
        if seen == rts {
            break;
        }
        rts = seen;
    }

    let start = rec.layout().value_offset(slot, rec.len()) as usize;
    rec.read_value(slot, &mut image[start..start + rec.len()]).await?;

    // a writer older than `ts` either finished (its version shows up now)
    // or still holds the lock
    let after = rec.header().await?;
    if after.lock != 0 && after.lock < ts {
        return Ok(MvccRead::Locked);
    }
    if after.visible_version(ts) != Some(slot) || after.versions[slot] != header.versions[slot] {
        return Ok(MvccRead::Changed);
    }
    Ok(MvccRead::Visible {
        slot,
        wts: header.versions[slot],
    })
}

/// Write-lock a record with lock word `ts`
///
/// A lock held by a younger transaction fails at once; one held by an older
/// transaction is waited on for up to `spin_limit` attempts.
pub(crate) async fn lock_version(rec: &RecordRef<'_>, ts: u64, spin_limit: u32) -> Result<MvccLock> {
    let mut attempts = 0u32;
    loop {
        let old = rec.cas(LOCK_OFF, 0, ts).await?;
        if old == 0 || old == ts {
            break;
        }
        attempts += 1;
        if old > ts || attempts >= spin_limit {
            return Ok(MvccLock::Conflict);
        }
        tokio::task::yield_now().await;
    }

    let header = rec.header().await?;
    if header.rts > ts || header.max_wts() > ts {
        release_version(rec, ts).await?;
        return Ok(MvccLock::Conflict);
    }
    Ok(MvccLock::Acquired {
        slot: header.oldest_version(),
        newest: header.newest_version(),
    })
}

/// Publish `value` as the version written at `ts` and unlock
pub(crate) async fn install_version(rec: &RecordRef<'_>, ts: u64, slot: usize, value: &[u8]) -> Result<()> {
    let wts = RecordLayout::wts_offset(slot);
    rec.store(wts, 0).await?;
    rec.write_value(slot, value).await?;
    rec.store(wts, ts).await?;
    release_version(rec, ts).await
}

pub(crate) async fn release_version(rec: &RecordRef<'_>, ts: u64) -> Result<()> {
    rec.cas(LOCK_OFF, ts, 0).await?;
    Ok(())
}

// =============================================================================
// Protocol
// =============================================================================

/// MVCC transaction bound to one coroutine
pub struct MvccTxn {
    ctx: TxnContext,
}

impl MvccTxn {
    pub fn new(ctx: TxnContext) -> Self {
        Self { ctx }
    }

    async fn read_record(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.ctx.ensure_active()?;
        let ts = self.ctx.txn_id();
        let one_sided = self.ctx.config().one_sided.read;
        let ctx = &mut self.ctx;
        let layout = ctx.node.layout();

        let handle = access::locate(&ctx.cluster, &ctx.node, pid, table, key, len).await?;
        let mut item = ReadSetItem::new(pid, table, key, len);
        item.handle = handle;

        let outcome = match access::direct(&ctx.cluster, &ctx.node, pid, handle, len, one_sided) {
            Some(rec) => {
                let mut staged = if rec.is_local() {
                    ctx.gc.local(rec.image_bytes(), 0, len)
                } else {
                    ctx.gc.rdma(rec.image_bytes(), 0, len)
                };
                match read_version(&rec, ts, staged.image_mut()).await {
                    Ok(MvccRead::Visible { slot, wts }) => {
                        staged.set_value_start(layout.value_offset(slot, len) as usize);
                        item.staged = Some(staged);
                        item.wts = wts;
                        item.slot = slot;
                        None
                    }
                    Ok(failed) => {
                        ctx.gc.release(staged);
                        Some(MvccRead::abort_reason(failed.code()))
                    }
                    Err(e) => {
                        ctx.gc.release(staged);
                        return Err(e);
                    }
                }
            }
            None => {
                let mut batch = BatchOp::new(RpcKind::MvccRead);
                batch.add_entry(RequestEntry::new(pid, table, key, len, 0).args(ts, 0));
                let reply = access::single_reply(batch.send(&ctx.cluster).await?, pid)?;
                if reply.status.is_ok() {
                    let slot = reply.seq as usize;
                    item.staged = Some(stage_reply(ctx, &reply, slot, len)?);
                    item.wts = reply.extra;
                    item.slot = slot;
                    None
                } else {
                    Some(MvccRead::abort_reason(reply.seq))
                }
            }
        };

        if let Some(reason) = outcome {
            return Err(self.abort_now(reason).await?);
        }
        Ok(ctx.read_set.add(item))
    }

    async fn lock_record(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.ctx.ensure_active()?;
        let ts = self.ctx.txn_id();
        let one_sided = self.ctx.config().one_sided.lock;
        let spin_limit = self.ctx.config().mvcc_lock_spin_limit;
        let ctx = &mut self.ctx;
        if let Some(idx) = ctx.write_set.position(pid, table, key) {
            return Ok(idx);
        }
        let layout = ctx.node.layout();

        let handle = access::locate(&ctx.cluster, &ctx.node, pid, table, key, len).await?;
        let mut item = ReadSetItem::new(pid, table, key, len);
        item.handle = handle;

        let acquired = match access::direct(&ctx.cluster, &ctx.node, pid, handle, len, one_sided) {
            Some(rec) => {
                // only local waiters may spin; a remote spin costs a round trip each
                let limit = if rec.is_local() { spin_limit } else { 1 };
                match lock_version(&rec, ts, limit).await? {
                    MvccLock::Acquired { slot, newest } => {
                        let mut staged = if rec.is_local() {
                            ctx.gc.local(rec.image_bytes(), 0, len)
                        } else {
                            ctx.gc.rdma(rec.image_bytes(), 0, len)
                        };
                        if let Err(e) = rec.read_image(staged.image_mut()).await {
                            ctx.gc.release(staged);
                            release_version(&rec, ts).await?;
                            return Err(e);
                        }
                        staged.set_value_start(layout.value_offset(newest, len) as usize);
                        item.staged = Some(staged);
                        item.slot = slot;
                        true
                    }
                    MvccLock::Conflict => false,
                }
            }
            None => {
                let mut batch = BatchOp::new(RpcKind::MvccLock);
                batch.add_entry(RequestEntry::new(pid, table, key, len, 0).args(ts, 0));
                let reply = access::single_reply(batch.send(&ctx.cluster).await?, pid)?;
                if reply.status.is_ok() {
                    item.lock_word = ts;
                    let staged = stage_reply(ctx, &reply, reply.extra as usize, len);
                    let staged = match staged {
                        Ok(staged) => staged,
                        Err(e) => {
                            ctx.write_set.add(item);
                            return Err(e);
                        }
                    };
                    item.staged = Some(staged);
                    item.slot = reply.seq as usize;
                    true
                } else {
                    false
                }
            }
        };

        if !acquired {
            return Err(self.abort_now(AbortReason::LockConflict).await?);
        }
        item.lock_word = ts;
        Ok(ctx.write_set.add(item))
    }

    async fn install_all(&mut self) -> Result<()> {
        let ts = self.ctx.txn_id();
        let one_sided = self.ctx.config().one_sided.commit;
        let ctx = &mut self.ctx;

        let mut batch = BatchOp::new(RpcKind::MvccCommit);
        for idx in 0..ctx.write_set.len() {
            let item = ctx.write_set.get(idx)?;
            let value = ctx.write_set.staged(idx, item.len())?;
            match access::direct(&ctx.cluster, &ctx.node, item.pid(), item.handle(), item.len(), one_sided) {
                Some(rec) => install_version(&rec, ts, item.slot, value).await?,
                None => batch.add_entry(
                    RequestEntry::new(item.pid(), item.table(), item.key(), item.len(), idx)
                        .args(ts, item.slot as u64)
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

    async fn release_writes(&mut self) -> Result<()> {
        let one_sided = self.ctx.config().one_sided.release;
        let ctx = &mut self.ctx;

        let mut batch = BatchOp::new(RpcKind::MvccRelease);
        for (idx, item) in ctx.write_set.iter().enumerate().filter(|(_, i)| i.is_locked()) {
            match access::direct(&ctx.cluster, &ctx.node, item.pid(), item.handle(), item.len(), one_sided) {
                Some(rec) => release_version(&rec, item.lock_word).await?,
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

    async fn abort_now(&mut self, reason: AbortReason) -> Result<crate::error::RtxError> {
        self.ctx.decide(false).await?;
        self.release_writes().await?;
        self.ctx.finish_abort(reason);
        Ok(aborted(reason))
    }

    async fn abort_with(&mut self, reason: AbortReason) -> Result<bool> {
        self.ctx.decide(false).await?;
        self.release_writes().await?;
        Ok(self.ctx.finish_abort(reason))
    }
}

/// Stage an image received by RPC with its value at `slot`
fn stage_reply(ctx: &mut TxnContext, reply: &ReplyItem, slot: usize, len: usize) -> Result<crate::gc::StagedBuffer> {
    let layout = ctx.node.layout();
    let mut staged = ctx.gc.local(layout.record_bytes(len), 0, len);
    if let Err(e) = access::copy_image(&mut staged, &reply.payload) {
        ctx.gc.release(staged);
        return Err(e);
    }
    if slot >= layout.value_slots() {
        ctx.gc.release(staged);
        return Err(crate::error::RtxError::Protocol(format!(
            "version slot {} out of range",
            slot
        )));
    }
    staged.set_value_start(layout.value_offset(slot, len) as usize);
    Ok(staged)
}

#[async_trait]
impl TxnAlgorithm for MvccTxn {
    fn protocol(&self) -> Protocol {
        Protocol::Mvcc
    }

    async fn begin(&mut self) -> Result<()> {
        if self.ctx.is_active() {
            self.abort_with(AbortReason::UserAbort).await?;
        }
        self.ctx.start();
        Ok(())
    }

    async fn read(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.read_record(pid, table, key, len).await
    }

    async fn write(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.lock_record(pid, table, key, len).await
    }

    fn load_read(&self, idx: usize, len: usize) -> Result<&[u8]> {
        self.ctx.read_set.staged(idx, len)
    }

    fn load_write(&mut self, idx: usize, len: usize) -> Result<&mut [u8]> {
        self.ctx.write_set.staged_mut(idx, len)
    }

    async fn commit(&mut self) -> Result<bool> {
        self.ctx.ensure_active()?;

        let txn = self.ctx.txn_id();
        if !self.ctx.prepare_writes().await? {
            return self.abort_with(AbortReason::PrepareVoteFailed).await;
        }

        self.ctx.log_writes(txn, false).await?;
        self.install_all().await?;
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
