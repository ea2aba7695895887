//! Sundial: leases with logical timestamps
//!
//! Every record carries a lease `[wts, rts]`: the version written at `wts`
//! is valid at least up to `rts`. A transaction picks its commit timestamp
//! as late as its accesses require:
//!
//! - reading a version raises `commit_id` to the version's `wts`
//! - locking a record for write raises `commit_id` past the record's `rts`
//!
//! Before commit every read whose lease ends before `commit_id` is renewed
//! (its `rts` extended). A renewal fails if the version changed or another
//! transaction holds the write lock; what happens then follows the
//! configured [`RenewPolicy`].

use async_trait::async_trait;
use bytes::Bytes;

use crate::access::{self, RecordRef};
use crate::config::{Protocol, RenewPolicy};
use crate::error::{Result, RtxError};
use crate::events::AbortReason;
use crate::node::NodeId;
use crate::rpc::{BatchOp, RequestEntry, RpcKind};
use crate::rwset::ReadSetItem;
use crate::store::{RecordHeader, RecordLayout, TableId, LOCK_OFF, RTS_OFF, WTS_OFF};

use super::{aborted, TxnAlgorithm, TxnContext};

/// Attempts at a consistent read before giving up on a busy record
const READ_ATTEMPTS: usize = 8;

// =============================================================================
// Record Operations
// =============================================================================

/// Copy a record and its lease without locking; `None` if it kept changing
pub(crate) async fn read_lease(rec: &RecordRef<'_>, image: &mut [u8]) -> Result<Option<(u64, u64)>> {
    for _ in 0..READ_ATTEMPTS {
        let before = rec.load(WTS_OFF).await?;
        if before != 0 {
            rec.read_image(image).await?;
            if rec.load(WTS_OFF).await? == before {
                let header = RecordHeader::decode(RecordLayout::Leased, image)?;
                return Ok(Some((before, header.rts)));
            }
        }
        tokio::task::yield_now().await;
    }
    Ok(None)
}

/// Write-lock a record and copy it; `None` if another transaction holds it
pub(crate) async fn lock_lease(rec: &RecordRef<'_>, lock_word: u64, image: &mut [u8]) -> Result<Option<(u64, u64)>> {
    let old = rec.cas(LOCK_OFF, 0, lock_word).await?;
    if old != 0 && old != lock_word {
        return Ok(None);
    }
    rec.read_image(image).await?;
    let header = RecordHeader::decode(RecordLayout::Leased, image)?;
    Ok(Some((header.wts, header.rts)))
}

/// Extend the lease of version `wts` up to `commit_id`
///
/// `own_lock` is the caller's lock word: a record the caller itself locked
/// can still be renewed.
pub(crate) async fn renew_lease(rec: &RecordRef<'_>, wts: u64, commit_id: u64, own_lock: u64) -> Result<bool> {
    for _ in 0..READ_ATTEMPTS {
        if rec.load(WTS_OFF).await? != wts {
            return Ok(false);
        }
        let rts = rec.load(RTS_OFF).await?;
        if rts >= commit_id {
            return Ok(true);
        }
        let lock = rec.load(LOCK_OFF).await?;
        if lock != 0 && lock != own_lock {
            return Ok(false);
        }
        if rec.cas(RTS_OFF, rts, commit_id).await? == rts {
            // a writer may have slipped in between the lock check and the CAS
            let lock = rec.load(LOCK_OFF).await?;
            if lock != 0 && lock != own_lock {
                return Ok(false);
            }
            return Ok(rec.load(WTS_OFF).await? == wts);
        }
    }
    Ok(false)
}

/// Install `value` as the version written at `commit_id` and unlock
pub(crate) async fn update_record(rec: &RecordRef<'_>, commit_id: u64, value: &[u8], lock_word: u64) -> Result<()> {
    rec.store(WTS_OFF, 0).await?;
    rec.write_value(0, value).await?;
    let rts = rec.load(RTS_OFF).await?;
    rec.store(RTS_OFF, rts.max(commit_id)).await?;
    rec.store(WTS_OFF, commit_id).await?;
    release_lease_lock(rec, lock_word).await
}

pub(crate) async fn release_lease_lock(rec: &RecordRef<'_>, lock_word: u64) -> Result<()> {
    rec.cas(LOCK_OFF, lock_word, 0).await?;
    Ok(())
}

// =============================================================================
// Protocol
// =============================================================================

/// Sundial transaction bound to one coroutine
pub struct SundialTxn {
    ctx: TxnContext,
    commit_id: u64,
    prepared: bool,
}

impl SundialTxn {
    pub fn new(ctx: TxnContext) -> Self {
        Self {
            ctx,
            commit_id: 0,
            prepared: false,
        }
    }

    /// Commit timestamp the accesses so far require
    pub fn commit_id(&self) -> u64 {
        self.commit_id
    }

    fn lock_word(&self) -> u64 {
        self.ctx.txn_id()
    }

    async fn access(&mut self, write: bool, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.ctx.ensure_active()?;
        // anything accessed after `prepare` still needs its lease renewed
        self.prepared = false;
        let lock_word = self.lock_word();
        let config = self.ctx.config();
        let one_sided = if write { config.one_sided.lock } else { config.one_sided.read };
        let ctx = &mut self.ctx;
        if write {
            if let Some(idx) = ctx.write_set.position(pid, table, key) {
                return Ok(idx);
            }
        }
        let layout = ctx.node.layout();

        let handle = access::locate(&ctx.cluster, &ctx.node, pid, table, key, len).await?;
        let mut item = ReadSetItem::new(pid, table, key, len);
        item.handle = handle;

        let lease = match access::direct(&ctx.cluster, &ctx.node, pid, handle, len, one_sided) {
            Some(rec) => {
                let mut staged = if rec.is_local() {
                    ctx.gc.local(rec.image_bytes(), layout.value_offset(0, len) as usize, len)
                } else {
                    ctx.gc.rdma(rec.image_bytes(), layout.value_offset(0, len) as usize, len)
                };
                let lease = if write {
                    lock_lease(&rec, lock_word, staged.image_mut()).await
                } else {
                    read_lease(&rec, staged.image_mut()).await
                };
                match lease {
                    Ok(Some(lease)) => {
                        item.staged = Some(staged);
                        Some(lease)
                    }
                    Ok(None) => {
                        ctx.gc.release(staged);
                        None
                    }
                    Err(e) => {
                        ctx.gc.release(staged);
                        if write {
                            release_lease_lock(&rec, lock_word).await?;
                        }
                        return Err(e);
                    }
                }
            }
            None => {
                let kind = if write { RpcKind::SundialLock } else { RpcKind::SundialRead };
                let mut batch = BatchOp::new(kind);
                batch.add_entry(RequestEntry::new(pid, table, key, len, 0).args(lock_word, 0));
                let reply = access::single_reply(batch.send(&ctx.cluster).await?, pid)?;
                if reply.status.is_ok() {
                    if write {
                        item.lock_word = lock_word;
                    }
                    let mut staged = ctx.gc.local(layout.record_bytes(len), layout.value_offset(0, len) as usize, len);
                    if let Err(e) = access::copy_image(&mut staged, &reply.payload) {
                        ctx.gc.release(staged);
                        if write {
                            ctx.write_set.add(item);
                        }
                        return Err(e);
                    }
                    item.staged = Some(staged);
                    Some((reply.seq, reply.extra))
                } else {
                    None
                }
            }
        };

        let Some((wts, rts)) = lease else {
            return Err(self.abort_now(AbortReason::LockConflict).await?);
        };
        item.wts = wts;
        item.rts = rts;
        let idx = if write {
            item.lock_word = lock_word;
            self.commit_id = self.commit_id.max(rts + 1);
            ctx.write_set.add(item)
        } else {
            self.commit_id = self.commit_id.max(wts);
            ctx.read_set.add(item)
        };
        Ok(idx)
    }

    /// Extend the lease of read item `idx` to the current commit timestamp
    async fn renew_one(&self, idx: usize) -> Result<bool> {
        let one_sided = self.ctx.config().one_sided.renew;
        let own_lock = self.lock_word();
        let ctx = &self.ctx;
        let item = ctx.read_set.get(idx)?;
        // records this transaction also writes are locked under its own word
        let own = if ctx.write_set.position(item.pid(), item.table(), item.key()).is_some() {
            own_lock
        } else {
            0
        };

        match access::direct(&ctx.cluster, &ctx.node, item.pid(), item.handle(), item.len(), one_sided) {
            Some(rec) => renew_lease(&rec, item.wts, self.commit_id, own).await,
            None => {
                let mut batch = BatchOp::new(RpcKind::SundialRenew);
                batch.add_entry(
                    RequestEntry::new(item.pid(), item.table(), item.key(), item.len(), idx)
                        .args(item.wts, self.commit_id)
                        .payload(Bytes::copy_from_slice(&own.to_be_bytes())),
                );
                let reply = access::single_reply(batch.send(&ctx.cluster).await?, item.pid())?;
                Ok(reply.status.is_ok())
            }
        }
    }

    /// Renew every read lease ending before `commit_id`; `false` if one fails
    async fn renew_reads(&mut self) -> Result<bool> {
        let policy = self.ctx.config().renew_policy;
        let stale: Vec<usize> = self
            .ctx
            .read_set
            .iter()
            .enumerate()
            .filter(|(_, item)| item.rts < self.commit_id)
            .map(|(idx, _)| idx)
            .collect();

        for idx in stale {
            let mut renewed = self.renew_one(idx).await?;
            if let RenewPolicy::Retry { attempts } = policy {
                for _ in 0..attempts {
                    if renewed {
                        break;
                    }
                    tokio::task::yield_now().await;
                    renewed = self.renew_one(idx).await?;
                }
            }
            if !renewed {
                tracing::debug!(
                    node = self.ctx.node.id(),
                    txn = self.ctx.txn_id(),
                    commit_id = self.commit_id,
                    item = idx,
                    "lease renewal failed"
                );
                return Ok(false);
            }
            self.ctx.read_set.get_mut(idx)?.rts = self.commit_id;
        }
        Ok(true)
    }

    async fn update_all(&mut self) -> Result<()> {
        let one_sided = self.ctx.config().one_sided.commit;
        let commit_id = self.commit_id;
        let ctx = &mut self.ctx;

        let mut batch = BatchOp::new(RpcKind::SundialUpdate);
        for idx in 0..ctx.write_set.len() {
            let item = ctx.write_set.get(idx)?;
            let value = ctx.write_set.staged(idx, item.len())?;
            match access::direct(&ctx.cluster, &ctx.node, item.pid(), item.handle(), item.len(), one_sided) {
                Some(rec) => update_record(&rec, commit_id, value, item.lock_word).await?,
                None => batch.add_entry(
                    RequestEntry::new(item.pid(), item.table(), item.key(), item.len(), idx)
                        .args(commit_id, item.lock_word)
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

        let mut batch = BatchOp::new(RpcKind::SundialRelease);
        for (idx, item) in ctx.write_set.iter().enumerate().filter(|(_, i)| i.is_locked()) {
            match access::direct(&ctx.cluster, &ctx.node, item.pid(), item.handle(), item.len(), one_sided) {
                Some(rec) => release_lease_lock(&rec, item.lock_word).await?,
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

    async fn abort_now(&mut self, reason: AbortReason) -> Result<RtxError> {
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

#[async_trait]
impl TxnAlgorithm for SundialTxn {
    fn protocol(&self) -> Protocol {
        Protocol::Sundial
    }

    async fn begin(&mut self) -> Result<()> {
        if self.ctx.is_active() {
            self.abort_with(AbortReason::UserAbort).await?;
        }
        self.ctx.start();
        self.commit_id = 0;
        self.prepared = false;
        Ok(())
    }

    async fn read(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.access(false, pid, table, key, len).await
    }

    async fn write(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.access(true, pid, table, key, len).await
    }

    fn load_read(&self, idx: usize, len: usize) -> Result<&[u8]> {
        self.ctx.read_set.staged(idx, len)
    }

    fn load_write(&mut self, idx: usize, len: usize) -> Result<&mut [u8]> {
        self.ctx.write_set.staged_mut(idx, len)
    }

    /// Renew stale read leases; on failure the attempt is aborted
    async fn prepare(&mut self) -> Result<bool> {
        self.ctx.ensure_active()?;
        if !self.renew_reads().await? {
            return self.abort_with(AbortReason::StaleLease).await;
        }
        self.prepared = true;
        Ok(true)
    }

    async fn commit(&mut self) -> Result<bool> {
        self.ctx.ensure_active()?;
        if !self.prepared && !self.prepare().await? {
            return Ok(false);
        }

        if !self.ctx.prepare_writes().await? {
            return self.abort_with(AbortReason::PrepareVoteFailed).await;
        }

        self.ctx.log_writes(self.commit_id, false).await?;
        self.update_all().await?;
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
