//! NOWAIT two-phase locking
//!
//! Locks are taken at access time, never deferred to commit, and a lock that
//! cannot be taken at once aborts the transaction (no waiting, so no
//! deadlock). Reads take a shared lease: the lock word holds the lease end
//! time and any number of readers can rely on it until it runs out. Writes
//! take an exclusive lock, which needs the word to be free or its lease
//! expired beyond the skew tolerance.
//!
//! A reader that installs a lease alone hands it back at commit or abort; once
//! another reader has joined, the lease just runs out. At commit every read
//! lease must still be valid, otherwise the attempt aborts with `StaleLease`.
//! A record read and then written in the same attempt is promoted: the
//! attempt's own lease turns into its write lock.

use async_trait::async_trait;

use crate::access::{self, RecordRef};
use crate::config::Protocol;
use crate::error::Result;
use crate::events::AbortReason;
use crate::node::NodeId;
use crate::rpc::{BatchOp, RequestEntry, RpcKind};
use crate::rwset::ReadSetItem;
use crate::store::{lease, RecordHeader, TableId, LOCK_OFF};

use super::occ::write_back;
use super::{aborted, TxnAlgorithm, TxnContext};

/// CAS attempts before a contended shared lease gives up
const LEASE_ATTEMPTS: usize = 8;

// =============================================================================
// Record Operations
// =============================================================================

/// Shared lease granted to one reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadLease {
    pub end: u64,
    /// Word the reader installed alone, 0 when the lease is shared
    pub word: u64,
}

/// Join or install a shared lease for machine `owner`
pub(crate) async fn lock_shared(
    rec: &RecordRef<'_>,
    owner: u8,
    now_us: u64,
    lease_us: u64,
    delta_us: u64,
) -> Result<Option<ReadLease>> {
    for _ in 0..LEASE_ATTEMPTS {
        let word = rec.load(LOCK_OFF).await?;
        if lease::is_write_locked(word) {
            return Ok(None);
        }
        if word != 0 {
            let end = lease::end_time(word);
            if lease::valid(now_us, end, delta_us) {
                // joining takes the lease away from its installer
                let shared = lease::r_lease(end);
                if word == shared || rec.cas(LOCK_OFF, word, shared).await? == word {
                    return Ok(Some(ReadLease { end, word: 0 }));
                }
                continue;
            }
            if !lease::expired(now_us, end, delta_us) {
                return Ok(None);
            }
        }
        let end = now_us + lease_us;
        let installed = lease::r_lease_by(end, owner);
        if rec.cas(LOCK_OFF, word, installed).await? == word {
            return Ok(Some(ReadLease { end, word: installed }));
        }
    }
    Ok(None)
}

/// Take the exclusive lock if the word is free, holds an expired lease, or
/// is `held`, the caller's own unshared read lease
pub(crate) async fn lock_exclusive(
    rec: &RecordRef<'_>,
    lock_word: u64,
    held: u64,
    now_us: u64,
    delta_us: u64,
) -> Result<bool> {
    let word = rec.load(LOCK_OFF).await?;
    let free = word == 0
        || (held != 0 && word == held)
        || (!lease::is_write_locked(word)
            && lease::expired(now_us, lease::end_time(word), delta_us));
    if !free {
        return Ok(false);
    }
    Ok(rec.cas(LOCK_OFF, word, lock_word).await? == word)
}

/// Clear `word` if it is still in place; a lock word or an unshared read lease
pub(crate) async fn release_lease(rec: &RecordRef<'_>, word: u64) -> Result<()> {
    rec.cas(LOCK_OFF, word, 0).await?;
    Ok(())
}

// =============================================================================
// Protocol
// =============================================================================

/// NOWAIT transaction bound to one coroutine
pub struct NowaitTxn {
    ctx: TxnContext,
}

impl NowaitTxn {
    pub fn new(ctx: TxnContext) -> Self {
        Self { ctx }
    }

    fn lock_word(&self) -> u64 {
        lease::locked(self.ctx.node.id())
    }

    /// Lock (or lease) a record, then stage its value
    async fn acquire(&mut self, write: bool, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.ctx.ensure_active()?;
        let config = self.ctx.config();
        let (one_sided, lease_us, delta_us) = (config.one_sided, config.lease_time_us, config.lease_delta_us);
        let lock_word = self.lock_word();
        let me = self.ctx.node.id();
        let now = self.ctx.node.now_us();
        let ctx = &mut self.ctx;
        let set = if write { &ctx.write_set } else { &ctx.read_set };
        if let Some(idx) = set.position(pid, table, key) {
            return Ok(idx);
        }
        // the write lock already covers a read of the same record
        let covered = !write && ctx.write_set.position(pid, table, key).is_some();
        // a read lease of this attempt that can turn into the write lock
        let promoted = if write { ctx.read_set.position(pid, table, key) } else { None };
        let held = match promoted {
            Some(r) => ctx.read_set.get(r)?.lock_word,
            None => 0,
        };

        let handle = access::locate(&ctx.cluster, &ctx.node, pid, table, key, len).await?;
        let layout = ctx.node.layout();
        let mut item = ReadSetItem::new(pid, table, key, len);
        item.handle = handle;

        let granted = if covered {
            Some(ReadLease { end: 0, word: 0 })
        } else {
            match access::direct(&ctx.cluster, &ctx.node, pid, handle, len, one_sided.lock) {
                Some(rec) if write => lock_exclusive(&rec, lock_word, held, now, delta_us)
                    .await?
                    .then_some(ReadLease { end: 0, word: lock_word }),
                Some(rec) => lock_shared(&rec, me, now, lease_us, delta_us).await?,
                None => {
                    let mut entry = RequestEntry::new(pid, table, key, len, 0);
                    let kind = if write {
                        entry = entry.args(lock_word, now).payload(held.to_le_bytes().to_vec());
                        RpcKind::NowaitLockWrite
                    } else {
                        entry = entry.args(me as u64, now);
                        RpcKind::NowaitLockRead
                    };
                    let mut batch = BatchOp::new(kind);
                    batch.add_entry(entry);
                    let reply = access::single_reply(batch.send(&ctx.cluster).await?, pid)?;
                    if reply.status.is_ok() {
                        let mut staged = ctx.gc.local(layout.record_bytes(len), layout.value_offset(0, len) as usize, len);
                        let copied = access::copy_image(&mut staged, &reply.payload)
                            .and_then(|_| RecordHeader::decode(layout, staged.image()));
                        match copied {
                            Ok(header) => item.seq = header.seq,
                            Err(e) => {
                                ctx.gc.release(staged);
                                return Err(e);
                            }
                        }
                        item.staged = Some(staged);
                        if write {
                            Some(ReadLease { end: 0, word: lock_word })
                        } else {
                            Some(ReadLease { end: reply.seq, word: reply.extra })
                        }
                    } else {
                        None
                    }
                }
            }
        };

        let Some(granted) = granted else {
            return Err(self.abort_now(AbortReason::LockConflict).await?);
        };
        item.lock_word = granted.word;
        item.rts = granted.end;
        if let Some(r) = promoted {
            // the lease became the write lock (or was shared and has run out)
            ctx.read_set.get_mut(r)?.lock_word = 0;
        }
        let needs_value = item.staged.is_none();
        let set = if write { &mut ctx.write_set } else { &mut ctx.read_set };
        let idx = set.add(item);

        if needs_value {
            let fetched = access::fetch(&ctx.cluster, &ctx.node, &mut ctx.gc, pid, table, key, len).await?;
            let set = if write { &mut ctx.write_set } else { &mut ctx.read_set };
            let item = set.get_mut(idx)?;
            item.seq = fetched.header.seq;
            item.staged = Some(fetched.staged);
        }
        Ok(idx)
    }

    /// Whether every read lease is still safe to rely on at `now`
    fn reads_valid(&self, now: u64) -> bool {
        let delta = self.ctx.config().lease_delta_us;
        let ctx = &self.ctx;
        ctx.read_set.iter().all(|item| {
            lease::valid(now, item.rts, delta)
                || ctx.write_set.position(item.pid(), item.table(), item.key()).is_some()
        })
    }

    async fn write_back_all(&mut self) -> Result<()> {
        let one_sided = self.ctx.config().one_sided.commit;
        let ctx = &mut self.ctx;

        let mut batch = BatchOp::new(RpcKind::NowaitCommit);
        for idx in 0..ctx.write_set.len() {
            let item = ctx.write_set.get(idx)?;
            let value = ctx.write_set.staged(idx, item.len())?;
            match access::direct(&ctx.cluster, &ctx.node, item.pid(), item.handle(), item.len(), one_sided) {
                Some(rec) => write_back(&rec, value, item.lock_word).await?,
                None => batch.add_entry(
                    RequestEntry::new(item.pid(), item.table(), item.key(), item.len(), idx)
                        .args(item.lock_word, 0)
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
        self.release_words(true).await
    }

    /// Hand back the read leases no other reader joined
    async fn release_reads(&mut self) -> Result<()> {
        self.release_words(false).await
    }

    async fn release_words(&mut self, writes: bool) -> Result<()> {
        let one_sided = self.ctx.config().one_sided.release;
        let ctx = &mut self.ctx;
        let set = if writes { &mut ctx.write_set } else { &mut ctx.read_set };

        let mut batch = BatchOp::new(RpcKind::NowaitRelease);
        for (idx, item) in set.iter().enumerate().filter(|(_, i)| i.is_locked()) {
            match access::direct(&ctx.cluster, &ctx.node, item.pid(), item.handle(), item.len(), one_sided) {
                Some(rec) => release_lease(&rec, item.lock_word).await?,
                None => batch.add_entry(
                    RequestEntry::new(item.pid(), item.table(), item.key(), item.len(), idx)
                        .args(item.lock_word, 0),
                ),
            }
        }
        batch.send(&ctx.cluster).await?;
        for item in set.items_mut() {
            item.lock_word = 0;
        }
        Ok(())
    }

    /// Release everything and close the attempt; returns the error for `read`/`write`
    async fn abort_now(&mut self, reason: AbortReason) -> Result<crate::error::RtxError> {
        self.ctx.decide(false).await?;
        self.release_writes().await?;
        self.release_reads().await?;
        self.ctx.finish_abort(reason);
        Ok(aborted(reason))
    }

    async fn abort_with(&mut self, reason: AbortReason) -> Result<bool> {
        self.ctx.decide(false).await?;
        self.release_writes().await?;
        self.release_reads().await?;
        Ok(self.ctx.finish_abort(reason))
    }
}

#[async_trait]
impl TxnAlgorithm for NowaitTxn {
    fn protocol(&self) -> Protocol {
        Protocol::Nowait
    }

    async fn begin(&mut self) -> Result<()> {
        if self.ctx.is_active() {
            self.abort_with(AbortReason::UserAbort).await?;
        }
        self.ctx.start();
        Ok(())
    }

    async fn read(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.acquire(false, pid, table, key, len).await
    }

    async fn write(&mut self, pid: NodeId, table: TableId, key: u64, len: usize) -> Result<usize> {
        self.acquire(true, pid, table, key, len).await
    }

    fn load_read(&self, idx: usize, len: usize) -> Result<&[u8]> {
        self.ctx.read_set.staged(idx, len)
    }

    fn load_write(&mut self, idx: usize, len: usize) -> Result<&mut [u8]> {
        self.ctx.write_set.staged_mut(idx, len)
    }

    async fn commit(&mut self) -> Result<bool> {
        self.ctx.ensure_active()?;

        if !self.reads_valid(self.ctx.node.now_us()) {
            return self.abort_with(AbortReason::StaleLease).await;
        }

        let txn = self.ctx.txn_id();
        if !self.ctx.prepare_writes().await? {
            return self.abort_with(AbortReason::PrepareVoteFailed).await;
        }

        self.release_reads().await?;
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
