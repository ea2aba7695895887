//! RPC service
//!
//! The handler every machine runs for inbound batched requests. A request
//! buffer is shared by all machines of a batch, so each machine serves only
//! the entries carrying its own pid and replies with one item per entry.
//!
//! Record handlers run the same record operations the one-sided paths use,
//! on the machine's own memory. Entry failures become reply statuses; only a
//! malformed buffer fails the whole request.

use bytes::Bytes;

use crate::access::RecordRef;
use crate::error::{Result, RtxError};
use crate::log::append_local;
use crate::node::Node;
use crate::rpc::{decode_request, encode_reply, ReplyItem, RequestEntry, RpcKind, Status};
use crate::store::LOCK_OFF;
use crate::txn::{
    install_version, lock_exclusive, lock_lease, lock_record, lock_shared, lock_version,
    read_lease, read_version, release_lease, release_lease_lock, release_record, release_version,
    renew_lease, update_record, validate_record, write_back, MvccLock, MvccRead,
};

/// Serve the entries of `request` addressed to `node`
pub async fn handle(node: &Node, request: Bytes) -> Result<Bytes> {
    let request = decode_request(&request)?;

    let mut items = Vec::new();
    for entry in request.entries.iter().filter(|e| e.pid == node.id()) {
        let item = match serve(node, request.kind, entry).await {
            Ok(item) => item,
            Err(RtxError::KeyNotFound { .. }) => ReplyItem::new(entry.idx, Status::NotFound),
            Err(e) => {
                tracing::warn!(
                    node = node.id(),
                    kind = ?request.kind,
                    table = entry.table,
                    key = entry.key,
                    error = %e,
                    "rpc entry failed"
                );
                ReplyItem::new(entry.idx, Status::Invalid)
            }
        };
        items.push(item);
    }

    if request.kind == RpcKind::Prepare {
        register_prepared(node, &request.entries, &items);
    }
    encode_reply(&items)
}

async fn serve(node: &Node, kind: RpcKind, entry: &RequestEntry) -> Result<ReplyItem> {
    let ok = ReplyItem::ok(entry.idx);
    let conflict = ReplyItem::new(entry.idx, Status::Conflict);

    let reply = match kind {
        RpcKind::Lookup => {
            let rec = record(node, entry)?;
            ok.with_stamps(rec.offset(), rec.len() as u64)
        }
        RpcKind::Read => {
            let rec = record(node, entry)?;
            let image = read_image(&rec).await?;
            ok.with_stamps(rec.offset(), 0).with_payload(image)
        }

        // OCC
        RpcKind::OccLock => match lock_record(&record(node, entry)?, entry.arg0).await? {
            Some(seq) => ok.with_stamps(seq, 0),
            None => conflict,
        },
        RpcKind::OccValidate => {
            if validate_record(&record(node, entry)?, entry.arg0, entry.arg1).await? {
                ok
            } else {
                conflict
            }
        }
        RpcKind::OccCommit => {
            write_back(&record(node, entry)?, &entry.payload, entry.arg0).await?;
            ok
        }
        RpcKind::OccRelease => {
            release_record(&record(node, entry)?, entry.arg0).await?;
            ok
        }

        // NOWAIT
        RpcKind::NowaitLockRead => {
            let rec = record(node, entry)?;
            let config = node.config();
            let owner = entry.arg0 as u8;
            match lock_shared(&rec, owner, entry.arg1, config.lease_time_us, config.lease_delta_us).await? {
                Some(lease) => ok.with_stamps(lease.end, lease.word).with_payload(read_image(&rec).await?),
                None => conflict,
            }
        }
        RpcKind::NowaitLockWrite => {
            let rec = record(node, entry)?;
            let delta = node.config().lease_delta_us;
            // the caller's own read lease it may turn into the lock, if any
            let held = match entry.payload[..].try_into() {
                Ok(bytes) => u64::from_le_bytes(bytes),
                Err(_) => 0,
            };
            if lock_exclusive(&rec, entry.arg0, held, entry.arg1, delta).await? {
                ok.with_payload(read_image(&rec).await?)
            } else {
                conflict
            }
        }
        RpcKind::NowaitCommit => {
            write_back(&record(node, entry)?, &entry.payload, entry.arg0).await?;
            ok
        }
        RpcKind::NowaitRelease => {
            release_lease(&record(node, entry)?, entry.arg0).await?;
            ok
        }

        // MVCC
        RpcKind::MvccRead => {
            let rec = record(node, entry)?;
            let mut image = vec![0u8; rec.image_bytes()];
            match read_version(&rec, entry.arg0, &mut image).await? {
                MvccRead::Visible { slot, wts } => ok.with_stamps(slot as u64, wts).with_payload(image),
                failed => conflict.with_stamps(failed.code(), 0),
            }
        }
        RpcKind::MvccLock => {
            let rec = record(node, entry)?;
            match lock_version(&rec, entry.arg0, 1).await? {
                MvccLock::Acquired { slot, newest } => ok
                    .with_stamps(slot as u64, newest as u64)
                    .with_payload(read_image(&rec).await?),
                MvccLock::Conflict => conflict,
            }
        }
        RpcKind::MvccCommit => {
            let rec = record(node, entry)?;
            let slot = entry.arg1 as usize;
            if slot >= rec.layout().value_slots() {
                return Err(RtxError::Protocol(format!("version slot {} out of range", slot)));
            }
            install_version(&rec, entry.arg0, slot, &entry.payload).await?;
            ok
        }
        RpcKind::MvccRelease => {
            release_version(&record(node, entry)?, entry.arg0).await?;
            ok
        }

        // Sundial
        RpcKind::SundialRead => {
            let rec = record(node, entry)?;
            let mut image = vec![0u8; rec.image_bytes()];
            match read_lease(&rec, &mut image).await? {
                Some((wts, rts)) => ok.with_stamps(wts, rts).with_payload(image),
                None => conflict,
            }
        }
        RpcKind::SundialLock => {
            let rec = record(node, entry)?;
            let mut image = vec![0u8; rec.image_bytes()];
            match lock_lease(&rec, entry.arg0, &mut image).await? {
                Some((wts, rts)) => ok.with_stamps(wts, rts).with_payload(image),
                None => conflict,
            }
        }
        RpcKind::SundialRenew => {
            let own_lock = match entry.payload.len() {
                0 => 0,
                8 => {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(&entry.payload);
                    u64::from_be_bytes(word)
                }
                n => return Err(RtxError::Protocol(format!("lock word of {} bytes", n))),
            };
            if renew_lease(&record(node, entry)?, entry.arg0, entry.arg1, own_lock).await? {
                ok
            } else {
                conflict
            }
        }
        RpcKind::SundialUpdate => {
            update_record(&record(node, entry)?, entry.arg0, &entry.payload, entry.arg1).await?;
            ok
        }
        RpcKind::SundialRelease => {
            release_lease_lock(&record(node, entry)?, entry.arg0).await?;
            ok
        }

        // commit coordination
        RpcKind::LogAppend => ok.with_stamps(append_local(node, &entry.payload)?, 0),
        RpcKind::LogAck => ok,
        RpcKind::Prepare => {
            // vote yes only while the coordinator's lock is still in place
            if record(node, entry)?.load(LOCK_OFF).await? == entry.arg1 {
                ok
            } else {
                conflict
            }
        }
        RpcKind::Decide => {
            if node.prepared().decide(entry.arg0).is_none() {
                tracing::trace!(node = node.id(), txn = entry.arg0, "decision for unknown txn");
            }
            ok
        }

        // Calvin
        RpcKind::CalvinForward => {
            node.mailbox().deposit(entry.key, entry.payload.clone());
            ok
        }
    };
    Ok(reply)
}

/// Remember a transaction this node voted yes for
fn register_prepared(node: &Node, entries: &[RequestEntry], items: &[ReplyItem]) {
    if items.is_empty() || !items.iter().all(|item| item.status.is_ok()) {
        return;
    }
    let Some(first) = entries.iter().find(|e| e.pid == node.id()) else {
        return;
    };
    let coordinator = first.payload.first().copied().unwrap_or_default();
    node.prepared().prepare(first.arg0, coordinator, items.len());
}

/// The record an entry addresses, checked against the caller's length
fn record<'a>(node: &'a Node, entry: &RequestEntry) -> Result<RecordRef<'a>> {
    let loc = node
        .store()
        .lookup(entry.table, entry.key)
        .ok_or(RtxError::KeyNotFound {
            node: node.id(),
            table: entry.table,
            key: entry.key,
        })?;
    if loc.len != entry.len as usize {
        return Err(RtxError::Storage(format!(
            "record table {} key {} holds {} bytes, requested {}",
            entry.table, entry.key, loc.len, entry.len
        )));
    }
    Ok(RecordRef::local(node, loc.off, loc.len))
}

async fn read_image(rec: &RecordRef<'_>) -> Result<Vec<u8>> {
    let mut image = vec![0u8; rec.image_bytes()];
    rec.read_image(&mut image).await?;
    Ok(image)
}
