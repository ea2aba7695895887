//! Batched RPC codec
//!
//! ## Wire Format
//!
//! ### Request
//! ```text
//! ┌──────────┬───────────┬──────────────────────────────┐
//! │ Kind (1) │ Count (2) │ Entry × Count                │
//! └──────────┴───────────┴──────────────────────────────┘
//!
//! Entry:
//! ┌────────┬──────────┬─────────┬─────────┬─────────┬──────────┬──────────┬──────────┬─────────┐
//! │ Pid(1) │ Table(1) │ Idx (2) │ Len (4) │ Key (8) │ Arg0 (8) │ Arg1 (8) │ PLen (4) │ Payload │
//! └────────┴──────────┴─────────┴─────────┴─────────┴──────────┴──────────┴──────────┴─────────┘
//! ```
//!
//! ### Reply
//! ```text
//! ┌───────────┬──────────────────────────────┐
//! │ Count (2) │ Item × Count                 │
//! └───────────┴──────────────────────────────┘
//!
//! Item:
//! ┌─────────┬────────────┬─────────┬───────────┬──────────┬─────────┐
//! │ Idx (2) │ Status (1) │ Seq (8) │ Extra (8) │ PLen (4) │ Payload │
//! └─────────┴────────────┴─────────┴───────────┴──────────┴─────────┘
//! ```
//!
//! All integers are big-endian. One request buffer is sent to every target
//! machine; each machine serves only the entries addressed to its own pid.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RtxError};
use crate::store::TableId;

use super::{RpcKind, Status};

/// Request header: kind (1) + count (2)
pub const REQUEST_HEADER_SIZE: usize = 3;

/// Fixed part of a request entry
pub const ENTRY_HEADER_SIZE: usize = 36;

/// Reply header: count (2)
pub const REPLY_HEADER_SIZE: usize = 2;

/// Fixed part of a reply item
pub const ITEM_HEADER_SIZE: usize = 23;

/// Maximum payload carried by one entry or item (1 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// One record operation inside a batched request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEntry {
    pub pid: u8,
    pub table: TableId,
    /// Caller's set index, echoed in the reply
    pub idx: u16,
    pub len: u32,
    pub key: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub payload: Bytes,
}

impl RequestEntry {
    pub fn new(pid: u8, table: TableId, key: u64, len: usize, idx: usize) -> Self {
        Self {
            pid,
            table,
            idx: idx as u16,
            len: len as u32,
            key,
            arg0: 0,
            arg1: 0,
            payload: Bytes::new(),
        }
    }

    pub fn args(mut self, arg0: u64, arg1: u64) -> Self {
        self.arg0 = arg0;
        self.arg1 = arg1;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Decoded batched request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RpcKind,
    pub entries: Vec<RequestEntry>,
}

/// Result of one request entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyItem {
    pub idx: u16,
    pub status: Status,
    pub seq: u64,
    pub extra: u64,
    pub payload: Bytes,
}

impl ReplyItem {
    pub fn new(idx: u16, status: Status) -> Self {
        Self {
            idx,
            status,
            seq: 0,
            extra: 0,
            payload: Bytes::new(),
        }
    }

    pub fn ok(idx: u16) -> Self {
        Self::new(idx, Status::Ok)
    }

    pub fn with_stamps(mut self, seq: u64, extra: u64) -> Self {
        self.seq = seq;
        self.extra = extra;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }
}

// =============================================================================
// Request Encoding/Decoding
// =============================================================================

pub fn encode_request(kind: RpcKind, entries: &[RequestEntry]) -> Result<Bytes> {
    if entries.len() > u16::MAX as usize {
        return Err(RtxError::Protocol(format!(
            "Too many entries in one batch: {}",
            entries.len()
        )));
    }
    let body: usize = entries
        .iter()
        .map(|e| ENTRY_HEADER_SIZE + e.payload.len())
        .sum();
    let mut buf = BytesMut::with_capacity(REQUEST_HEADER_SIZE + body);
    buf.put_u8(kind as u8);
    buf.put_u16(entries.len() as u16);

    for entry in entries {
        check_payload(entry.payload.len())?;
        buf.put_u8(entry.pid);
        buf.put_u8(entry.table);
        buf.put_u16(entry.idx);
        buf.put_u32(entry.len);
        buf.put_u64(entry.key);
        buf.put_u64(entry.arg0);
        buf.put_u64(entry.arg1);
        buf.put_u32(entry.payload.len() as u32);
        buf.put_slice(&entry.payload);
    }
    Ok(buf.freeze())
}

pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    if bytes.len() < REQUEST_HEADER_SIZE {
        return Err(RtxError::Protocol(format!(
            "Incomplete request header: expected {} bytes, got {}",
            REQUEST_HEADER_SIZE,
            bytes.len()
        )));
    }
    let mut buf = bytes;
    let kind = RpcKind::try_from(buf.get_u8())?;
    let count = buf.get_u16() as usize;

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        if buf.remaining() < ENTRY_HEADER_SIZE {
            return Err(RtxError::Protocol(format!(
                "Incomplete entry {}: expected {} bytes, got {}",
                i,
                ENTRY_HEADER_SIZE,
                buf.remaining()
            )));
        }
        let pid = buf.get_u8();
        let table = buf.get_u8();
        let idx = buf.get_u16();
        let len = buf.get_u32();
        let key = buf.get_u64();
        let arg0 = buf.get_u64();
        let arg1 = buf.get_u64();
        let payload = take_payload(&mut buf, i)?;
        entries.push(RequestEntry {
            pid,
            table,
            idx,
            len,
            key,
            arg0,
            arg1,
            payload,
        });
    }
    Ok(Request { kind, entries })
}

// =============================================================================
// Reply Encoding/Decoding
// =============================================================================

pub fn encode_reply(items: &[ReplyItem]) -> Result<Bytes> {
    let body: usize = items
        .iter()
        .map(|i| ITEM_HEADER_SIZE + i.payload.len())
        .sum();
    let mut buf = BytesMut::with_capacity(REPLY_HEADER_SIZE + body);
    buf.put_u16(items.len() as u16);

    for item in items {
        check_payload(item.payload.len())?;
        buf.put_u16(item.idx);
        buf.put_u8(item.status as u8);
        buf.put_u64(item.seq);
        buf.put_u64(item.extra);
        buf.put_u32(item.payload.len() as u32);
        buf.put_slice(&item.payload);
    }
    Ok(buf.freeze())
}

pub fn decode_reply(bytes: &[u8]) -> Result<Vec<ReplyItem>> {
    if bytes.len() < REPLY_HEADER_SIZE {
        return Err(RtxError::Protocol(format!(
            "Incomplete reply header: expected {} bytes, got {}",
            REPLY_HEADER_SIZE,
            bytes.len()
        )));
    }
    let mut buf = bytes;
    let count = buf.get_u16() as usize;

    let mut items = Vec::with_capacity(count);
    for i in 0..count {
        if buf.remaining() < ITEM_HEADER_SIZE {
            return Err(RtxError::Protocol(format!(
                "Incomplete reply item {}: expected {} bytes, got {}",
                i,
                ITEM_HEADER_SIZE,
                buf.remaining()
            )));
        }
        let idx = buf.get_u16();
        let status = Status::try_from(buf.get_u8())?;
        let seq = buf.get_u64();
        let extra = buf.get_u64();
        let payload = take_payload(&mut buf, i)?;
        items.push(ReplyItem {
            idx,
            status,
            seq,
            extra,
            payload,
        });
    }
    Ok(items)
}

// =============================================================================
// Private Helpers
// =============================================================================

fn check_payload(len: usize) -> Result<()> {
    if len > MAX_PAYLOAD_SIZE as usize {
        return Err(RtxError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            len, MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}

/// Read a length-prefixed payload; the length word is already at the cursor
fn take_payload(buf: &mut &[u8], i: usize) -> Result<Bytes> {
    let payload_len = buf.get_u32() as usize;
    check_payload(payload_len)?;
    if buf.remaining() < payload_len {
        return Err(RtxError::Protocol(format!(
            "Incomplete payload in item {}: expected {} bytes, got {}",
            i,
            payload_len,
            buf.remaining()
        )));
    }
    let payload = Bytes::copy_from_slice(&buf[..payload_len]);
    buf.advance(payload_len);
    Ok(payload)
}
