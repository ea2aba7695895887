//! Record access layer
//!
//! Resolves `(pid, table, key)` to a handle and copies the record image into
//! a staged buffer. Local records are read straight from the node's region
//! without suspending; remote records are reached with a one-sided read or a
//! batched `Read` RPC, both of which suspend the calling coroutine.
//!
//! [`RecordRef`] gives protocol code one set of word operations (load, store,
//! CAS, byte copies) over either a local record or a remote record reached by
//! one-sided verbs, so each locking algorithm is written once and shared by
//! the local path, the one-sided path and the RPC handlers.

use crate::error::{Result, RtxError};
use crate::gc::{Gc, StagedBuffer};
use crate::network::Cluster;
use crate::node::{Node, NodeId};
use crate::rpc::{BatchOp, RequestEntry, RpcKind, Status};
use crate::rwset::{RecordHandle, SlotId};
use crate::store::{RecordHeader, RecordLayout, TableId};

/// Which memory a [`RecordRef`] operates on
#[derive(Clone, Copy)]
enum Target<'a> {
    Local(&'a Node),
    Remote { cluster: &'a Cluster, node: NodeId },
}

/// A record addressed by offset, locally or through one-sided verbs
#[derive(Clone, Copy)]
pub struct RecordRef<'a> {
    target: Target<'a>,
    layout: RecordLayout,
    off: u64,
    len: usize,
}

impl<'a> RecordRef<'a> {
    pub fn local(node: &'a Node, off: u64, len: usize) -> Self {
        Self {
            target: Target::Local(node),
            layout: node.layout(),
            off,
            len,
        }
    }

    pub fn remote(cluster: &'a Cluster, node: NodeId, off: u64, len: usize) -> Self {
        Self {
            target: Target::Remote { cluster, node },
            layout: RecordLayout::for_protocol(cluster.config().protocol),
            off,
            len,
        }
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Offset of the record inside its node's region
    pub fn offset(&self) -> u64 {
        self.off
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_local(&self) -> bool {
        matches!(self.target, Target::Local(_))
    }

    /// Size of the full record image
    pub fn image_bytes(&self) -> usize {
        self.layout.record_bytes(self.len)
    }

    pub async fn load(&self, field: u64) -> Result<u64> {
        match self.target {
            Target::Local(node) => node.region().load(self.off + field),
            Target::Remote { cluster, node } => {
                let mut word = [0u8; 8];
                cluster.rdma_read(node, self.off + field, &mut word).await?;
                Ok(u64::from_le_bytes(word))
            }
        }
    }

    pub async fn store(&self, field: u64, value: u64) -> Result<()> {
        match self.target {
            Target::Local(node) => node.region().store(self.off + field, value),
            Target::Remote { cluster, node } => {
                cluster
                    .rdma_write(node, self.off + field, &value.to_le_bytes())
                    .await
            }
        }
    }

    /// Compare-and-swap a header word; returns the value observed
    pub async fn cas(&self, field: u64, expected: u64, new: u64) -> Result<u64> {
        match self.target {
            Target::Local(node) => node.region().cas(self.off + field, expected, new),
            Target::Remote { cluster, node } => {
                cluster.rdma_cas(node, self.off + field, expected, new).await
            }
        }
    }

    /// Copy the whole record (header and every value slot)
    pub async fn read_image(&self, image: &mut [u8]) -> Result<()> {
        debug_assert_eq!(image.len(), self.image_bytes());
        match self.target {
            Target::Local(node) => node.region().read_bytes(self.off, image),
            Target::Remote { cluster, node } => cluster.rdma_read(node, self.off, image).await,
        }
    }

    pub async fn header(&self) -> Result<RecordHeader> {
        let mut bytes = vec![0u8; self.layout.header_bytes()];
        match self.target {
            Target::Local(node) => node.region().read_bytes(self.off, &mut bytes)?,
            Target::Remote { cluster, node } => {
                cluster.rdma_read(node, self.off, &mut bytes).await?
            }
        }
        RecordHeader::decode(self.layout, &bytes)
    }

    /// Copy value slot `slot` into `buf`
    pub async fn read_value(&self, slot: usize, buf: &mut [u8]) -> Result<()> {
        let off = self.off + self.layout.value_offset(slot, self.len);
        match self.target {
            Target::Local(node) => node.region().read_bytes(off, buf),
            Target::Remote { cluster, node } => cluster.rdma_read(node, off, buf).await,
        }
    }

    /// Overwrite value slot `slot`
    pub async fn write_value(&self, slot: usize, value: &[u8]) -> Result<()> {
        if value.len() != self.len {
            return Err(RtxError::Storage(format!(
                "value of {} bytes written to a {}-byte record",
                value.len(),
                self.len
            )));
        }
        let off = self.off + self.layout.value_offset(slot, self.len);
        match self.target {
            Target::Local(node) => node.region().write_bytes(off, value),
            Target::Remote { cluster, node } => cluster.rdma_write(node, off, value).await,
        }
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolve a record to a handle without reading it
///
/// Remote offsets come from the location cache or a `Lookup` RPC.
pub async fn locate(
    cluster: &Cluster,
    local: &Node,
    pid: NodeId,
    table: TableId,
    key: u64,
    len: usize,
) -> Result<RecordHandle> {
    if pid == local.id() {
        let loc = local_location(local, table, key, len)?;
        return Ok(RecordHandle::Local(SlotId(loc)));
    }
    if let Some(off) = local.locations().get(pid, table, key) {
        return Ok(RecordHandle::Remote(off));
    }

    let mut batch = BatchOp::new(RpcKind::Lookup);
    batch.add_entry(RequestEntry::new(pid, table, key, len, 0));
    let reply = single_reply(batch.send(cluster).await?, pid)?;
    if reply.status == Status::NotFound {
        return Err(RtxError::KeyNotFound {
            node: pid,
            table,
            key,
        });
    }
    check_len(table, key, reply.extra as usize, len)?;
    local.locations().insert(pid, table, key, reply.seq);
    Ok(RecordHandle::Remote(reply.seq))
}

/// Word-level access to a resolved record, if the path allows it
///
/// Local records are always directly reachable; remote ones only when the
/// operation is configured to use one-sided verbs.
pub fn direct<'a>(
    cluster: &'a Cluster,
    local: &'a Node,
    pid: NodeId,
    handle: RecordHandle,
    len: usize,
    one_sided: bool,
) -> Option<RecordRef<'a>> {
    match handle {
        RecordHandle::Local(SlotId(off)) => Some(RecordRef::local(local, off, len)),
        RecordHandle::Remote(off) if one_sided => Some(RecordRef::remote(cluster, pid, off, len)),
        _ => None,
    }
}

/// A record copied into a staged buffer
#[derive(Debug)]
pub struct Fetched {
    pub handle: RecordHandle,
    pub header: RecordHeader,
    pub staged: StagedBuffer,
}

/// Copy a record into a new staged buffer
///
/// The value view starts at slot 0; multi-version callers move it.
pub async fn fetch(
    cluster: &Cluster,
    local: &Node,
    gc: &mut Gc,
    pid: NodeId,
    table: TableId,
    key: u64,
    len: usize,
) -> Result<Fetched> {
    let layout = local.layout();
    let image_bytes = layout.record_bytes(len);
    let start = layout.value_offset(0, len) as usize;

    if pid == local.id() || cluster.config().one_sided.read {
        let handle = locate(cluster, local, pid, table, key, len).await?;
        let mut staged = match handle {
            RecordHandle::Local(_) => gc.local(image_bytes, start, len),
            _ => gc.rdma(image_bytes, start, len),
        };
        let record = direct(cluster, local, pid, handle, len, true)
            .ok_or(RtxError::KeyNotFound { node: pid, table, key })?;
        if let Err(e) = record.read_image(staged.image_mut()).await {
            gc.release(staged);
            return Err(e);
        }
        let header = RecordHeader::decode(layout, staged.image())?;
        return Ok(Fetched {
            handle,
            header,
            staged,
        });
    }

    let mut batch = BatchOp::new(RpcKind::Read);
    batch.add_entry(RequestEntry::new(pid, table, key, len, 0));
    let reply = single_reply(batch.send(cluster).await?, pid)?;
    if reply.status == Status::NotFound {
        return Err(RtxError::KeyNotFound {
            node: pid,
            table,
            key,
        });
    }
    local.locations().insert(pid, table, key, reply.seq);

    let mut staged = gc.local(image_bytes, start, len);
    if let Err(e) = copy_image(&mut staged, &reply.payload) {
        gc.release(staged);
        return Err(e);
    }
    let header = RecordHeader::decode(layout, staged.image())?;
    Ok(Fetched {
        handle: RecordHandle::Remote(reply.seq),
        header,
        staged,
    })
}

/// Copy an image received by RPC into a staged buffer
pub fn copy_image(staged: &mut StagedBuffer, image: &[u8]) -> Result<()> {
    if image.len() != staged.image().len() {
        return Err(RtxError::Protocol(format!(
            "record image of {} bytes, expected {}",
            image.len(),
            staged.image().len()
        )));
    }
    staged.image_mut().copy_from_slice(image);
    Ok(())
}

/// The one reply item a single-entry batch to `pid` produces
pub fn single_reply(
    mut items: Vec<crate::rpc::ReplyItem>,
    pid: NodeId,
) -> Result<crate::rpc::ReplyItem> {
    match items.len() {
        1 => Ok(items.remove(0)),
        n => Err(RtxError::Protocol(format!(
            "expected one reply item from node {}, got {}",
            pid, n
        ))),
    }
}

fn local_location(node: &Node, table: TableId, key: u64, len: usize) -> Result<u64> {
    let loc = node
        .store()
        .lookup(table, key)
        .ok_or(RtxError::KeyNotFound {
            node: node.id(),
            table,
            key,
        })?;
    check_len(table, key, loc.len, len)?;
    Ok(loc.off)
}

fn check_len(table: TableId, key: u64, stored: usize, requested: usize) -> Result<()> {
    if stored != requested {
        return Err(RtxError::Storage(format!(
            "record table {} key {} holds {} bytes, requested {}",
            table, key, stored, requested
        )));
    }
    Ok(())
}
