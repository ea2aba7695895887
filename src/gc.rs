//! Staged buffers and their reclamation
//!
//! Every record a transaction touches gets a staged copy. Copies of local
//! records come from the ordinary heap; copies fetched over one-sided reads
//! are carved from the node's pre-registered RDMA heap. The buffer carries
//! its origin, and [`Gc::release`] is the single place that returns it.
//!
//! Buffers are moved out of their set item on release, so releasing the same
//! item twice (abort followed by a retry on the same coroutine) is a no-op.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::rwset::RwSet;

/// Where a staged buffer was allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    Local,
    RdmaRegion,
}

/// A transaction-owned copy of a record image
///
/// `data` holds the record header followed by its value slot(s); `start`
/// marks the value the transaction reads and mutates.
#[derive(Debug)]
pub struct StagedBuffer {
    data: Vec<u8>,
    start: usize,
    len: usize,
    origin: BufferOrigin,
}

impl StagedBuffer {
    pub fn origin(&self) -> BufferOrigin {
        self.origin
    }

    /// The staged value
    pub fn value(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    pub fn value_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.start + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole image (header and every slot)
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Point the value at another position inside the image
    pub(crate) fn set_value_start(&mut self, start: usize) {
        debug_assert!(start + self.len <= self.data.len());
        self.start = start;
    }
}

// =============================================================================
// RDMA Heap
// =============================================================================

/// Free-list allocator over a node's registered memory
///
/// Buffers up to `chunk` bytes are recycled through a lock-free queue;
/// larger ones are allocated and dropped individually.
#[derive(Debug)]
pub struct RdmaHeap {
    chunk: usize,
    free: SegQueue<Vec<u8>>,
    outstanding: AtomicUsize,
}

impl RdmaHeap {
    pub fn new(chunk: usize) -> Self {
        Self {
            chunk,
            free: SegQueue::new(),
            outstanding: AtomicUsize::new(0),
        }
    }

    fn alloc(&self, bytes: usize) -> Vec<u8> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let mut buf = if bytes <= self.chunk {
            self.free
                .pop()
                .unwrap_or_else(|| Vec::with_capacity(self.chunk))
        } else {
            Vec::with_capacity(bytes)
        };
        buf.clear();
        buf.resize(bytes, 0);
        buf
    }

    fn free(&self, buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if buf.capacity() == self.chunk {
            self.free.push(buf);
        }
    }

    /// Buffers handed out and not yet returned
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Buffers sitting in the free list
    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}

// =============================================================================
// Collector
// =============================================================================

/// Per-coroutine allocator and collector for staged buffers
#[derive(Debug)]
pub struct Gc {
    heap: Arc<RdmaHeap>,
    local_outstanding: usize,
}

impl Gc {
    pub fn new(heap: Arc<RdmaHeap>) -> Self {
        Self {
            heap,
            local_outstanding: 0,
        }
    }

    /// Heap buffer for an image of `image_bytes` whose value starts at `start`
    pub fn local(&mut self, image_bytes: usize, start: usize, len: usize) -> StagedBuffer {
        self.local_outstanding += 1;
        StagedBuffer {
            data: vec![0u8; image_bytes],
            start,
            len,
            origin: BufferOrigin::Local,
        }
    }

    /// RDMA-heap buffer for an image of `image_bytes` whose value starts at `start`
    pub fn rdma(&mut self, image_bytes: usize, start: usize, len: usize) -> StagedBuffer {
        StagedBuffer {
            data: self.heap.alloc(image_bytes),
            start,
            len,
            origin: BufferOrigin::RdmaRegion,
        }
    }

    /// Return a buffer to wherever it came from
    pub fn release(&mut self, buf: StagedBuffer) {
        match buf.origin {
            BufferOrigin::Local => {
                debug_assert!(self.local_outstanding > 0);
                self.local_outstanding = self.local_outstanding.saturating_sub(1);
            }
            BufferOrigin::RdmaRegion => self.heap.free(buf.data),
        }
    }

    /// Release every staged buffer of a set and clear it
    pub fn release_set(&mut self, set: &mut RwSet) {
        for item in set.items_mut() {
            if let Some(buf) = item.staged.take() {
                self.release(buf);
            }
        }
        set.clear();
    }

    /// Heap buffers handed out by this collector and not yet released
    pub fn local_outstanding(&self) -> usize {
        self.local_outstanding
    }

    pub fn heap(&self) -> &Arc<RdmaHeap> {
        &self.heap
    }
}
