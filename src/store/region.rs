//! RDMA-visible memory region
//!
//! A node's registered memory, modelled as a flat array of 64-bit atomic
//! words addressed by byte offset. Header words are accessed with atomic
//! load/store/CAS/FAA; value bytes are packed little-endian into words.
//!
//! Offsets handed to this module must be 8-byte aligned. Byte copies may end
//! mid-word: the trailing word is merged so neighbouring bytes survive.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, RtxError};

/// Round a length up to a whole number of words
pub fn pad8(len: usize) -> usize {
    (len + 7) & !7
}

/// Flat word-addressable memory shared by local and one-sided accesses
pub struct MemoryRegion {
    words: Box<[AtomicU64]>,
}

impl MemoryRegion {
    /// Allocate a zeroed region of at least `bytes` bytes
    pub fn new(bytes: usize) -> Self {
        let words = (0..pad8(bytes) / 8).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    /// Size of the region in bytes
    pub fn len_bytes(&self) -> usize {
        self.words.len() * 8
    }

    pub fn load(&self, off: u64) -> Result<u64> {
        Ok(self.word(off)?.load(Ordering::Acquire))
    }

    pub fn store(&self, off: u64, value: u64) -> Result<()> {
        self.word(off)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Compare-and-swap; returns the value observed before the operation
    pub fn cas(&self, off: u64, expected: u64, new: u64) -> Result<u64> {
        let word = self.word(off)?;
        match word.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(old) | Err(old) => Ok(old),
        }
    }

    /// Fetch-and-add; returns the value before the addition
    pub fn fetch_add(&self, off: u64, delta: u64) -> Result<u64> {
        Ok(self.word(off)?.fetch_add(delta, Ordering::AcqRel))
    }

    /// Copy `buf.len()` bytes starting at `off` into `buf`
    pub fn read_bytes(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let first = self.span(off, buf.len())?;
        for (i, chunk) in buf.chunks_mut(8).enumerate() {
            let word = self.words[first + i].load(Ordering::Acquire).to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        Ok(())
    }

    /// Copy `data` into the region starting at `off`
    pub fn write_bytes(&self, off: u64, data: &[u8]) -> Result<()> {
        let first = self.span(off, data.len())?;
        for (i, chunk) in data.chunks(8).enumerate() {
            let slot = &self.words[first + i];
            let value = if chunk.len() == 8 {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            } else {
                let mut word = slot.load(Ordering::Acquire).to_le_bytes();
                word[..chunk.len()].copy_from_slice(chunk);
                u64::from_le_bytes(word)
            };
            slot.store(value, Ordering::Release);
        }
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn word(&self, off: u64) -> Result<&AtomicU64> {
        let index = self.span(off, 8)?;
        Ok(&self.words[index])
    }

    /// Validate an access and return its first word index
    fn span(&self, off: u64, len: usize) -> Result<usize> {
        if off % 8 != 0 {
            return Err(RtxError::Storage(format!("unaligned offset {}", off)));
        }
        let end = off.checked_add(len as u64);
        match end {
            Some(end) if end <= self.len_bytes() as u64 => Ok((off / 8) as usize),
            _ => Err(RtxError::OutOfBounds {
                offset: off,
                len,
                region: self.len_bytes(),
            }),
        }
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("bytes", &self.len_bytes())
            .finish()
    }
}
