//! # Shared Memory
//!
//! DMA-coherent memory visible to both the host and the firmware processor.
//!
//! All access is word-granular. The firmware only ever reads and writes whole
//! 32-bit words, and going through this trait keeps every shared access a
//! single volatile or atomic operation.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{HalError, Result};

// =============================================================================
// SHARED MEMORY CONTRACT
// =============================================================================

/// What an allocation is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Queue table and queue arrays
    Queues,
    /// Firmware crash report (SFR)
    CrashReport,
    /// QDSS trace buffer
    Trace,
}

/// A region of device-visible memory
///
/// Offsets are in bytes and must be 4-byte aligned.
pub trait SharedMemory: Send + Sync {
    /// Address of the region as seen by the firmware
    fn device_addr(&self) -> u64;

    /// Region size in bytes
    fn size(&self) -> usize;

    /// Read one word
    fn read32(&self, offset: usize) -> u32;

    /// Write one word
    fn write32(&self, offset: usize, value: u32);

    /// Read consecutive words starting at `offset`
    fn read_words(&self, offset: usize, out: &mut [u32]) {
        for (i, word) in out.iter_mut().enumerate() {
            *word = self.read32(offset + i * 4);
        }
    }

    /// Write consecutive words starting at `offset`
    fn write_words(&self, offset: usize, data: &[u32]) {
        for (i, word) in data.iter().enumerate() {
            self.write32(offset + i * 4, *word);
        }
    }

    /// Zero `len` bytes starting at `offset`
    fn zero(&self, offset: usize, len: usize) {
        for i in (0..len).step_by(4) {
            self.write32(offset + i, 0);
        }
    }
}

/// Allocator for device-visible memory
pub trait DmaAllocator: Send {
    /// Allocate and map `size` bytes for the firmware
    fn alloc(&mut self, size: usize, kind: MemoryKind) -> Result<Arc<dyn SharedMemory>>;

    /// Unmap and free a region
    fn free(&mut self, region: Arc<dyn SharedMemory>) {
        drop(region);
    }
}

// =============================================================================
// HEAP MEMORY
// =============================================================================

/// Shared memory backed by host heap words
///
/// Used when the peer is simulated on the host, and by tests.
#[derive(Debug)]
pub struct HeapMemory {
    words: Box<[AtomicU32]>,
    device_addr: u64,
}

impl HeapMemory {
    /// Allocate a zeroed region of `size` bytes (rounded up to a word)
    pub fn new(size: usize, device_addr: u64) -> Self {
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self { words, device_addr }
    }

    fn slot(&self, offset: usize) -> Option<&AtomicU32> {
        if offset % 4 != 0 {
            return None;
        }
        self.words.get(offset / 4)
    }
}

impl SharedMemory for HeapMemory {
    fn device_addr(&self) -> u64 {
        self.device_addr
    }

    fn size(&self) -> usize {
        self.words.len() * 4
    }

    fn read32(&self, offset: usize) -> u32 {
        match self.slot(offset) {
            Some(word) => word.load(Ordering::Acquire),
            None => {
                log::warn!("shared read at {:#x} outside region", offset);
                0
            }
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        match self.slot(offset) {
            Some(word) => word.store(value, Ordering::Release),
            None => log::warn!("shared write at {:#x} outside region", offset),
        }
    }
}

/// Allocator handing out [`HeapMemory`] regions at increasing device addresses
#[derive(Debug)]
pub struct HeapAllocator {
    next_addr: u64,
    outstanding: usize,
}

impl HeapAllocator {
    /// Create an allocator whose first region starts at `base`
    pub fn new(base: u64) -> Self {
        Self {
            next_addr: base,
            outstanding: 0,
        }
    }

    /// Number of regions allocated and not yet freed
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl DmaAllocator for HeapAllocator {
    fn alloc(&mut self, size: usize, kind: MemoryKind) -> Result<Arc<dyn SharedMemory>> {
        if size == 0 {
            return Err(HalError::InvalidParameter);
        }
        let addr = self.next_addr;
        let span = (size as u64 + 0xFFF) & !0xFFF;
        self.next_addr = addr.checked_add(span).ok_or(HalError::OutOfMemory)?;
        self.outstanding += 1;
        log::trace!("heap dma alloc {:?}: {:#x} bytes at {:#x}", kind, size, addr);
        Ok(Arc::new(HeapMemory::new(size, addr)))
    }

    fn free(&mut self, region: Arc<dyn SharedMemory>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        drop(region);
    }
}

// =============================================================================
// MAPPED MEMORY
// =============================================================================

/// Shared memory backed by an existing DMA mapping
#[derive(Debug)]
pub struct MappedMemory {
    base: NonNull<u32>,
    size: usize,
    device_addr: u64,
}

// SAFETY: every access is a single aligned volatile word operation
unsafe impl Send for MappedMemory {}
// SAFETY: see above
unsafe impl Sync for MappedMemory {}

impl MappedMemory {
    /// Wrap a coherent DMA mapping
    ///
    /// # Safety
    /// - `base` must be valid for reads and writes of `size` bytes
    /// - `base` must be 4-byte aligned
    /// - The mapping must outlive the returned value
    pub unsafe fn new(base: NonNull<u8>, size: usize, device_addr: u64) -> Self {
        Self {
            base: base.cast(),
            size,
            device_addr,
        }
    }

    fn word_ptr(&self, offset: usize) -> Option<*mut u32> {
        if offset % 4 != 0 || offset + 4 > self.size {
            return None;
        }
        // SAFETY: bounds checked above
        Some(unsafe { self.base.as_ptr().add(offset / 4) })
    }
}

impl SharedMemory for MappedMemory {
    fn device_addr(&self) -> u64 {
        self.device_addr
    }

    fn size(&self) -> usize {
        self.size
    }

    fn read32(&self, offset: usize) -> u32 {
        match self.word_ptr(offset) {
            // SAFETY: in bounds and aligned
            Some(ptr) => unsafe { ptr.read_volatile() },
            None => {
                log::warn!("shared read at {:#x} outside mapping", offset);
                0
            }
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        match self.word_ptr(offset) {
            // SAFETY: in bounds and aligned
            Some(ptr) => unsafe { ptr.write_volatile(value) },
            None => log::warn!("shared write at {:#x} outside mapping", offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_heap_memory_words() {
        let mem = HeapMemory::new(10, 0x1000);
        assert_eq!(mem.size(), 12);
        mem.write_words(0, &[1, 2, 3]);
        let mut out = [0u32; 3];
        mem.read_words(0, &mut out);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(mem.read32(12), 0);
    }

    #[test]
    fn test_heap_allocator_addresses() {
        let mut alloc = HeapAllocator::new(0x8000_0000);
        let a = alloc.alloc(0x100, MemoryKind::Queues).unwrap();
        let b = alloc.alloc(0x1001, MemoryKind::CrashReport).unwrap();
        assert_eq!(a.device_addr(), 0x8000_0000);
        assert_eq!(b.device_addr(), 0x8000_1000);
        assert_eq!(alloc.outstanding(), 2);
        alloc.free(a);
        assert_eq!(alloc.outstanding(), 1);
        assert!(alloc.alloc(0, MemoryKind::Trace).is_err());
    }

    #[test]
    fn test_mapped_memory() {
        let mut backing = vec![0u32; 8];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        // SAFETY: backing outlives the mapping
        let mem = unsafe { MappedMemory::new(base, 32, 0x4000) };
        mem.write32(4, 7);
        mem.zero(0, 32);
        mem.write32(28, 9);
        assert_eq!(mem.read32(28), 9);
        assert_eq!(mem.read32(32), 0);
        drop(mem);
        assert_eq!(backing[7], 9);
    }
}
