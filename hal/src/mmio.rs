//! # Memory-Mapped I/O
//!
//! Raw 32-bit register access for the CVP register window.

use core::ptr::NonNull;

use crate::barrier;

// =============================================================================
// REGISTER I/O CONTRACT
// =============================================================================

/// 32-bit register window
///
/// Offsets are in bytes from the start of the window. Implementations
/// must order each access against surrounding memory traffic: a write is
/// visible to the device before the call returns, a read is complete before
/// any later load is issued.
pub trait RegisterIo: Send + Sync {
    /// Read a 32-bit register
    fn read32(&self, offset: u32) -> u32;

    /// Write a 32-bit register
    fn write32(&self, offset: u32, value: u32);
}

// =============================================================================
// MMIO REGION
// =============================================================================

/// Mapped register window backed by device memory
#[derive(Debug)]
pub struct MmioRegion {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: register accesses are single volatile operations and the mapping
// is owned for the lifetime of the region.
unsafe impl Send for MmioRegion {}
// SAFETY: see above, no host-side state is mutated through `&self`.
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Wrap an already mapped register window
    ///
    /// # Safety
    /// - `base` must point to a mapping of at least `size` bytes
    /// - `base` must be 4-byte aligned
    /// - The mapping must outlive the returned region
    pub unsafe fn new(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    /// Size of the window in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    fn checked(&self, offset: u32) -> Option<*mut u32> {
        let offset = offset as usize;
        if offset % 4 != 0 || offset + 4 > self.size {
            log::error!("register offset {:#x} outside window of {:#x}", offset, self.size);
            return None;
        }
        // SAFETY: bounds checked above
        Some(unsafe { self.base.as_ptr().add(offset) }.cast::<u32>())
    }
}

impl RegisterIo for MmioRegion {
    fn read32(&self, offset: u32) -> u32 {
        let Some(ptr) = self.checked(offset) else {
            return u32::MAX;
        };
        // SAFETY: pointer is in bounds and aligned
        let value = unsafe { ptr.read_volatile() };
        barrier::rmb();
        value
    }

    fn write32(&self, offset: u32, value: u32) {
        let Some(ptr) = self.checked(offset) else {
            return;
        };
        // SAFETY: pointer is in bounds and aligned
        unsafe { ptr.write_volatile(value) };
        barrier::wmb();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_region_read_write() {
        let mut backing = vec![0u32; 16];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        // SAFETY: backing outlives the region
        let region = unsafe { MmioRegion::new(base, 64) };

        region.write32(0x8, 0xdead_beef);
        assert_eq!(region.read32(0x8), 0xdead_beef);
        assert_eq!(region.read32(0xC), 0);
        drop(region);
        assert_eq!(backing[2], 0xdead_beef);
    }

    #[test]
    fn test_region_rejects_out_of_window() {
        let mut backing = vec![0u32; 4];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        // SAFETY: backing outlives the region
        let region = unsafe { MmioRegion::new(base, 16) };

        region.write32(0x10, 1);
        assert_eq!(region.read32(0x10), u32::MAX);
        assert_eq!(region.read32(0x2), u32::MAX);
    }
}
