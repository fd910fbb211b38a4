//! # Memory Barriers
//!
//! Ordering primitives for memory shared with the firmware processor.
//!
//! The firmware runs on its own clock and does not snoop host caches, so
//! every ring index update must be bracketed by a full barrier.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        /// Full system barrier
        #[inline(always)]
        pub fn mb() {
            // SAFETY: barrier instruction, no memory operands
            unsafe { core::arch::asm!("dsb sy", options(nostack, preserves_flags)) }
        }

        /// Barrier ordering prior loads
        #[inline(always)]
        pub fn rmb() {
            // SAFETY: barrier instruction, no memory operands
            unsafe { core::arch::asm!("dsb ld", options(nostack, preserves_flags)) }
        }

        /// Barrier ordering prior stores
        #[inline(always)]
        pub fn wmb() {
            // SAFETY: barrier instruction, no memory operands
            unsafe { core::arch::asm!("dsb st", options(nostack, preserves_flags)) }
        }
    } else {
        use core::sync::atomic::{fence, Ordering};

        /// Full system barrier
        #[inline(always)]
        pub fn mb() {
            fence(Ordering::SeqCst);
        }

        /// Barrier ordering prior loads
        #[inline(always)]
        pub fn rmb() {
            fence(Ordering::Acquire);
        }

        /// Barrier ordering prior stores
        #[inline(always)]
        pub fn wmb() {
            fence(Ordering::Release);
        }
    }
}
