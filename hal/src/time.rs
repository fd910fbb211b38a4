//! # Delays
//!
//! Sleep source used by bounded hardware polls.

/// Sleep source for polling loops
pub trait Delay: Send + Sync {
    /// Sleep somewhere between `min_us` and `max_us` microseconds
    fn sleep_us(&self, min_us: u32, max_us: u32);
}

/// Delay that returns immediately
///
/// For simulated hardware, where status bits change without wall time.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn sleep_us(&self, _min_us: u32, _max_us: u32) {
        core::hint::spin_loop();
    }
}

/// Delay backed by `std::thread::sleep`
#[cfg(feature = "std")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDelay;

#[cfg(feature = "std")]
impl Delay for ThreadDelay {
    fn sleep_us(&self, min_us: u32, _max_us: u32) {
        std::thread::sleep(std::time::Duration::from_micros(u64::from(min_us)));
    }
}
