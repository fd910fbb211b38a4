//! # Interrupt Line
//!
//! The single wired interrupt the firmware raises towards the host.

/// Host interrupt line
///
/// All methods take `&self`: the line is toggled both from interrupt
/// context and from worker threads without holding the device lock.
pub trait IrqLine: Send + Sync {
    /// Interrupt number
    fn number(&self) -> u32;

    /// Unmask the line
    fn enable(&self);

    /// Mask the line without waiting for a running handler
    fn disable_nosync(&self);
}
