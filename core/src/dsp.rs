//! # DSP Link
//!
//! The DSP consumes a mirror of the queue table. The core only tells it
//! where the mirror lives and keeps it in step with power transitions.

use crate::queue::QueueTable;
use crate::Result;

/// Control channel to the DSP side
pub trait DspLink: Send {
    /// Hand the mirrored queue table to the DSP
    fn send_queues(&mut self, table: &QueueTable) -> Result<()>;

    /// Quiesce the DSP ahead of a power collapse
    fn suspend(&mut self, force: bool) -> Result<()>;

    /// Undo [`DspLink::suspend`]
    fn resume(&mut self) -> Result<()>;

    /// Tear the DSP side down
    fn shutdown(&mut self);

    /// Whether the DSP is currently suspended
    fn is_suspended(&self) -> bool;
}
