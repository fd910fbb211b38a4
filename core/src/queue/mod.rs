//! # Interface Queues
//!
//! The command, message and debug rings, the table that describes them to
//! the firmware, and the auxiliary crash-report and trace regions.

pub mod ring;
pub mod table;

pub use ring::{QueueHeader, QueueRole, QueueStats, ReadOutcome, RingQueue, QUEUE_HEADER_SIZE};
pub use table::{
    CrashReport, InterfaceMemory, QueueTable, QueueTableHeader, TraceMapEntry, TraceRange,
    TraceRegion,
};
