//! # CVP HFI Core
//!
//! Host side of the Host-Firmware Interface to the Iris computer-vision
//! processor. The core owns the shared-memory queues, drives the power
//! sequences, tracks sessions and turns firmware interrupts into events.
//!
//! ## Components
//!
//! - **Ring queues**: lock-free single-producer rings in shared memory
//! - **Queue table**: the table the firmware reads at boot
//! - **Power control**: boot, collapse, resume and the idle timer
//! - **Session registry**: generation-checked session handles
//! - **Dispatcher**: interrupt bottom half and event delivery
//! - **Device facade**: the operations upper layers call
//!
//! ## Threading
//!
//! ```text
//!   upper layer ──► HfiDevice ──► spin::Mutex<HfiCore> ──► registers
//!                       ▲                                   queues
//!   isr() ──► notifier ─┘ process_interrupt()  ──► EventSink (unlocked)
//!                         pm_work()            ◄── PmSchedule timer
//! ```
//!
//! With the `std` feature, [`worker::HfiWorkers`] runs the interrupt bottom
//! half and the power-collapse timer on dedicated threads.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod config;
pub mod device;
pub mod dispatch;
pub mod dsp;
pub mod error;
pub mod packet;
pub mod pm;
pub mod queue;
pub mod session;

mod hw;
mod power;
mod variant;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(feature = "std")]
pub mod worker;

pub use config::{HfiConfig, PollConfig, SleepRange};
pub use device::{BusVote, CoreState, FirmwareInfo, HfiDevice, NocErrorLog, Platform};
pub use dispatch::{EventSink, FatalReason, HfiEvent};
pub use error::{ErrorKind, HfiError, Result};
pub use packet::{CommandKind, HfiCommand, HfiResponse, PacketBuilder, ResponseKind};
pub use queue::{QueueRole, RingQueue};
pub use session::SessionHandle;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
