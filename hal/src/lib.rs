//! # CVP Hardware Abstraction Layer
//!
//! Register vocabulary and capability contracts for the CVP accelerator and
//! its Iris firmware processor.
//!
//! The HFI core never touches a platform API directly. Everything it needs
//! from the outside world is expressed here as a trait, and the owner of the
//! device hands concrete implementations in at construction time.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             cvp-hal                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────────┐  │
//! │  │   mmio     │  │   memory   │  │   power    │  │  firmware  │  │
//! │  │• RegIo     │  │• Shared    │  │• Regulator │  │• Loader    │  │
//! │  │• Region    │  │• DmaAlloc  │  │• Clocks    │  │• Secure    │  │
//! │  │            │  │• Heap/Map  │  │• Bus/Cache │  │  monitor   │  │
//! │  └────────────┘  └────────────┘  └────────────┘  └────────────┘  │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────────┐  │
//! │  │   regs     │  │  variant   │  │    irq     │  │  barrier   │  │
//! │  │• Offsets   │  │• SoC table │  │• IrqLine   │  │• mb/rmb/wmb│  │
//! │  │• Bit flags │  │• NOC QoS   │  │            │  │            │  │
//! │  └────────────┘  └────────────┘  └────────────┘  └────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod barrier;
pub mod error;
pub mod firmware;
pub mod irq;
pub mod memory;
pub mod mmio;
pub mod power;
pub mod regs;
pub mod time;
pub mod variant;

// Re-exports for convenience
pub use error::{HalError, Result};
pub use firmware::{FirmwareLoader, RemoteState, SecureMonitor};
pub use irq::IrqLine;
pub use memory::{DmaAllocator, MemoryKind, SharedMemory};
pub use mmio::RegisterIo;
pub use power::PowerResources;
pub use time::Delay;
pub use variant::{SocVariant, VariantTable};
