//! # HAL Errors
//!
//! Failures reported by platform capabilities.

use core::fmt;

/// HAL Result type alias
pub type Result<T> = core::result::Result<T, HalError>;

/// Error returned by a hardware capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// Named resource does not exist on this platform
    NotFound,
    /// Invalid parameter provided
    InvalidParameter,
    /// Access outside a mapped region
    OutOfBounds,
    /// Operation timed out
    Timeout,
    /// Resource is busy
    Busy,
    /// DMA or heap allocation failed
    OutOfMemory,
    /// Regulator, clock, bus or cache operation failed
    ResourceFailure,
    /// Secure monitor rejected a state transition
    SecureCallFailed,
    /// Firmware image could not be loaded
    FirmwareLoadFailed,
    /// Operation not supported on this platform
    NotSupported,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "resource not found"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::OutOfBounds => write!(f, "access out of bounds"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Busy => write!(f, "resource busy"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::ResourceFailure => write!(f, "power resource failure"),
            Self::SecureCallFailed => write!(f, "secure monitor call failed"),
            Self::FirmwareLoadFailed => write!(f, "firmware load failed"),
            Self::NotSupported => write!(f, "operation not supported"),
        }
    }
}
