//! # HFI Errors
//!
//! Every failure the core reports, plus a coarse [`ErrorKind`] for callers
//! that only need to decide between retrying, escalating and giving up.

use core::fmt;

use cvp_hal::HalError;

/// HFI Result type alias
pub type Result<T> = core::result::Result<T, HfiError>;

/// Error reported by the HFI core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HfiError {
    /// Argument out of range or malformed
    InvalidArgument,
    /// Operation not allowed in the current core state
    InvalidState,
    /// `core_init` on a core that is already booted
    AlreadyInitialized,
    /// Packet larger than the queue can ever hold
    PacketTooLarge,
    /// Not enough free space in the ring
    QueueFull,
    /// Nothing to read
    QueueEmpty,
    /// Ring contents were inconsistent and the reader resynchronised
    CorruptPacket,
    /// Sessions are active or the device lock is taken
    Busy,
    /// Firmware was not ready for power collapse, try again later
    RetryLater,
    /// A bounded hardware poll expired
    Timeout,
    /// Hardware reported an error code
    HardwareFault,
    /// Register access attempted while the core is unpowered
    PowerOff,
    /// The firmware is gone, recovery required
    Fatal,
    /// Session handle is stale or unknown
    SessionInvalid,
    /// Operation not supported by this configuration
    NotSupported,
    /// Allocation failed
    OutOfMemory,
    /// Platform capability failed
    Hal(HalError),
}

/// Coarse classification of an [`HfiError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller passed something wrong
    InvalidArgument,
    /// Wrong state for the request
    InvalidState,
    /// Try again once current work completes
    Busy,
    /// Try again after a delay
    Retry,
    /// Shared data was corrupt
    CorruptData,
    /// Hardware did not respond in time
    Timeout,
    /// Hardware reported a failure
    HardwareFault,
    /// Subsystem restart required
    Fatal,
    /// Feature unavailable
    NotSupported,
    /// Session is gone
    SessionReset,
    /// Allocation failure
    OutOfMemory,
}

impl HfiError {
    /// Classify the error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument | Self::PacketTooLarge => ErrorKind::InvalidArgument,
            Self::InvalidState | Self::AlreadyInitialized | Self::PowerOff => {
                ErrorKind::InvalidState
            }
            Self::QueueFull | Self::Busy => ErrorKind::Busy,
            Self::QueueEmpty | Self::RetryLater => ErrorKind::Retry,
            Self::CorruptPacket => ErrorKind::CorruptData,
            Self::Timeout => ErrorKind::Timeout,
            Self::HardwareFault => ErrorKind::HardwareFault,
            Self::Fatal => ErrorKind::Fatal,
            Self::SessionInvalid => ErrorKind::SessionReset,
            Self::NotSupported => ErrorKind::NotSupported,
            Self::OutOfMemory => ErrorKind::OutOfMemory,
            Self::Hal(e) => match e {
                HalError::InvalidParameter | HalError::OutOfBounds => ErrorKind::InvalidArgument,
                HalError::Timeout => ErrorKind::Timeout,
                HalError::Busy => ErrorKind::Busy,
                HalError::OutOfMemory => ErrorKind::OutOfMemory,
                HalError::NotSupported | HalError::NotFound => ErrorKind::NotSupported,
                HalError::ResourceFailure
                | HalError::SecureCallFailed
                | HalError::FirmwareLoadFailed => ErrorKind::HardwareFault,
            },
        }
    }

    /// Whether the caller may simply retry later
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Busy | ErrorKind::Retry)
    }
}

impl From<HalError> for HfiError {
    fn from(e: HalError) -> Self {
        match e {
            HalError::OutOfMemory => Self::OutOfMemory,
            HalError::Timeout => Self::Timeout,
            other => Self::Hal(other),
        }
    }
}

impl fmt::Display for HfiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidState => write!(f, "invalid core state"),
            Self::AlreadyInitialized => write!(f, "core already initialized"),
            Self::PacketTooLarge => write!(f, "packet larger than queue"),
            Self::QueueFull => write!(f, "queue full"),
            Self::QueueEmpty => write!(f, "queue empty"),
            Self::CorruptPacket => write!(f, "corrupt packet in queue"),
            Self::Busy => write!(f, "device busy"),
            Self::RetryLater => write!(f, "firmware not ready, retry later"),
            Self::Timeout => write!(f, "hardware poll timed out"),
            Self::HardwareFault => write!(f, "hardware fault"),
            Self::PowerOff => write!(f, "register access while powered off"),
            Self::Fatal => write!(f, "fatal firmware error"),
            Self::SessionInvalid => write!(f, "invalid session"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Hal(e) => write!(f, "platform: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(HfiError::QueueFull.kind(), ErrorKind::Busy);
        assert_eq!(HfiError::RetryLater.kind(), ErrorKind::Retry);
        assert_eq!(HfiError::SessionInvalid.kind(), ErrorKind::SessionReset);
        assert_eq!(HfiError::Hal(HalError::SecureCallFailed).kind(), ErrorKind::HardwareFault);
        assert!(HfiError::Busy.is_transient());
        assert!(!HfiError::Fatal.is_transient());
    }

    #[test]
    fn test_from_hal() {
        assert_eq!(HfiError::from(HalError::OutOfMemory), HfiError::OutOfMemory);
        assert_eq!(HfiError::from(HalError::Timeout), HfiError::Timeout);
        assert_eq!(HfiError::from(HalError::Timeout).kind(), ErrorKind::Timeout);
        assert_eq!(
            HfiError::from(HalError::SecureCallFailed),
            HfiError::Hal(HalError::SecureCallFailed)
        );
    }
}
