//! # Firmware Control
//!
//! Loading the Iris image and moving the remote processor between
//! protected power states.

use crate::Result;

/// Remote processor state requested through the secure monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RemoteState {
    /// Firmware context saved, core may lose power
    Suspend = 0,
    /// Firmware context restored
    Resume = 1,
    /// Reprogram protection thresholds lost across a GDSC collapse
    RestoreThreshold = 2,
}

/// Privileged state-transition call into the trusted environment
pub trait SecureMonitor: Send {
    /// Move the remote processor to `state`
    fn set_remote_state(&mut self, state: RemoteState) -> Result<()>;
}

/// Firmware image loader
pub trait FirmwareLoader: Send {
    /// Authenticate and load the image into its carve-out
    fn load(&mut self) -> Result<()>;

    /// Tear the image down
    fn unload(&mut self);

    /// Device address the image was loaded at
    fn firmware_base(&self) -> u64;

    /// Raw bytes of the image's version region
    ///
    /// The version string starts at the first `'V'` and runs up to the first
    /// NUL byte.
    fn version_region(&self) -> Option<&[u8]> {
        None
    }
}
