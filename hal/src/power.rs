//! # Power Resources
//!
//! Capability contracts for the regulators, clocks, interconnect paths,
//! system cache slices and reset lines that feed the accelerator.
//!
//! Every capability follows the same two-level life cycle: `acquire()` and
//! `release()` bracket ownership of the handle, `enable()`/`disable()` (or
//! `vote()`, `activate()`, `assert_reset()`) switch the hardware itself.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::{HalError, Result};

// =============================================================================
// CAPABILITIES
// =============================================================================

/// A power rail (GDSC)
pub trait Regulator: Send {
    /// Rail name as known to the platform (`"cvp"`, `"cvp-core"`)
    fn name(&self) -> &str;

    /// Obtain the handle
    fn acquire(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop the handle
    fn release(&mut self) {}

    /// Switch the rail on
    fn enable(&mut self) -> Result<()>;

    /// Switch the rail off
    fn disable(&mut self) -> Result<()>;

    /// Whether the rail is currently on
    fn is_enabled(&self) -> bool;

    /// Whether the rail can be handed to hardware control
    fn has_hw_power_collapse(&self) -> bool {
        false
    }

    /// Hand control to hardware (`true`) or take it back (`false`)
    fn set_hw_control(&mut self, _hw: bool) -> Result<()> {
        Ok(())
    }
}

/// The accelerator's clock tree
pub trait ClockController: Send {
    /// Obtain clock handles
    fn acquire(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop clock handles
    fn release(&mut self) {}

    /// Prepare and enable a named clock
    fn prepare_enable(&mut self, name: &str) -> Result<()>;

    /// Disable and unprepare a named clock
    fn disable_unprepare(&mut self, name: &str);

    /// Scale the core clock
    fn set_rate(&mut self, hz: u64) -> Result<()>;
}

/// An interconnect path with a bandwidth range
pub trait Interconnect: Send {
    /// Path name
    fn name(&self) -> &str;

    /// Register with the interconnect framework
    fn acquire(&mut self) -> Result<()> {
        Ok(())
    }

    /// Unregister
    fn release(&mut self) {}

    /// Upper end of the configured bandwidth range, in kbps
    fn max_bandwidth(&self) -> u64;

    /// Request bandwidth in kbps; zero removes the vote
    fn set_bandwidth(&mut self, kbps: u64) -> Result<()>;
}

/// A carve-out of the shared last-level cache
pub trait CacheSlice: Send {
    /// Slice name (`"cvp"`, `"cvpfw"`)
    fn name(&self) -> &str;

    /// Obtain the slice descriptor
    fn acquire(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop the slice descriptor
    fn release(&mut self) {}

    /// Slice id as programmed into firmware
    fn slice_id(&self) -> u32;

    /// Slice size in KiB
    fn size(&self) -> u32;

    /// Start routing accelerator traffic through the slice
    fn activate(&mut self) -> Result<()>;

    /// Stop routing traffic through the slice
    fn deactivate(&mut self) -> Result<()>;
}

/// Power state a reset line must observe before toggling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetGate {
    /// Toggle regardless of power state
    Any,
    /// Toggle only while the accelerator is powered
    PoweredOn,
    /// Toggle only while the accelerator is unpowered
    PoweredOff,
}

/// A reset controller line
pub trait ResetLine: Send {
    /// Line name
    fn name(&self) -> &str;

    /// Obtain the line
    fn acquire(&mut self) -> Result<()> {
        Ok(())
    }

    /// Power state the line is gated on
    fn gate(&self) -> ResetGate {
        ResetGate::Any
    }

    /// Put the block into reset
    fn assert_reset(&mut self) -> Result<()>;

    /// Take the block out of reset
    fn deassert_reset(&mut self) -> Result<()>;
}

// =============================================================================
// RESOURCE SET
// =============================================================================

/// Every power capability the accelerator depends on
pub struct PowerResources {
    /// Power rails, controller rail first
    pub regulators: Vec<Box<dyn Regulator>>,
    /// Clock tree
    pub clocks: Box<dyn ClockController>,
    /// Interconnect paths
    pub buses: Vec<Box<dyn Interconnect>>,
    /// System cache slices, empty when the SoC has none
    pub cache_slices: Vec<Box<dyn CacheSlice>>,
    /// Reset lines
    pub resets: Vec<Box<dyn ResetLine>>,
}

impl fmt::Debug for PowerResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerResources")
            .field("regulators", &self.regulators.len())
            .field("buses", &self.buses.len())
            .field("cache_slices", &self.cache_slices.len())
            .field("resets", &self.resets.len())
            .finish()
    }
}

impl PowerResources {
    /// Look up a regulator by name
    pub fn regulator(&mut self, name: &str) -> Result<&mut (dyn Regulator + 'static)> {
        self.regulators
            .iter_mut()
            .find(|r| r.name() == name)
            .map(|r| r.as_mut())
            .ok_or(HalError::NotFound)
    }

    /// Whether the SoC exposes system cache slices
    pub fn has_system_cache(&self) -> bool {
        !self.cache_slices.is_empty()
    }

    /// Acquire every handle, releasing what was taken on failure
    ///
    /// Cache slices are optional: a slice failure is logged and the slices
    /// are dropped instead of failing the whole set.
    pub fn acquire(&mut self) -> Result<()> {
        for i in 0..self.regulators.len() {
            if let Err(e) = self.regulators[i].acquire() {
                log::error!("failed to get regulator {}", self.regulators[i].name());
                self.regulators[..i].iter_mut().rev().for_each(|r| r.release());
                return Err(e);
            }
        }

        if let Err(e) = self.clocks.acquire() {
            log::error!("failed to init clocks");
            self.release_regulators();
            return Err(e);
        }

        for reset in self.resets.iter_mut() {
            if let Err(e) = reset.acquire() {
                log::error!("failed to init reset line {}", reset.name());
                self.clocks.release();
                self.release_regulators();
                return Err(e);
            }
        }

        for i in 0..self.buses.len() {
            if let Err(e) = self.buses[i].acquire() {
                log::error!("failed to register bus {}", self.buses[i].name());
                self.buses[..i].iter_mut().rev().for_each(|b| b.release());
                self.clocks.release();
                self.release_regulators();
                return Err(e);
            }
        }

        for i in 0..self.cache_slices.len() {
            if self.cache_slices[i].acquire().is_err() {
                log::warn!("invalid subcache {}", self.cache_slices[i].name());
                self.cache_slices[..i].iter_mut().rev().for_each(|s| s.release());
                self.cache_slices.clear();
                break;
            }
        }

        Ok(())
    }

    /// Release every handle in reverse acquisition order
    pub fn release(&mut self) {
        self.cache_slices.iter_mut().rev().for_each(|s| s.release());
        self.buses.iter_mut().rev().for_each(|b| b.release());
        self.clocks.release();
        self.release_regulators();
    }

    fn release_regulators(&mut self) {
        self.regulators.iter_mut().rev().for_each(|r| r.release());
    }
}
