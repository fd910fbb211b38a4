//! Register access gated on the power state.
//!
//! Touching the register window while the core is unpowered is a driver
//! bug. The access is refused, logged and escalated as a fatal error.

use alloc::boxed::Box;

use cvp_hal::{Delay, RegisterIo};

use crate::config::PollSpec;
use crate::dispatch::{FatalReason, SinkSlot};
use crate::{HfiError, Result};

/// Outcome of a bounded register poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Poll {
    /// Condition met, with the last value read
    Ready(u32),
    /// Tries exhausted, with the last value read
    Expired(u32),
}

impl Poll {
    pub(crate) fn is_ready(self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

pub(crate) struct Registers {
    io: Box<dyn RegisterIo>,
    powered: bool,
    sink: SinkSlot,
}

impl Registers {
    pub(crate) fn new(io: Box<dyn RegisterIo>, sink: SinkSlot) -> Self {
        Self {
            io,
            powered: false,
            sink,
        }
    }

    pub(crate) fn is_powered(&self) -> bool {
        self.powered
    }

    pub(crate) fn set_powered(&mut self, on: bool) {
        self.powered = on;
    }

    fn check(&self, reg: u32) -> Result<()> {
        if self.powered {
            return Ok(());
        }
        log::error!("register {:#x} accessed while powered off", reg);
        self.sink.raise_fatal(FatalReason::UnpoweredAccess);
        Err(HfiError::PowerOff)
    }

    pub(crate) fn read(&self, reg: u32) -> Result<u32> {
        self.check(reg)?;
        let value = self.io.read32(reg);
        log::trace!("reg read {:#x} -> {:#x}", reg, value);
        Ok(value)
    }

    pub(crate) fn write(&self, reg: u32, value: u32) -> Result<()> {
        self.check(reg)?;
        log::trace!("reg write {:#x} <- {:#x}", reg, value);
        self.io.write32(reg, value);
        Ok(())
    }

    /// Read `reg` until `done` holds or the tries run out
    pub(crate) fn poll(
        &self,
        reg: u32,
        spec: PollSpec,
        delay: &dyn Delay,
        mut done: impl FnMut(u32) -> bool,
    ) -> Result<Poll> {
        let mut value = 0;
        for _ in 0..spec.tries {
            value = self.read(reg)?;
            if done(value) {
                return Ok(Poll::Ready(value));
            }
            delay.sleep_us(spec.sleep.min_us, spec.sleep.max_us);
        }
        Ok(Poll::Expired(value))
    }
}

impl core::fmt::Debug for Registers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registers")
            .field("powered", &self.powered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, SimHardware};
    use alloc::sync::Arc;
    use cvp_hal::time::NoDelay;

    #[test]
    fn test_unpowered_access_is_fatal() {
        let hw = SimHardware::new();
        let sink = Arc::new(RecordingSink::default());
        let slot = SinkSlot::default();
        slot.set(sink.clone());
        let mut regs = Registers::new(Box::new(hw.clone()), slot);

        assert_eq!(regs.read(0x10), Err(HfiError::PowerOff));
        assert_eq!(sink.fatals(), alloc::vec![FatalReason::UnpoweredAccess]);

        regs.set_powered(true);
        regs.write(0x10, 5).unwrap();
        assert_eq!(regs.read(0x10), Ok(5));
    }

    #[test]
    fn test_poll_expires() {
        let hw = SimHardware::new();
        let mut regs = Registers::new(Box::new(hw.clone()), SinkSlot::default());
        regs.set_powered(true);
        let spec = PollSpec::new(3, 0, 0);
        assert_eq!(regs.poll(0x20, spec, &NoDelay, |v| v == 1), Ok(Poll::Expired(0)));
        hw.set(0x20, 1);
        assert_eq!(regs.poll(0x20, spec, &NoDelay, |v| v == 1), Ok(Poll::Ready(1)));
        assert_eq!(hw.reads_of(0x20), 4);
    }
}
