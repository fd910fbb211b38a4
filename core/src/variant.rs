//! Register sequences that differ between hardware generations.
//!
//! One [`VariantOps`] implementation per generation, picked once from the
//! [`SocVariant`] at construction. Per-SoC constants (register defaults,
//! QoS values, optional steps) stay in the [`cvp_hal::VariantTable`] the
//! implementation reads through the core.

use cvp_hal::power::ResetGate;
use cvp_hal::regs::{self, IntrStatus};
use cvp_hal::SocVariant;

use crate::device::{HfiCore, NocErrorLog};
use crate::hw::Poll;
use crate::{HfiError, Result};

/// Generation-specific hardware sequences
pub(crate) trait VariantOps: Sync {
    /// Generation name for logs
    fn name(&self) -> &'static str;

    /// Unmask the interrupts the host services
    fn interrupt_init(&self, core: &HfiCore) -> Result<()>;

    /// Point the firmware at the DSP queue table mirror
    fn setup_dsp_memmap(&self, core: &HfiCore) -> Result<()>;

    /// Clock branch programming once the controller is powered
    fn clock_config_on_enable(&self, core: &HfiCore) -> Result<()>;

    /// Pulse the AHB2AXI bridge reset lines
    fn reset_bridge(&self, core: &mut HfiCore) -> Result<()>;

    /// Full power-off: core, controller, buses
    fn power_off(&self, core: &mut HfiCore);

    /// Snapshot of both NOC error loggers
    fn noc_error_info(&self, core: &HfiCore) -> Result<NocErrorLog>;
}

/// Operations for the chosen variant
pub(crate) fn ops_for(variant: SocVariant) -> &'static dyn VariantOps {
    match variant {
        SocVariant::Iris2 | SocVariant::Waipio | SocVariant::Kalama => &IRIS2_OPS,
    }
}

static IRIS2_OPS: Iris2Ops = Iris2Ops;

/// Iris2 generation
#[derive(Debug)]
struct Iris2Ops;

impl Iris2Ops {
    fn power_off_core(&self, core: &HfiCore) -> Result<()> {
        let r = &core.regs;
        let poll = core.config.poll;
        let delay = core.delay.as_ref();

        let gdsc = r.read(regs::CC_MVS1_GDSCR)?;
        if gdsc & regs::GDSC_POWER_ON == 0 {
            // Firmware already collapsed the core
            let ack = r.read(regs::NOC_RESET_ACK)?;
            if ack != 0 {
                log::warn!("core off with NOC reset ack {:#x}", ack);
                self.log_sideband(core);
            }
            return Ok(());
        }

        log::debug!("driver controls core power off");
        let config = r.read(regs::WRAPPER_CORE_CLOCK_CONFIG)?;
        if config != 0 {
            log::debug!("core clock branch disabled, enabling to reach core");
            r.write(regs::WRAPPER_CORE_CLOCK_CONFIG, 0)?;
        }

        let mut warned = false;
        if let Poll::Expired(v) =
            r.poll(regs::SS_IDLE_STATUS, poll.core_idle, delay, |v| v & regs::SS_IDLE != 0)?
        {
            log::warn!("core failed to go idle {:#x}", v);
            warned = true;
        }

        r.write(regs::NOC_RESET_REQ, 0x7)?;
        if let Poll::Expired(v) =
            r.poll(regs::NOC_RESET_ACK, poll.noc_reset, delay, |v| v & 0x7 == 0x7)?
        {
            log::warn!("core NOC reset assert failed {:#x}", v);
            warned = true;
        }

        r.write(regs::NOC_RESET_REQ, 0)?;
        if !r
            .poll(regs::NOC_RESET_ACK, poll.noc_reset, delay, |v| v & 0x1 == 0)?
            .is_ready()
        {
            log::warn!("core NOC reset de-assert failed");
            warned = true;
        }
        if warned {
            self.log_sideband(core);
        }

        // Both sides of the TZ and non-TZ AHB bridges
        r.write(regs::AHB_BRIDGE_SYNC_RESET, 0x3)?;
        r.write(regs::AHB_BRIDGE_SYNC_RESET, 0x2)?;
        r.write(regs::AHB_BRIDGE_SYNC_RESET, 0x0)?;

        r.write(regs::WRAPPER_CORE_CLOCK_CONFIG, config)
    }

    fn controller_low_power(&self, core: &HfiCore) -> Result<()> {
        let r = &core.regs;
        let poll = core.config.poll;
        let delay = core.delay.as_ref();

        r.write(regs::CPU_CS_X2RPMH, 0x3)?;

        r.write(regs::AON_WRAPPER_NOC_LPI_CONTROL, 0x1)?;
        if let Poll::Expired(v) =
            r.poll(regs::AON_WRAPPER_NOC_LPI_STATUS, poll.noc_lpi, delay, |v| v & 1 != 0)?
        {
            self.log_not_accepted(core, "core", v)?;
        }

        r.write(regs::WRAPPER_CPU_NOC_LPI_CONTROL, 0x1)?;
        let cpu = r.poll(regs::WRAPPER_CPU_NOC_LPI_STATUS, poll.noc_lpi, delay, |v| v & 1 != 0)?;
        log::debug!(
            "cpu NOC lpi {:?}, sideband {:#x}",
            cpu,
            r.read(regs::NOC_SBM_SENSELN0_LOW)?
        );
        if let Poll::Expired(v) = cpu {
            self.log_not_accepted(core, "cpu", v)?;
        }

        r.write(regs::WRAPPER_DEBUG_BRIDGE_LPI_CONTROL, 0)?;
        if let Poll::Expired(v) =
            r.poll(regs::WRAPPER_DEBUG_BRIDGE_LPI_STATUS, poll.noc_lpi, delay, |v| v == 0)?
        {
            log::warn!("debug bridge lpi release stuck at {:#x}", v);
        }

        if core.table.pdx_fifo_reset {
            r.write(regs::WRAPPER_AXI_CLOCK_CONFIG, 0x3)?;
            r.write(regs::WRAPPER_QNS4PDXFIFO_RESET, 0x1)?;
            r.write(regs::WRAPPER_QNS4PDXFIFO_RESET, 0x0)?;
            r.write(regs::WRAPPER_AXI_CLOCK_CONFIG, 0x0)?;
        }
        Ok(())
    }

    fn log_not_accepted(&self, core: &HfiCore, which: &str, lpi: u32) -> Result<()> {
        let wfi = core.regs.read(regs::WRAPPER_CPU_STATUS)?;
        let ctrl = core.regs.read(regs::CTRL_STATUS)?;
        log::warn!(
            "{} NOC not in qaccept: lpi {:#x} cpu {:#x} ctrl {:#x}",
            which,
            lpi,
            wfi,
            ctrl
        );
        self.log_sideband(core);
        Ok(())
    }

    fn log_sideband(&self, core: &HfiCore) {
        if let Ok(v) = core.regs.read(regs::NOC_SBM_SENSELN0_LOW) {
            log::warn!("sideband manager senseln0 {:#x}", v);
        }
    }
}

impl VariantOps for Iris2Ops {
    fn name(&self) -> &'static str {
        "iris2"
    }

    fn interrupt_init(&self, core: &HfiCore) -> Result<()> {
        let mask = core.regs.read(regs::WRAPPER_INTR_MASK)?;
        let unmask = (IntrStatus::FATAL | IntrStatus::A2HCPU).bits();
        core.regs.write(regs::WRAPPER_INTR_MASK, mask & !unmask)?;
        log::trace!("interrupt mask {:#x}", mask & !unmask);
        Ok(())
    }

    fn setup_dsp_memmap(&self, core: &HfiCore) -> Result<()> {
        let Some(dsp) = core.memory.as_ref().and_then(|m| m.dsp.as_ref()) else {
            return Ok(());
        };
        let addr = dsp.device_addr() as u32;
        core.regs.write(regs::DSP_QTBL_ADDR, addr)?;
        core.regs.write(regs::DSP_UC_REGION_ADDR, addr)?;
        core.regs.write(regs::DSP_UC_REGION_SIZE, dsp.size() as u32)
    }

    fn clock_config_on_enable(&self, core: &HfiCore) -> Result<()> {
        core.regs.write(regs::WRAPPER_CPU_CLOCK_CONFIG, 0)
    }

    fn reset_bridge(&self, core: &mut HfiCore) -> Result<()> {
        let powered = core.regs.is_powered();
        let ignore_power = core.table.bridge_reset_ignores_power;
        let gated = |gate: ResetGate| {
            ignore_power
                || match gate {
                    ResetGate::Any => true,
                    ResetGate::PoweredOn => powered,
                    ResetGate::PoweredOff => !powered,
                }
        };

        for line in core.resources.resets.iter_mut() {
            if gated(line.gate()) {
                line.assert_reset().map_err(|e| {
                    log::error!("failed to assert reset {}", line.name());
                    HfiError::from(e)
                })?;
            }
        }

        let hold = core.config.poll.reset_hold;
        core.delay.sleep_us(hold.min_us, hold.max_us);

        for line in core.resources.resets.iter_mut() {
            if gated(line.gate()) {
                line.deassert_reset().map_err(|e| {
                    log::error!("failed to deassert reset {}", line.name());
                    HfiError::from(e)
                })?;
            }
        }
        Ok(())
    }

    fn power_off(&self, core: &mut HfiCore) {
        if !core.regs.is_powered() {
            return;
        }

        if !IntrStatus::from_bits_truncate(core.intr_status).contains(IntrStatus::A2HWD) {
            core.irq.disable_nosync();
        }
        core.intr_status = 0;

        if let Err(e) = self.power_off_core(core) {
            log::error!("core power off sequence failed: {}", e);
        }
        core.core_resources_off();

        if let Err(e) = self.controller_low_power(core) {
            log::error!("controller low power handshake failed: {}", e);
        }
        core.controller_resources_off();

        core.unvote_buses();

        // No register access past this point
        core.regs.set_powered(false);
        log::info!("cvp power collapsed");
    }

    fn noc_error_info(&self, core: &HfiCore) -> Result<NocErrorLog> {
        let mut out = NocErrorLog::default();
        for (i, (name, off)) in regs::NOC_ERR_LOGGER_REGS.iter().enumerate() {
            out.controller[i] = core.regs.read(regs::NOC_ERR_LOGGER_BASE + off)?;
            log::error!("NOC controller {}: {:#x}", name, out.controller[i]);
        }
        for (i, (name, off)) in regs::NOC_ERR_LOGGER_REGS.iter().enumerate() {
            out.core[i] = core.regs.read(regs::NOC_CORE_ERR_LOGGER_BASE + off)?;
            log::error!("NOC core {}: {:#x}", name, out.core[i]);
        }
        let errlog3 = out.core_errlog3_low();
        log::error!(
            "core ERRLOG3_LOW: mid {:#x} sid {:#x}",
            NocErrorLog::master_id(errlog3),
            NocErrorLog::sub_id(errlog3)
        );
        Ok(out)
    }
}
