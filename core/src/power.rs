//! # Power Control
//!
//! Power-on, firmware boot, power collapse and resume for the Iris core.
//!
//! ## Power Domains
//!
//! ```text
//!   buses ──► controller ("cvp" rail, bridge reset, axi + cvp clocks)
//!                 └──► core ("cvp-core" rail, mvs1 + core clocks)
//! ```
//!
//! Power-on walks the chain left to right and unwinds on failure. The
//! register window is only marked powered once both domains are up, so an
//! unwind never touches a register. Power-off is generation specific and
//! lives with the variant ops.

use alloc::vec::Vec;

use cvp_hal::regs::{self, CpuStatus, CtrlStatus};
use cvp_hal::RemoteState;

use crate::device::{CoreState, HfiCore};
use crate::dispatch::FatalReason;
use crate::hw::Poll;
use crate::packet::{CommandKind, HfiCommand, SubcacheEntry};
use crate::pm::PmOutcome;
use crate::{HfiError, Result};

/// Controller power rail
const CONTROLLER_RAIL: &str = "cvp";
/// Core power rail
const CORE_RAIL: &str = "cvp-core";

const CLK_AXI: &str = "gcc_video_axi1";
const CLK_CONTROLLER: &str = "cvp_clk";
const CLK_CORE_SRC: &str = "video_cc_mvs1_clk_src";
const CLK_CORE: &str = "core_clk";

/// Bandwidth request from the upper layer
///
/// The core keeps the latest set until power-off clears it. Each vote,
/// including the one at power-on, requests the maximum bandwidth of every
/// bus whatever the set holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusVote {
    /// Requested DDR bandwidth in kbps
    pub ddr_bw_kbps: u64,
    /// Requested system cache bandwidth in kbps
    pub sys_cache_bw_kbps: u64,
    /// Session wants the system cache
    pub use_sys_cache: bool,
}

/// Per-slice system cache bookkeeping
#[derive(Debug, Default)]
pub(crate) struct SubcacheState {
    active: Vec<bool>,
    set: Vec<bool>,
    res_set: bool,
}

impl SubcacheState {
    fn reset(&mut self, slices: usize) {
        if self.active.len() != slices {
            self.active = alloc::vec![false; slices];
            self.set = alloc::vec![false; slices];
        }
    }
}

impl HfiCore {
    // =========================================================================
    // BUSES
    // =========================================================================

    /// Cache `votes` and put every path at its maximum bandwidth
    pub(crate) fn vote_buses(&mut self, votes: &[BusVote]) -> Result<()> {
        if votes.is_empty() {
            log::debug!("no bus vote data available");
        }
        self.bus_votes = votes.to_vec();

        let mut result = Ok(());
        for bus in self.resources.buses.iter_mut() {
            let bw = bus.max_bandwidth();
            if let Err(e) = bus.set_bandwidth(bw) {
                log::error!("failed voting bus {} to {} kbps", bus.name(), bw);
                result = Err(e.into());
            }
        }
        result
    }

    /// Drop every bandwidth vote
    pub(crate) fn unvote_buses(&mut self) {
        self.bus_votes.clear();
        for bus in self.resources.buses.iter_mut() {
            if bus.set_bandwidth(0).is_err() {
                log::warn!("failed unvoting bus {}", bus.name());
                break;
            }
        }
    }

    // =========================================================================
    // REGULATORS
    // =========================================================================

    fn enable_regulator(&mut self, name: &str) -> Result<()> {
        let rail = self.resources.regulator(name).map_err(|e| {
            log::error!("regulator {} not found", name);
            HfiError::from(e)
        })?;
        rail.enable().map_err(|e| {
            log::error!("failed to enable {}: {}", name, e);
            HfiError::from(e)
        })?;
        if !rail.is_enabled() {
            log::error!("regulator {} not enabled", name);
            let _ = rail.disable();
            return Err(HfiError::InvalidState);
        }
        log::debug!("enabled regulator {}", name);
        Ok(())
    }

    /// Take the rail back from hardware control and switch it off
    ///
    /// Failures leave the rail in an unknown state and are escalated.
    fn disable_regulator(&mut self, name: &str) {
        let Ok(rail) = self.resources.regulator(name) else {
            log::error!("regulator {} not found", name);
            return;
        };
        log::debug!("disabling regulator {}", name);

        let mut failed = false;
        if rail.has_hw_power_collapse() && rail.set_hw_control(false).is_err() {
            log::warn!("failed to acquire control on {}", name);
            failed = true;
        }
        if !failed {
            if !rail.is_enabled() {
                log::warn!("regulator {} is not enabled", name);
                self.sink.raise_fatal(FatalReason::RegulatorFault);
            }
            if let Err(e) = rail.disable() {
                log::warn!("failed to disable {}: {}", name, e);
                failed = true;
            }
        }
        if failed {
            self.sink.raise_fatal(FatalReason::RegulatorFault);
        }
    }

    /// Let hardware collapse the rails between frames
    fn hand_off_regulators(&mut self) -> Result<()> {
        if !self.config.fw_low_power_mode {
            log::debug!("not enabling hardware power collapse");
            return Ok(());
        }

        let rails = &mut self.resources.regulators;
        for i in 0..rails.len() {
            if !rails[i].has_hw_power_collapse() {
                continue;
            }
            if let Err(e) = rails[i].set_hw_control(true) {
                log::warn!("failed to hand off {}", rails[i].name());
                for rail in rails[..i].iter_mut().rev() {
                    if rail.has_hw_power_collapse() && rail.set_hw_control(false).is_err() {
                        log::warn!("failed to acquire {} back", rail.name());
                    }
                }
                return Err(e.into());
            }
            log::debug!("handed {} to hardware", rails[i].name());
        }
        Ok(())
    }

    // =========================================================================
    // POWER ON / OFF
    // =========================================================================

    fn power_on_controller(&mut self) -> Result<()> {
        self.enable_regulator(CONTROLLER_RAIL)?;

        let ops = self.ops;
        if let Err(e) = ops.reset_bridge(self) {
            log::error!("failed to reset ahb2axi: {}", e);
            self.disable_regulator(CONTROLLER_RAIL);
            return Err(e);
        }

        if let Err(e) = self.resources.clocks.prepare_enable(CLK_AXI) {
            log::error!("failed to enable axi clock: {}", e);
            self.disable_regulator(CONTROLLER_RAIL);
            return Err(e.into());
        }
        if let Err(e) = self.resources.clocks.prepare_enable(CLK_CONTROLLER) {
            log::error!("failed to enable controller clock: {}", e);
            self.resources.clocks.disable_unprepare(CLK_AXI);
            self.disable_regulator(CONTROLLER_RAIL);
            return Err(e.into());
        }
        Ok(())
    }

    fn power_on_core(&mut self) -> Result<()> {
        self.enable_regulator(CORE_RAIL)?;

        if let Err(e) = self.resources.clocks.prepare_enable(CLK_CORE_SRC) {
            log::error!("failed to enable core source clock: {}", e);
            self.disable_regulator(CORE_RAIL);
            return Err(e.into());
        }
        if let Err(e) = self.resources.clocks.prepare_enable(CLK_CORE) {
            log::error!("failed to enable core clock: {}", e);
            self.resources.clocks.disable_unprepare(CLK_CORE_SRC);
            self.disable_regulator(CORE_RAIL);
            return Err(e.into());
        }
        Ok(())
    }

    /// Controller clocks, bridge reset and rail, no register access
    pub(crate) fn controller_resources_off(&mut self) {
        self.resources.clocks.disable_unprepare(CLK_CONTROLLER);
        self.resources.clocks.disable_unprepare(CLK_AXI);
        let ops = self.ops;
        if let Err(e) = ops.reset_bridge(self) {
            log::error!("off: failed to reset ahb2axi: {}", e);
        }
        self.disable_regulator(CONTROLLER_RAIL);
    }

    /// Core rail and clocks, no register access
    pub(crate) fn core_resources_off(&mut self) {
        self.disable_regulator(CORE_RAIL);
        self.resources.clocks.disable_unprepare(CLK_CORE);
        self.resources.clocks.disable_unprepare(CLK_CORE_SRC);
    }

    /// Bring both power domains up and program the wrapper
    pub(crate) fn power_on(&mut self) -> Result<()> {
        if self.regs.is_powered() {
            return Ok(());
        }
        log::debug!("powering on cvp");

        let votes = core::mem::take(&mut self.bus_votes);
        if let Err(e) = self.vote_buses(&votes) {
            log::error!("failed to vote buses: {}", e);
            self.unvote_buses();
            return Err(e);
        }

        if let Err(e) = self.power_on_controller() {
            log::error!("failed to power on controller: {}", e);
            self.unvote_buses();
            return Err(e);
        }

        if let Err(e) = self.power_on_core() {
            log::error!("failed to power on core: {}", e);
            self.controller_resources_off();
            self.unvote_buses();
            return Err(e);
        }

        if self.clock_rate != 0 {
            if let Err(e) = self.resources.clocks.set_rate(self.clock_rate) {
                log::warn!("failed to scale clocks, performance might be impacted: {}", e);
            }
        }

        self.regs.set_powered(true);

        self.set_registers()?;
        let ops = self.ops;
        ops.clock_config_on_enable(self)?;
        ops.interrupt_init(self)?;
        self.intr_status = 0;
        self.irq.enable();

        // Drop the debug bridge low power request left by power-off
        self.regs.write(regs::WRAPPER_DEBUG_BRIDGE_LPI_CONTROL, 0x7)?;
        log::info!("cvp powered on ({})", ops.name());
        Ok(())
    }

    /// Variant power-off, no-op when already unpowered
    pub(crate) fn power_off(&mut self) {
        let ops = self.ops;
        ops.power_off(self);
    }

    fn set_registers(&self) -> Result<()> {
        for d in self.table.reg_defaults {
            self.regs.write(d.reg, d.value)?;
        }
        let qos = &self.table.noc_qos;
        self.regs.write(regs::CPU_CS_AXI4_QOS, qos.axi_qos)?;
        self.regs.write(regs::NOC_PRIORITYLUT_LOW, qos.prioritylut_low)?;
        self.regs.write(regs::NOC_PRIORITYLUT_HIGH, qos.prioritylut_high)?;
        self.regs.write(regs::NOC_URGENCY_LOW, qos.urgency_low)?;
        self.regs.write(regs::NOC_DANGERLUT_LOW, qos.dangerlut_low)?;
        self.regs.write(regs::NOC_SAFELUT_LOW, qos.safelut_low)
    }

    // =========================================================================
    // FIRMWARE BOOT
    // =========================================================================

    /// Start the firmware and wait for it to report init done
    pub(crate) fn boot_firmware(&mut self) -> Result<()> {
        if let Err(e) = self.hand_off_regulators() {
            log::error!("failed to enable inter-frame power collapse: {}", e);
        }

        let poll = self.config.poll;
        let delay = self.delay.as_ref();
        let gdsc = self.regs.poll(regs::CC_MVS1_GDSCR, poll.gdsc, delay, |v| {
            v & regs::GDSC_POWER_ON == 0
        })?;
        if !gdsc.is_ready() {
            log::error!("core still powered before boot");
        }

        self.regs.write(regs::CTRL_INIT, 0x1)?;
        let status = match self.regs.poll(regs::CTRL_STATUS, poll.boot, delay, |v| v != 0)? {
            Poll::Ready(v) | Poll::Expired(v) => v,
        };

        let mut result = Ok(());
        if regs::ctrl_error_code(status) == regs::CTRL_ERROR_UC_REGION_INVALID {
            log::error!("invalid setting for uncached region");
            result = Err(HfiError::HardwareFault);
        } else if !CtrlStatus::from_bits_truncate(status).contains(CtrlStatus::INIT_DONE) {
            log::error!("failed to boot firmware, status {:#x}", status);
            result = Err(HfiError::Timeout);
        }

        // Interrupts on before any command reaches the firmware
        self.regs.write(regs::CPU_CS_H2XSOFTINTEN, 0x1)?;
        self.regs.write(regs::CPU_CS_X2RPMH, 0x0)?;
        result
    }

    /// Reprogram protection thresholds lost across a GDSC collapse
    fn set_threshold_registers(&mut self) -> Result<()> {
        let Some(affected) = self.table.threshold_restore_version else {
            return Ok(());
        };
        let version = self.regs.read(regs::WRAPPER_HW_VERSION)? & !0xFFFF;
        if version == affected {
            if let Err(e) = self.secure.set_remote_state(RemoteState::RestoreThreshold) {
                log::error!("failed to restore threshold values: {}", e);
            }
        }
        Ok(())
    }

    // =========================================================================
    // SUSPEND / RESUME
    // =========================================================================

    fn suspend_hw(&mut self) -> Result<()> {
        if !self.regs.is_powered() {
            log::debug!("power already disabled");
            return Ok(());
        }
        log::debug!("entering suspend");

        if let Err(e) = self.secure.set_remote_state(RemoteState::Suspend) {
            log::warn!("failed to suspend firmware: {}", e);
            return Err(e.into());
        }
        self.disable_subcaches();
        self.power_off();
        Ok(())
    }

    /// Bring a collapsed core back, no-op when powered
    pub(crate) fn resume(&mut self) -> Result<()> {
        if !self.regs.is_powered() {
            if self.state != CoreState::Booted {
                log::debug!("resume on {:?} core", self.state);
                return Err(HfiError::InvalidState);
            }
            log::debug!("resuming from power collapse");
            if let Err(e) = self.resume_hw() {
                log::error!("failed to resume from power collapse: {}", e);
                self.sink.raise_fatal(FatalReason::ResumeFailed);
                return Err(HfiError::Fatal);
            }
            log::debug!("resumed from power collapse");
        }

        // A prepare-PC in flight keeps counting towards the escalation
        if self.last_packet != Some(CommandKind::SysPcPrep) {
            self.skip_pc_count = 0;
        }
        Ok(())
    }

    fn resume_hw(&mut self) -> Result<()> {
        self.power_on()?;

        let gdsc = self.regs.read(regs::CC_MVS1_GDSCR)?;
        let cbcr = self.regs.read(regs::CC_MVS1C_CBCR)?;
        log::debug!("resume gdsc {:#x} cbcr {:#x}", gdsc, cbcr);

        if let Err(e) = self.secure.set_remote_state(RemoteState::Resume) {
            log::error!("failed to resume firmware state: {}", e);
            self.power_off();
            return Err(e.into());
        }

        if let Some(mem) = self.memory.as_ref() {
            mem.program(&self.regs)?;
            let ops = self.ops;
            ops.setup_dsp_memmap(self)?;
        }

        if let Err(e) = self.boot_firmware() {
            log::error!("failed to reset firmware: {}", e);
            let _ = self.secure.set_remote_state(RemoteState::Suspend);
            self.power_off();
            return Err(e);
        }

        self.set_threshold_registers()?;
        if let Err(e) = self.sys_set_debug() {
            log::warn!("failed to set debug after resume: {}", e);
        }
        self.enable_subcaches();
        self.set_subcaches();

        if let Some(dsp) = self.dsp.as_mut() {
            if let Err(e) = dsp.resume() {
                log::warn!("dsp resume failed: {}", e);
            }
        }
        Ok(())
    }

    // =========================================================================
    // POWER COLLAPSE
    // =========================================================================

    /// Collapse power once the firmware agrees
    ///
    /// `Busy` while a session is running (unless `force`), `RetryLater` when
    /// the firmware is not ready yet.
    pub(crate) fn power_collapse(&mut self, force: bool) -> Result<()> {
        if !self.regs.is_powered() {
            log::debug!("power already disabled");
            return Ok(());
        }
        if self.state != CoreState::Booted {
            log::warn!("power collapse on {:?} core", self.state);
            return Err(HfiError::InvalidState);
        }
        if !force && self.sessions.any_unpaused() {
            log::debug!("sessions still running, not collapsing");
            return Err(HfiError::Busy);
        }

        if let Some(dsp) = self.dsp.as_mut() {
            match dsp.suspend(force) {
                Ok(()) => {}
                Err(HfiError::Busy) => return Err(HfiError::Busy),
                Err(e) => {
                    log::warn!("dsp suspend failed: {}", e);
                    return self.skip_power_off();
                }
            }
        }

        self.flush_debug_queue();

        match self.firmware_ready_for_pc() {
            Ok(true) => {}
            Ok(false) => return self.skip_power_off(),
            Err(e) => {
                log::warn!("power collapse check failed: {}", e);
                return self.skip_power_off();
            }
        }

        self.suspend_hw().map_err(|e| {
            log::error!("failed to suspend: {}", e);
            e
        })
    }

    fn firmware_ready_for_pc(&mut self) -> Result<bool> {
        let ctrl = CtrlStatus::from_bits_truncate(self.regs.read(regs::CTRL_STATUS)?);
        let wfi = || -> Result<bool> {
            Ok(CpuStatus::from_bits_truncate(self.regs.read(regs::WRAPPER_CPU_STATUS)?)
                .contains(CpuStatus::WFI))
        };

        if ctrl.contains(CtrlStatus::PC_READY) {
            if !wfi()? {
                log::warn!("firmware not in WFI");
                return Ok(false);
            }
            return Ok(true);
        }

        if !wfi()? {
            log::warn!("firmware not in WFI");
            return Ok(false);
        }
        if !ctrl.contains(CtrlStatus::IDLE) {
            log::warn!("firmware not idle");
            return Ok(false);
        }

        if let Err(e) = self.write_command(&HfiCommand::SysPcPrep) {
            log::warn!("failed to send prepare-pc: {}", e);
            return Ok(false);
        }

        let spec = self.config.poll.prepare_pc;
        for _ in 0..spec.tries {
            let cpu = CpuStatus::from_bits_truncate(self.regs.read(regs::WRAPPER_CPU_STATUS)?);
            let ctrl = CtrlStatus::from_bits_truncate(self.regs.read(regs::CTRL_STATUS)?);
            if cpu.contains(CpuStatus::WFI) && ctrl.contains(CtrlStatus::PC_READY) {
                return Ok(true);
            }
            self.delay.sleep_us(spec.sleep.min_us, spec.sleep.max_us);
        }
        log::error!("firmware not ready for power collapse after prepare-pc");
        Ok(false)
    }

    fn skip_power_off(&self) -> Result<()> {
        let read = |reg| self.regs.read(reg).unwrap_or(0);
        log::info!(
            "skip power collapse (cpu {:#x}, ctrl {:#x}, sideband {:#x})",
            read(regs::WRAPPER_CPU_STATUS),
            read(regs::CTRL_STATUS),
            read(regs::NOC_SBM_SENSELN0_LOW)
        );
        self.flush_debug_queue();
        Err(HfiError::RetryLater)
    }

    /// One run of the deferred power-collapse work
    pub(crate) fn pm_work(&mut self) -> PmOutcome {
        if self.skip_pc_count >= self.config.max_pc_skip_count {
            log::error!("failed to power collapse {} times", self.skip_pc_count);
            self.skip_pc_count = 0;
            self.sink.raise_fatal(FatalReason::PowerCollapseStuck);
            return PmOutcome::Escalated;
        }

        let force = self.dsp.as_ref().is_some_and(|d| d.is_suspended());
        match self.power_collapse(force) {
            Ok(()) => {
                self.skip_pc_count = 0;
                self.pm.cancel();
                PmOutcome::Collapsed
            }
            Err(HfiError::Busy) => {
                self.skip_pc_count = 0;
                self.pm.schedule(self.config.pc_delay_ms);
                PmOutcome::Rescheduled
            }
            Err(HfiError::RetryLater) => {
                self.skip_pc_count += 1;
                self.pm.schedule(self.config.pc_delay_ms);
                PmOutcome::Rescheduled
            }
            Err(e) => {
                log::error!("power collapse failed: {}", e);
                PmOutcome::Failed
            }
        }
    }

    // =========================================================================
    // CLOCKS
    // =========================================================================

    /// Scale the core clock, resuming first
    pub(crate) fn scale_clocks(&mut self, hz: u64) -> Result<()> {
        if let Err(e) = self.resume() {
            log::error!("resume from power collapse failed: {}", e);
            return Err(e);
        }
        self.resources.clocks.set_rate(hz)?;
        self.clock_rate = hz;
        Ok(())
    }

    // =========================================================================
    // SYSTEM CACHE
    // =========================================================================

    fn syscache_usable(&self) -> bool {
        self.config.syscache_enabled && self.resources.has_system_cache()
    }

    /// Activate every slice, dropping all of them if one fails
    pub(crate) fn enable_subcaches(&mut self) {
        if !self.syscache_usable() {
            return;
        }
        self.subcaches.reset(self.resources.cache_slices.len());

        let mut failed = false;
        for (i, slice) in self.resources.cache_slices.iter_mut().enumerate() {
            if let Err(e) = slice.activate() {
                log::warn!("failed to activate subcache {}: {}", slice.name(), e);
                failed = true;
                break;
            }
            log::debug!("activated subcache {}", slice.name());
            self.subcaches.active[i] = true;
        }
        if failed {
            self.release_subcaches();
            self.disable_subcaches();
        }
    }

    /// Advertise the active slices to the firmware, once
    pub(crate) fn set_subcaches(&mut self) {
        if self.subcaches.res_set || !self.config.syscache_enabled {
            log::debug!("subcaches already set or disabled");
            return;
        }

        let entries: Vec<SubcacheEntry> = self
            .resources
            .cache_slices
            .iter()
            .zip(self.subcaches.active.iter())
            .filter(|(_, &active)| active)
            .map(|(s, _)| SubcacheEntry {
                slice_id: s.slice_id(),
                size: s.size(),
            })
            .collect();
        if entries.is_empty() {
            return;
        }

        if let Err(e) = self.write_command(&HfiCommand::SysSetResource(&entries)) {
            log::warn!("failed to set subcaches: {}", e);
            self.disable_subcaches();
            return;
        }
        for (set, &active) in self.subcaches.set.iter_mut().zip(self.subcaches.active.iter()) {
            *set = active;
        }
        self.subcaches.res_set = true;
        log::debug!("set {} subcaches", entries.len());
    }

    /// Take the advertised slices back from the firmware
    pub(crate) fn release_subcaches(&mut self) {
        if !self.syscache_usable() {
            return;
        }

        let mut entries = Vec::new();
        for (slice, set) in self
            .resources
            .cache_slices
            .iter()
            .zip(self.subcaches.set.iter_mut())
            .rev()
        {
            if *set {
                entries.push(SubcacheEntry {
                    slice_id: slice.slice_id(),
                    size: slice.size(),
                });
                *set = false;
            }
        }

        if !entries.is_empty() {
            log::debug!("releasing {} subcaches", entries.len());
            if let Err(e) = self.write_command(&HfiCommand::SysReleaseResource(&entries)) {
                log::warn!("failed to release {} subcaches: {}", entries.len(), e);
            }
        }
        self.subcaches.res_set = false;
    }

    /// Deactivate every active slice
    pub(crate) fn disable_subcaches(&mut self) {
        if !self.syscache_usable() {
            return;
        }

        for (slice, active) in self
            .resources
            .cache_slices
            .iter_mut()
            .zip(self.subcaches.active.iter_mut())
            .rev()
        {
            if *active {
                log::debug!("deactivate subcache {}", slice.name());
                if let Err(e) = slice.deactivate() {
                    log::warn!("failed to deactivate {}: {}", slice.name(), e);
                }
                *active = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRig;
    use cvp_hal::regs::IntrStatus;

    #[test]
    fn test_power_on_order() {
        let rig = TestRig::new();
        let mut core = rig.core();
        core.power_on().unwrap();

        assert!(core.regs.is_powered());
        assert_eq!(
            rig.resources.log(),
            alloc::vec![
                "bus:ddr=1000",
                "enable:cvp",
                "reset:bridge",
                "deassert:bridge",
                "clk_on:gcc_video_axi1",
                "clk_on:cvp_clk",
                "enable:cvp-core",
                "clk_on:video_cc_mvs1_clk_src",
                "clk_on:core_clk",
            ]
        );
        assert_eq!(rig.hw.get(regs::WRAPPER_DEBUG_BRIDGE_LPI_CONTROL), 0x7);
        assert_eq!(rig.hw.get(regs::NOC_SAFELUT_LOW), 0xFFFF_FFFF);
        let mask = rig.hw.get(regs::WRAPPER_INTR_MASK);
        assert_eq!(mask & (IntrStatus::FATAL | IntrStatus::A2HCPU).bits(), 0);
        assert!(rig.irq.is_enabled());
    }

    #[test]
    fn test_core_failure_unwinds_without_registers() {
        let rig = TestRig::new();
        rig.resources.fail_enable("cvp-core");
        let mut core = rig.core();
        assert!(core.power_on().is_err());

        assert!(!core.regs.is_powered());
        assert!(rig.sink.fatals().is_empty());
        let log = rig.resources.log();
        assert!(log.ends_with(&[
            "clk_off:cvp_clk".into(),
            "clk_off:gcc_video_axi1".into(),
            "reset:bridge".into(),
            "deassert:bridge".into(),
            "disable:cvp".into(),
            "bus:ddr=0".into(),
        ]));
    }

    #[test]
    fn test_power_off_sequence() {
        let rig = TestRig::new();
        let mut core = rig.core();
        core.power_on().unwrap();
        rig.hw.set(regs::CC_MVS1_GDSCR, regs::GDSC_POWER_ON);
        rig.resources.clear_log();

        core.power_off();

        assert!(!core.regs.is_powered());
        assert!(!rig.irq.is_enabled());
        assert_eq!(rig.hw.get(regs::AHB_BRIDGE_SYNC_RESET), 0);
        assert_eq!(rig.hw.get(regs::NOC_RESET_REQ), 0);
        assert_eq!(rig.hw.get(regs::CPU_CS_X2RPMH), 0x3);
        assert_eq!(
            rig.resources.log(),
            alloc::vec![
                "disable:cvp-core",
                "clk_off:core_clk",
                "clk_off:video_cc_mvs1_clk_src",
                "clk_off:cvp_clk",
                "clk_off:gcc_video_axi1",
                "reset:bridge",
                "deassert:bridge",
                "disable:cvp",
                "bus:ddr=0",
            ]
        );
    }

    #[test]
    fn test_watchdog_keeps_irq_masked_state() {
        let rig = TestRig::new();
        let mut core = rig.core();
        core.power_on().unwrap();
        core.intr_status = IntrStatus::A2HWD.bits();
        core.power_off();
        // Line left as is, the watchdog path already masked it
        assert!(rig.irq.is_enabled());
        assert_eq!(core.intr_status, 0);
    }

    #[test]
    fn test_boot_reports_uc_region_error() {
        let rig = TestRig::new();
        rig.hw.set_boot_status(regs::CTRL_ERROR_UC_REGION_INVALID);
        let mut core = rig.core();
        core.power_on().unwrap();
        assert_eq!(core.boot_firmware(), Err(HfiError::HardwareFault));
        assert_eq!(rig.hw.get(regs::CPU_CS_H2XSOFTINTEN), 1);
    }

    #[test]
    fn test_boot_timeout() {
        let rig = TestRig::new();
        rig.hw.set_boot_status(0);
        let mut core = rig.core();
        core.power_on().unwrap();
        assert_eq!(core.boot_firmware(), Err(HfiError::Timeout));
        assert_eq!(rig.hw.reads_of(regs::CTRL_STATUS), 1000);
    }

    #[test]
    fn test_kalama_pdx_fifo_reset() {
        let rig = TestRig::with_variant(cvp_hal::SocVariant::Kalama);
        let mut core = rig.core();
        core.power_on().unwrap();
        core.power_off();
        assert!(rig.hw.writes_of(regs::WRAPPER_QNS4PDXFIFO_RESET) >= 2);

        let rig = TestRig::new();
        let mut core = rig.core();
        core.power_on().unwrap();
        core.power_off();
        assert_eq!(rig.hw.writes_of(regs::WRAPPER_QNS4PDXFIFO_RESET), 0);
    }

    #[test]
    fn test_hand_off_rolls_back() {
        let rig = TestRig::new();
        rig.resources.set_hw_collapse("cvp", true);
        rig.resources.set_hw_collapse("cvp-core", true);
        rig.resources.fail_hand_off("cvp-core");
        let mut core = rig.core();
        core.config.fw_low_power_mode = true;
        assert!(core.hand_off_regulators().is_err());
        assert!(rig.resources.log().contains(&"hw:cvp=true".into()));
        assert!(rig.resources.log().contains(&"hw:cvp=false".into()));
    }
}
