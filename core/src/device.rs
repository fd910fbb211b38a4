//! # Device Facade
//!
//! [`HfiDevice`] is the one object upper layers talk to. Every operation
//! takes the device-wide lock, resumes the core if it was power-collapsed
//! and then touches registers or queues.
//!
//! ## Life Cycle
//!
//! ```text
//!   Uninitialized ──core_init──► Booted ──core_release──► Deinitialized
//!                                  ▲                            │
//!                                  └──────────core_init─────────┘
//! ```
//!
//! Power is a separate axis: a `Booted` core may be collapsed at any time
//! by the idle timer and is brought back transparently by the next
//! command.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cvp_hal::regs;
use cvp_hal::{
    Delay, DmaAllocator, FirmwareLoader, IrqLine, PowerResources, RegisterIo, SecureMonitor,
    VariantTable,
};
use spin::{Mutex, RwLock};

use crate::config::HfiConfig;
use crate::dispatch::{EventSink, SinkSlot};
use crate::dsp::DspLink;
use crate::hw::Registers;
use crate::packet::{CommandKind, HfiCommand, PacketBuilder, SsrKind};
use crate::pm::{PmOutcome, PmSchedule};
use crate::power::SubcacheState;
use crate::queue::{InterfaceMemory, QueueRole, TraceRange};
use crate::session::{SessionHandle, SessionRegistry};
use crate::variant::{self, VariantOps};
use crate::{HfiError, Result};

pub use crate::power::BusVote;

/// Longest firmware version string reported
pub const FW_VERSION_LEN: usize = 128;

/// Protocol state of the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    /// Never initialized
    Uninitialized,
    /// Firmware booted, queue traffic allowed
    Booted,
    /// Released, queues gone
    Deinitialized,
}

/// Firmware and platform identification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    /// Image version string, empty when the image carries none
    pub version: heapless::String<FW_VERSION_LEN>,
    /// Address the image was loaded at
    pub firmware_base: u64,
    /// Register window base
    pub register_base: u64,
    /// Register window size
    pub register_size: u32,
    /// Interrupt number
    pub irq: u32,
}

/// Snapshot of the NOC error loggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NocErrorLog {
    /// Controller logger, in [`regs::NOC_ERR_LOGGER_REGS`] order
    pub controller: [u32; 13],
    /// Core logger, same order
    pub core: [u32; 13],
}

const NOC_MASTER_NAMES: [&str; 16] = [
    "CVP_FW",
    "ARP_DATA",
    "CVP_OD_NON_PIXEL",
    "CVP_OD_ORIG_PIXEL",
    "CVP_OD_WR_PIXEL",
    "CVP_MPU_ORIG_PIXEL",
    "CVP_MPU_REF_PIXEL",
    "CVP_MPU_NON_PIXEL",
    "CVP_MPU_DFS",
    "CVP_FDU_NON_PIXEL",
    "CVP_FDU_PIXEL",
    "CVP_ICA_PIXEL",
    "Invalid",
    "Invalid",
    "Invalid",
    "Invalid",
];

impl NocErrorLog {
    const ERRLOG3_LOW: usize = 11;

    /// Core `ERRLOG3_LOW`, the one naming the faulting client
    pub fn core_errlog3_low(&self) -> u32 {
        self.core[Self::ERRLOG3_LOW]
    }

    /// Master id field of an `ERRLOG3_LOW` value
    pub const fn master_id(errlog3: u32) -> u32 {
        (errlog3 >> 5) & 0xF
    }

    /// Sub id field of an `ERRLOG3_LOW` value
    pub const fn sub_id(errlog3: u32) -> u32 {
        (errlog3 >> 2) & 0x7
    }

    /// Name of the client that faulted
    pub fn master_name(&self) -> &'static str {
        NOC_MASTER_NAMES[Self::master_id(self.core_errlog3_low()) as usize]
    }
}

/// Everything the core needs from the platform
pub struct Platform {
    /// Register window
    pub registers: Box<dyn RegisterIo>,
    /// Regulators, clocks, buses, cache slices and reset lines
    pub resources: PowerResources,
    /// Firmware image loader
    pub loader: Box<dyn FirmwareLoader>,
    /// Secure monitor
    pub secure: Box<dyn SecureMonitor>,
    /// Device-visible memory
    pub allocator: Box<dyn DmaAllocator>,
    /// Wire encoding of commands and responses
    pub packets: Box<dyn PacketBuilder>,
    /// Host interrupt line
    pub irq: Arc<dyn IrqLine>,
    /// Sleep source for hardware polls
    pub delay: Box<dyn Delay>,
    /// DSP control channel, when the DSP consumes the queues
    pub dsp: Option<Box<dyn DspLink>>,
    /// Address ranges mapped for QDSS tracing
    pub trace_ranges: Vec<TraceRange>,
    /// Tag written into the queue table owner field
    pub owner_tag: u64,
    /// Register window base, reported in [`FirmwareInfo`]
    pub register_base: u64,
    /// Register window size, reported in [`FirmwareInfo`]
    pub register_size: u32,
}

impl core::fmt::Debug for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Platform")
            .field("resources", &self.resources)
            .field("dsp", &self.dsp.is_some())
            .field("register_base", &self.register_base)
            .finish()
    }
}

// =============================================================================
// CORE (state behind the device lock)
// =============================================================================

pub(crate) struct HfiCore {
    pub(crate) config: HfiConfig,
    pub(crate) table: &'static VariantTable,
    pub(crate) ops: &'static dyn VariantOps,
    pub(crate) regs: Registers,
    pub(crate) resources: PowerResources,
    pub(crate) loader: Box<dyn FirmwareLoader>,
    pub(crate) secure: Box<dyn SecureMonitor>,
    pub(crate) allocator: Box<dyn DmaAllocator>,
    pub(crate) packets: Box<dyn PacketBuilder>,
    pub(crate) dsp: Option<Box<dyn DspLink>>,
    pub(crate) irq: Arc<dyn IrqLine>,
    pub(crate) delay: Box<dyn Delay>,
    pub(crate) sink: SinkSlot,
    pub(crate) pm: Arc<PmSchedule>,
    trace_ranges: Vec<TraceRange>,
    owner_tag: u64,
    register_base: u64,
    register_size: u32,

    pub(crate) state: CoreState,
    pub(crate) memory: Option<InterfaceMemory>,
    pub(crate) sessions: SessionRegistry,
    pub(crate) intr_status: u32,
    pub(crate) reg_count: u32,
    pub(crate) spur_count: u32,
    pub(crate) skip_pc_count: u32,
    pub(crate) last_packet: Option<CommandKind>,
    pub(crate) subcaches: SubcacheState,
    pub(crate) bus_votes: Vec<BusVote>,
    pub(crate) clock_rate: u64,
    fw_version: u32,
    resources_held: bool,
    fw_loaded: bool,
    noc_logged: bool,
    csr_dumped: bool,
}

impl HfiCore {
    pub(crate) fn new(
        config: HfiConfig,
        platform: Platform,
        sink: SinkSlot,
        pm: Arc<PmSchedule>,
    ) -> Result<Self> {
        config.validate()?;
        let table = config.variant.table();
        let ops = variant::ops_for(config.variant);
        log::debug!("hfi core for {} ({})", table.name, ops.name());

        Ok(Self {
            regs: Registers::new(platform.registers, sink.clone()),
            table,
            ops,
            resources: platform.resources,
            loader: platform.loader,
            secure: platform.secure,
            allocator: platform.allocator,
            packets: platform.packets,
            dsp: platform.dsp,
            irq: platform.irq,
            delay: platform.delay,
            sink,
            pm,
            trace_ranges: platform.trace_ranges,
            owner_tag: platform.owner_tag,
            register_base: platform.register_base,
            register_size: platform.register_size,
            state: CoreState::Uninitialized,
            memory: None,
            sessions: SessionRegistry::new(config.max_sessions),
            intr_status: 0,
            reg_count: 0,
            spur_count: 0,
            skip_pc_count: 0,
            last_packet: None,
            subcaches: SubcacheState::default(),
            bus_votes: Vec::new(),
            clock_rate: config.clock_rate_hz,
            fw_version: 0,
            resources_held: false,
            fw_loaded: false,
            noc_logged: false,
            csr_dumped: false,
            config,
        })
    }

    /// Encode `command` and put it on the command queue
    ///
    /// Resumes a collapsed core first, re-arms the idle timer and rings the
    /// doorbell when the firmware asked for one.
    pub(crate) fn write_command(&mut self, command: &HfiCommand<'_>) -> Result<()> {
        if self.state != CoreState::Booted {
            log::debug!("{:?} on {:?} core", command.kind(), self.state);
            return Err(HfiError::InvalidState);
        }
        let packet = self.packets.build(command).map_err(|e| {
            log::error!("failed to build {:?}: {}", command.kind(), e);
            e
        })?;

        self.last_packet = Some(command.kind());
        if let Err(e) = self.resume() {
            log::error!("failed to resume before {:?}: {}", command.kind(), e);
            return Err(e);
        }

        let mem = self.memory.as_ref().ok_or(HfiError::InvalidState)?;
        let needs_doorbell = match mem.queue(QueueRole::Command).write(&packet) {
            Ok(doorbell) => doorbell,
            Err(e) => {
                log::error!("command queue write failed: {}", e);
                return Err(e);
            }
        };

        if self.config.sw_power_collapsible {
            self.pm.schedule(self.config.pc_delay_ms);
        }
        if needs_doorbell {
            self.regs.write(regs::CPU_CS_H2ASOFTINT, 1)?;
        }
        Ok(())
    }

    /// Push the configured firmware debug level and mode
    pub(crate) fn sys_set_debug(&mut self) -> Result<()> {
        self.write_command(&HfiCommand::SysSetDebug {
            level: self.config.fw_debug_level,
            mode: self.config.fw_debug_mode,
        })
    }

    fn load_fw(&mut self) -> Result<()> {
        if let Err(e) = self.resources.acquire() {
            log::error!("failed to init resources: {}", e);
            return Err(e.into());
        }
        self.resources_held = true;

        if let Err(e) = self.power_on() {
            log::error!("failed to power on: {}", e);
            self.unload_fw();
            return Err(e);
        }

        if let Err(e) = self.loader.load() {
            log::error!("failed to load firmware: {}", e);
            self.unload_fw();
            return Err(e.into());
        }
        self.fw_loaded = true;
        Ok(())
    }

    fn unload_fw(&mut self) {
        self.pm.cancel();
        if self.fw_loaded {
            self.loader.unload();
            self.fw_loaded = false;
        }
        if let Some(mem) = self.memory.take() {
            mem.release(self.allocator.as_mut());
        }
        self.power_off();
        if self.resources_held {
            self.resources.release();
            self.resources_held = false;
        }
    }

    fn core_init(&mut self) -> Result<()> {
        if self.state == CoreState::Booted {
            log::warn!("core already initialized");
            return Err(HfiError::AlreadyInitialized);
        }
        log::info!("core initializing");

        self.bus_votes.clear();
        self.load_fw()?;

        self.state = CoreState::Booted;
        self.intr_status = 0;
        self.skip_pc_count = 0;
        self.last_packet = None;
        self.noc_logged = false;
        self.csr_dumped = false;

        if let Err(e) = self.boot_interface() {
            log::error!("core init failed: {}", e);
            self.state = CoreState::Deinitialized;
            self.unload_fw();
            return Err(e);
        }

        self.post_boot_properties();
        log::info!("core initialized, firmware version {:#x}", self.fw_version);
        Ok(())
    }

    fn boot_interface(&mut self) -> Result<()> {
        let mem = InterfaceMemory::allocate(
            self.allocator.as_mut(),
            &self.config,
            &self.trace_ranges,
            self.owner_tag,
        )?;
        let programmed = mem.program(&self.regs);
        self.memory = Some(mem);
        programmed?;
        let ops = self.ops;
        ops.setup_dsp_memmap(self)?;

        self.boot_firmware()?;
        self.fw_version = self.regs.read(regs::VERSION_INFO)?;
        log::debug!("firmware version {:#x}", self.fw_version);

        self.write_command(&HfiCommand::SysInit)
    }

    fn post_boot_properties(&mut self) {
        if let Err(e) = self.write_command(&HfiCommand::SysImageVersion) {
            log::warn!("failed to request image version: {}", e);
        }
        if let Err(e) = self.sys_set_debug() {
            log::warn!("failed to set debug: {}", e);
        }

        self.enable_subcaches();
        self.set_subcaches();

        if let Some(ubwc) = self.config.ubwc {
            if let Err(e) = self.write_command(&HfiCommand::SysSetUbwcConfig(ubwc)) {
                log::warn!("ubwc config setting to firmware failed: {}", e);
            }
        }
        if self.config.idle_indicator {
            if let Err(e) = self.write_command(&HfiCommand::SysSetIdleIndicator(true)) {
                log::warn!("failed to set idle indicator: {}", e);
            }
        }

        let table = self.memory.as_ref().and_then(|m| m.dsp.as_ref());
        if let (Some(dsp), Some(table)) = (self.dsp.as_mut(), table) {
            if let Err(e) = dsp.send_queues(table) {
                log::warn!("failed to send queues to dsp: {}", e);
            }
        }
    }

    fn core_release(&mut self) {
        log::info!("core releasing");
        let _ = self.resume();
        self.state = CoreState::Deinitialized;

        if let Some(dsp) = self.dsp.as_mut() {
            dsp.shutdown();
        }
        self.disable_subcaches();
        self.unload_fw();

        let dropped = self.sessions.clear();
        if dropped > 0 {
            log::debug!("unlinked {} sessions", dropped);
        }
        log::info!("core released");
    }

    /// Send a command for a live session
    fn session_command(
        &mut self,
        handle: SessionHandle,
        command: impl FnOnce(u32) -> HfiCommand<'static>,
    ) -> Result<()> {
        if !self.sessions.validate(handle) {
            log::error!("invalid session {:#x}", handle.wire_id());
            return Err(HfiError::SessionInvalid);
        }
        self.write_command(&command(handle.wire_id()))
    }

    fn dump_csr(&mut self) -> Result<()> {
        if self.csr_dumped {
            return Ok(());
        }
        let dump = [
            ("CPU_STATUS", regs::WRAPPER_CPU_STATUS),
            ("CTRL_STATUS", regs::CTRL_STATUS),
            ("CPU_CLOCK_CONFIG", regs::WRAPPER_CPU_CLOCK_CONFIG),
            ("CORE_CLOCK_CONFIG", regs::WRAPPER_CORE_CLOCK_CONFIG),
            ("INTR_STATUS", regs::WRAPPER_INTR_STATUS),
            ("H2ASOFTINT", regs::CPU_CS_H2ASOFTINT),
            ("MVS1_GDSCR", regs::CC_MVS1_GDSCR),
            ("MVS1C_CBCR", regs::CC_MVS1C_CBCR),
        ];
        for (name, reg) in dump {
            log::error!("{}: {:#x}", name, self.regs.read(reg)?);
        }
        self.csr_dumped = true;
        Ok(())
    }

    fn fw_info(&self) -> FirmwareInfo {
        let mut version = heapless::String::new();
        let text = self
            .loader
            .version_region()
            .and_then(|raw| raw.iter().position(|&b| b == b'V').map(|start| &raw[start..]))
            .map(|raw| match raw.iter().position(|&b| b == 0) {
                Some(nul) => &raw[..nul],
                None => raw,
            });
        match text.map(core::str::from_utf8) {
            Some(Ok(s)) => {
                for c in s.chars() {
                    if version.push(c).is_err() {
                        break;
                    }
                }
            }
            _ => log::warn!("firmware version string is not proper"),
        }
        log::debug!("firmware version retrieved: {}", version);

        FirmwareInfo {
            version,
            firmware_base: self.loader.firmware_base(),
            register_base: self.register_base,
            register_size: self.register_size,
            irq: self.irq.number(),
        }
    }
}

// =============================================================================
// DEVICE FACADE
// =============================================================================

type InterruptNotifier = Box<dyn Fn() + Send + Sync>;

/// Host-side handle to one CVP core
pub struct HfiDevice {
    core: Mutex<HfiCore>,
    irq: Arc<dyn IrqLine>,
    sink: SinkSlot,
    pm: Arc<PmSchedule>,
    notifier: RwLock<Option<InterruptNotifier>>,
}

impl core::fmt::Debug for HfiDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HfiDevice")
            .field("pm", &self.pm)
            .finish_non_exhaustive()
    }
}

impl HfiDevice {
    /// Build a device from its configuration and platform capabilities
    ///
    /// Nothing is powered or allocated until [`HfiDevice::core_init`].
    pub fn new(config: HfiConfig, platform: Platform) -> Result<Self> {
        let sink = SinkSlot::default();
        let pm = Arc::new(PmSchedule::new());
        let irq = platform.irq.clone();
        let core = HfiCore::new(config, platform, sink.clone(), pm.clone())?;
        Ok(Self {
            core: Mutex::new(core),
            irq,
            sink,
            pm,
            notifier: RwLock::new(None),
        })
    }

    /// Install the receiver of firmware events and fatal errors
    pub fn register_callback(&self, sink: Arc<dyn EventSink>) {
        self.sink.set(sink);
    }

    /// Power up, load and boot the firmware
    pub fn core_init(&self) -> Result<()> {
        self.core.lock().core_init()
    }

    /// Tear the core down, dropping every session
    pub fn core_release(&self) -> Result<()> {
        self.core.lock().core_release();
        Ok(())
    }

    /// Ask the firmware to crash itself
    ///
    /// Never waits for the device lock.
    pub fn core_trigger_ssr(&self, kind: SsrKind) -> Result<()> {
        let Some(mut core) = self.core.try_lock() else {
            log::warn!("device busy, not triggering {:?}", kind);
            return Err(HfiError::Busy);
        };
        core.write_command(&HfiCommand::SysTestSsr(kind))
    }

    /// Current protocol state
    pub fn state(&self) -> CoreState {
        self.core.lock().state
    }

    /// Whether the core is powered right now
    pub fn is_powered(&self) -> bool {
        self.core.lock().regs.is_powered()
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Open a session
    ///
    /// `cookie` is echoed in every event for the session.
    pub fn session_init(&self, session_type: u32, cookie: u64) -> Result<SessionHandle> {
        let mut core = self.core.lock();
        if core.state != CoreState::Booted {
            return Err(HfiError::InvalidState);
        }
        let handle = core.sessions.create(session_type, cookie)?;
        log::debug!("session init {:#x} type {}", handle.wire_id(), session_type);

        if let Err(e) = core.sys_set_debug() {
            log::warn!("failed to set debug before session init: {}", e);
        }
        let init = HfiCommand::SessionInit {
            session_id: handle.wire_id(),
            session_type,
        };
        if let Err(e) = core.write_command(&init) {
            log::error!("session init failed: {}", e);
            core.sessions.destroy(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Close a session gracefully
    ///
    /// The session stays registered until [`HfiDevice::session_clean`] so
    /// the end-done response can still be routed.
    pub fn session_end(&self, session: SessionHandle) -> Result<()> {
        self.core
            .lock()
            .session_command(session, |session_id| HfiCommand::SessionEnd { session_id })
    }

    /// Abort a session
    pub fn session_abort(&self, session: SessionHandle) -> Result<()> {
        let mut core = self.core.lock();
        core.session_command(session, |session_id| HfiCommand::SessionAbort { session_id })?;
        core.flush_debug_queue();
        Ok(())
    }

    /// Forget a session, idempotent
    pub fn session_clean(&self, session: SessionHandle) -> Result<()> {
        if self.core.lock().sessions.destroy(session).is_some() {
            log::debug!("session clean {:#x}", session.wire_id());
        }
        Ok(())
    }

    /// Register a buffer with the firmware
    pub fn session_set_buffers(&self, session: SessionHandle, iova: u32, size: u32) -> Result<()> {
        if iova == 0 || size == 0 {
            log::error!("invalid buffer {:#x}+{:#x}", iova, size);
            return Err(HfiError::InvalidArgument);
        }
        self.core.lock().session_command(session, |session_id| {
            HfiCommand::SessionSetBuffers {
                session_id,
                iova,
                size,
            }
        })
    }

    /// Drop the session buffers
    pub fn session_release_buffers(&self, session: SessionHandle) -> Result<()> {
        self.core.lock().session_command(session, |session_id| {
            HfiCommand::SessionReleaseBuffers { session_id }
        })
    }

    /// Flush in-flight work of a session
    pub fn session_flush(&self, session: SessionHandle, flags: u32) -> Result<()> {
        self.core.lock().session_command(session, |session_id| {
            HfiCommand::SessionFlush { session_id, flags }
        })
    }

    /// Forward a caller-built packet body
    pub fn session_send(&self, session: SessionHandle, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(HfiError::InvalidArgument);
        }
        let mut core = self.core.lock();
        if !core.sessions.validate(session) {
            log::error!("invalid session {:#x}", session.wire_id());
            return Err(HfiError::SessionInvalid);
        }
        core.write_command(&HfiCommand::SessionSend {
            session_id: session.wire_id(),
            payload,
        })
    }

    /// Set the pause flag consulted by power collapse
    pub fn set_session_paused(&self, session: SessionHandle, paused: bool) -> Result<()> {
        self.core.lock().sessions.set_paused(session, paused)
    }

    /// Whether `session` is still live
    pub fn validate_session(&self, session: SessionHandle) -> bool {
        self.core.lock().sessions.validate(session)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.core.lock().sessions.len()
    }

    // -------------------------------------------------------------------------
    // Power
    // -------------------------------------------------------------------------

    /// Set the core clock rate
    pub fn scale_clocks(&self, hz: u64) -> Result<()> {
        self.core.lock().scale_clocks(hz)
    }

    /// Replace the cached bandwidth votes and apply them
    pub fn vote_buses(&self, votes: &[BusVote]) -> Result<()> {
        self.core.lock().vote_buses(votes)
    }

    /// Force a power collapse regardless of running sessions
    pub fn suspend(&self) -> Result<()> {
        let mut core = self.core.lock();
        if !core.config.sw_power_collapsible {
            return Err(HfiError::NotSupported);
        }
        log::debug!("suspending");
        if let Err(e) = core.power_collapse(true) {
            log::warn!("core is busy: {}", e);
            return Err(HfiError::Busy);
        }
        drop(core);
        self.pm.cancel();
        Ok(())
    }

    /// Bring a collapsed core back
    ///
    /// Restarts the idle timer, or drops it when software power collapse
    /// is off.
    pub fn resume(&self) -> Result<()> {
        log::debug!("resuming");
        let mut core = self.core.lock();
        core.resume()?;
        if core.config.sw_power_collapsible {
            self.pm.schedule(core.config.pc_delay_ms);
        } else {
            self.pm.cancel();
        }
        Ok(())
    }

    /// Run one deferred power-collapse attempt
    pub fn pm_work(&self) -> PmOutcome {
        self.core.lock().pm_work()
    }

    /// Idle timer shared with the worker thread
    pub fn pm_schedule(&self) -> &Arc<PmSchedule> {
        &self.pm
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Dump status registers once and drain the firmware log
    pub fn flush_debug_queue(&self) -> Result<usize> {
        let mut core = self.core.lock();
        if !core.regs.is_powered() {
            log::warn!("cvp power off, not flushing debug queue");
            return Err(HfiError::InvalidState);
        }
        core.dump_csr()?;
        Ok(core.flush_debug_queue())
    }

    /// Firmware version and platform identification
    pub fn get_fw_info(&self) -> Result<FirmwareInfo> {
        Ok(self.core.lock().fw_info())
    }

    /// Capability query, accepted without contacting the firmware
    pub fn get_core_capabilities(&self) -> Result<()> {
        log::debug!("core capability query not supported yet");
        Ok(())
    }

    /// Dump the NOC error loggers, once per boot
    ///
    /// Returns `None` when this boot was already logged.
    pub fn noc_error_info(&self) -> Result<Option<NocErrorLog>> {
        let mut core = self.core.lock();
        log::error!("noc error information");
        if core.noc_logged {
            log::warn!("data already in NOC log, skip logging");
            return Ok(None);
        }
        core.noc_logged = true;
        let ops = core.ops;
        ops.noc_error_info(&core).map(Some)
    }

    // -------------------------------------------------------------------------
    // Interrupts
    // -------------------------------------------------------------------------

    /// Install the hook [`HfiDevice::isr`] calls to wake the bottom half
    pub fn set_interrupt_notifier(&self, notifier: InterruptNotifier) {
        *self.notifier.write() = Some(notifier);
    }

    /// Remove the interrupt hook
    pub fn clear_interrupt_notifier(&self) {
        *self.notifier.write() = None;
    }

    /// Top half: mask the line and wake the bottom half
    ///
    /// Does not take the device lock.
    pub fn isr(&self) {
        self.irq.disable_nosync();
        if let Some(notify) = self.notifier.read().as_ref() {
            notify();
        }
    }

    /// Bottom half: drain responses and deliver them
    ///
    /// Returns the number of events delivered. The line is unmasked again
    /// unless the firmware watchdog fired.
    pub fn process_interrupt(&self) -> usize {
        let (events, intr_status) = {
            let mut core = self.core.lock();
            let events = self.collect_events(&mut core);
            (events, core.intr_status)
        };

        let mut delivered = 0;
        if let Some(sink) = self.sink.get() {
            let total = events.len();
            for event in events {
                let state = self.core.lock().state;
                if state != CoreState::Booted {
                    log::warn!("core {:?}, ignoring responses {} to {}", state, delivered, total);
                    break;
                }
                sink.on_event(event);
                delivered += 1;
            }
        }

        if !regs::IntrStatus::from_bits_truncate(intr_status).contains(regs::IntrStatus::A2HWD) {
            self.irq.enable();
        }
        delivered
    }

    fn collect_events(&self, core: &mut HfiCore) -> Vec<crate::HfiEvent> {
        if core.state != CoreState::Booted {
            log::warn!("core not in init state");
            return Vec::new();
        }
        if self.sink.get().is_none() {
            log::error!("no interrupt callback");
            return Vec::new();
        }
        if core.resume().is_err() {
            log::error!("resume failed");
            return Vec::new();
        }
        if let Err(e) = core.clear_interrupt() {
            log::error!("failed to clear interrupt: {}", e);
            return Vec::new();
        }
        core.drain_responses()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{FatalReason, HfiEvent};
    use crate::packet::ResponseKind;
    use crate::testing::TestRig;
    use cvp_hal::regs::{CtrlStatus, IntrStatus};

    fn booted(rig: &TestRig) -> HfiDevice {
        let dev = rig.device();
        dev.core_init().unwrap();
        dev
    }

    #[test]
    fn test_core_init_boots_and_sends_sys_init() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        assert_eq!(dev.state(), CoreState::Booted);
        assert!(dev.is_powered());

        let fw = rig.firmware();
        let kinds = fw.take_commands();
        assert_eq!(kinds[0].0, CommandKind::SysInit);
        assert_eq!(kinds[1].0, CommandKind::SysImageVersion);
        assert!(kinds.iter().any(|k| k.0 == CommandKind::SysSetDebug));
        assert_eq!(kinds.last().map(|k| k.0), Some(CommandKind::SysSetIdleIndicator));
        assert_eq!(rig.hw.get(regs::QTBL_INFO), regs::QTBL_ENABLE);
        assert_eq!(rig.loader.loads(), 1);
    }

    #[test]
    fn test_double_core_init_rejected() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let enables = rig.resources.count("enable:cvp");
        assert_eq!(dev.core_init(), Err(HfiError::AlreadyInitialized));
        assert_eq!(rig.resources.count("enable:cvp"), enables);
        assert_eq!(rig.loader.loads(), 1);
        assert_eq!(rig.allocator.outstanding(), 2);
    }

    #[test]
    fn test_boot_failure_unwinds() {
        let rig = TestRig::new();
        rig.hw.set_boot_status(0);
        let dev = rig.device();
        assert_eq!(dev.core_init(), Err(HfiError::Timeout));
        assert_eq!(dev.state(), CoreState::Deinitialized);
        assert!(!dev.is_powered());
        assert_eq!(rig.allocator.outstanding(), 0);
        assert_eq!(rig.loader.unloads(), 1);

        // A later attempt may succeed
        rig.hw.set_boot_status(CtrlStatus::INIT_DONE.bits());
        dev.core_init().unwrap();
    }

    #[test]
    fn test_release_drops_sessions() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let s = dev.session_init(1, 7).unwrap();
        dev.core_release().unwrap();

        assert_eq!(dev.state(), CoreState::Deinitialized);
        assert!(!dev.validate_session(s));
        assert!(!dev.is_powered());
        assert_eq!(rig.allocator.outstanding(), 0);
        assert_eq!(dev.session_end(s), Err(HfiError::SessionInvalid));
    }

    #[test]
    fn test_session_lifecycle() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let fw = rig.firmware();
        fw.take_commands();

        let s = dev.session_init(3, 0x55).unwrap();
        let cmds = fw.take_commands();
        assert_eq!(cmds.last(), Some(&(CommandKind::SessionInit, s.wire_id())));

        dev.session_set_buffers(s, 0x1000, 0x2000).unwrap();
        assert_eq!(dev.session_set_buffers(s, 0, 0x10), Err(HfiError::InvalidArgument));
        dev.session_send(s, &[1, 2, 3, 4]).unwrap();
        dev.session_flush(s, 0).unwrap();
        dev.session_release_buffers(s).unwrap();
        dev.session_end(s).unwrap();
        assert!(dev.validate_session(s));

        dev.session_clean(s).unwrap();
        assert!(!dev.validate_session(s));
        dev.session_clean(s).unwrap();
        assert_eq!(dev.session_send(s, &[0; 4]), Err(HfiError::SessionInvalid));

        let kinds: Vec<_> = fw.take_commands().into_iter().map(|c| c.0).collect();
        assert_eq!(
            kinds,
            alloc::vec![
                CommandKind::SessionSetBuffers,
                CommandKind::SessionSend,
                CommandKind::SessionFlush,
                CommandKind::SessionReleaseBuffers,
                CommandKind::SessionEnd,
            ]
        );
    }

    #[test]
    fn test_resume_restarts_idle_timer() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let before = dev.pm_schedule().pending().unwrap();

        dev.resume().unwrap();
        let after = dev.pm_schedule().pending().unwrap();
        assert!(after.generation > before.generation);
        assert!(!dev.pm_schedule().take(before.generation));
    }

    #[test]
    fn test_resume_drops_timer_without_sw_collapse() {
        let mut rig = TestRig::new();
        rig.config.sw_power_collapsible = false;
        let dev = booted(&rig);
        dev.pm_schedule().schedule(10);

        dev.resume().unwrap();
        assert_eq!(dev.pm_schedule().pending(), None);
    }

    #[test]
    fn test_reinit_after_release() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let s = dev.session_init(1, 0).unwrap();
        dev.core_release().unwrap();
        assert_eq!(dev.state(), CoreState::Deinitialized);
        assert!(!dev.validate_session(s));

        dev.core_init().unwrap();
        assert_eq!(dev.state(), CoreState::Booted);
        assert!(dev.is_powered());
        assert_eq!(rig.loader.loads(), 2);
        let s2 = dev.session_init(1, 0).unwrap();
        assert!(dev.validate_session(s2));
        assert!(!dev.validate_session(s));
    }

    #[test]
    fn test_session_init_reports_full_queue() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let s = dev.session_init(1, 0).unwrap();

        let payload = [0u8; 0x200];
        let mut sent = 0;
        while dev.session_send(s, &payload).is_ok() {
            sent += 1;
            assert!(sent < 64, "command queue never filled");
        }

        let err = dev.session_init(2, 0).unwrap_err();
        assert_eq!(err, HfiError::QueueFull);
        assert_eq!(err.kind(), crate::ErrorKind::Busy);
        assert_eq!(dev.session_count(), 1);
    }

    #[test]
    fn test_commands_rejected_before_init() {
        let rig = TestRig::new();
        let dev = rig.device();
        assert_eq!(dev.session_init(0, 0), Err(HfiError::InvalidState));
        assert_eq!(dev.core_trigger_ssr(SsrKind::HwWatchdog), Err(HfiError::InvalidState));
    }

    #[test]
    fn test_dispatch_preserves_order_and_truncates_on_sys_error() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let fw = rig.firmware();
        let s = dev.session_init(1, 0xC0FFEE).unwrap();

        fw.post(ResponseKind::SessionInitDone, s.wire_id(), 0);
        fw.post(ResponseKind::SessionResult, s.wire_id(), 1);
        fw.post(ResponseKind::SysError, 0, 0xBAD);
        fw.post(ResponseKind::SessionResult, s.wire_id(), 2);
        fw.raise_interrupt();

        assert_eq!(dev.process_interrupt(), 3);
        let events = rig.sink.events();
        assert_eq!(events.len(), 3);
        match &events[0] {
            HfiEvent::Session { session, cookie, response } => {
                assert_eq!(*session, s);
                assert_eq!(*cookie, 0xC0FFEE);
                assert_eq!(response.kind, ResponseKind::SessionInitDone);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &events[1] {
            HfiEvent::Session { response, .. } => assert_eq!(response.status, 1),
            other => panic!("unexpected {:?}", other),
        }
        match &events[2] {
            HfiEvent::System(r) => assert_eq!(r.kind, ResponseKind::SysError),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rig.irq.is_enabled());
    }

    #[test]
    fn test_dispatch_discards_unknown_session_and_noise() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let fw = rig.firmware();
        let s = dev.session_init(1, 1).unwrap();
        dev.session_clean(s).unwrap();

        fw.post(ResponseKind::SessionEndDone, s.wire_id(), 0);
        fw.post(ResponseKind::NoResponse, 0, 0);
        fw.post_raw(&[12, 0, 0, 0, 0xEE, 0xEE, 0, 0, 0, 0, 0, 0]);
        fw.post(ResponseKind::SysIdle, 0, 0);
        fw.raise_interrupt();

        assert_eq!(dev.process_interrupt(), 1);
        assert!(matches!(
            rig.sink.events().as_slice(),
            [HfiEvent::System(r)] if r.kind == ResponseKind::SysIdle
        ));
    }

    #[test]
    fn test_dispatch_caps_batch() {
        let mut rig = TestRig::new();
        rig.config.max_packets_per_irq = 2;
        let dev = booted(&rig);
        let fw = rig.firmware();
        for _ in 0..3 {
            fw.post(ResponseKind::SysIdle, 0, 0);
        }
        fw.raise_interrupt();
        assert_eq!(dev.process_interrupt(), 2);
        fw.raise_interrupt();
        assert_eq!(dev.process_interrupt(), 1);
    }

    #[test]
    fn test_watchdog_is_single_fatal_event() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let fw = rig.firmware();
        fw.post(ResponseKind::SysIdle, 0, 0);
        fw.post_debug("last words");
        rig.hw.raise(IntrStatus::A2HWD.bits());

        dev.isr();
        assert!(!rig.irq.is_enabled());
        assert_eq!(dev.process_interrupt(), 1);
        assert!(matches!(
            rig.sink.events().as_slice(),
            [HfiEvent::Fatal { intr_status }] if intr_status & IntrStatus::A2HWD.bits() != 0
        ));
        // Line stays masked after a watchdog
        assert!(!rig.irq.is_enabled());
        // Message queue untouched, debug queue drained
        assert!(!fw.message_queue_empty());
        assert!(fw.debug_queue_empty());
    }

    #[test]
    fn test_sink_may_reenter_device() {
        struct Reentrant {
            dev: spin::Once<Arc<HfiDevice>>,
            hits: Mutex<usize>,
        }
        impl EventSink for Reentrant {
            fn on_event(&self, _event: HfiEvent) {
                if let Some(dev) = self.dev.get() {
                    assert!(dev.session_count() <= 1);
                    dev.resume().unwrap();
                }
                *self.hits.lock() += 1;
            }
            fn on_fatal(&self, _reason: FatalReason) {}
        }

        let rig = TestRig::new();
        let dev = Arc::new(booted(&rig));
        let sink = Arc::new(Reentrant {
            dev: spin::Once::new(),
            hits: Mutex::new(0),
        });
        sink.dev.call_once(|| dev.clone());
        dev.register_callback(sink.clone());

        let fw = rig.firmware();
        fw.post(ResponseKind::SysIdle, 0, 0);
        fw.post(ResponseKind::SysPropertyInfo, 0, 0);
        fw.raise_interrupt();
        assert_eq!(dev.process_interrupt(), 2);
        assert_eq!(*sink.hits.lock(), 2);
    }

    #[test]
    fn test_collapse_busy_with_running_session() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let s = dev.session_init(1, 0).unwrap();

        assert_eq!(dev.pm_work(), PmOutcome::Rescheduled);
        assert!(dev.is_powered());

        dev.set_session_paused(s, true).unwrap();
        assert_eq!(dev.pm_work(), PmOutcome::Collapsed);
        assert!(!dev.is_powered());
        assert_eq!(rig.secure.states(), alloc::vec![cvp_hal::RemoteState::Suspend]);
    }

    #[test]
    fn test_suspend_forces_collapse() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        dev.session_init(1, 0).unwrap();
        dev.suspend().unwrap();
        assert!(!dev.is_powered());
        assert!(dev.pm_schedule().pending().is_none());
    }

    #[test]
    fn test_suspend_not_supported() {
        let mut rig = TestRig::new();
        rig.config.sw_power_collapsible = false;
        let dev = booted(&rig);
        assert_eq!(dev.suspend(), Err(HfiError::NotSupported));
    }

    #[test]
    fn test_command_resumes_collapsed_core() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        dev.suspend().unwrap();
        let enables = rig.resources.count("enable:cvp");

        let s = dev.session_init(2, 0).unwrap();
        assert!(dev.is_powered());
        assert!(dev.validate_session(s));
        assert_eq!(rig.resources.count("enable:cvp"), enables + 1);
        assert_eq!(
            rig.secure.states(),
            alloc::vec![cvp_hal::RemoteState::Suspend, cvp_hal::RemoteState::Resume]
        );
        assert!(dev.pm_schedule().pending().is_some());
    }

    #[test]
    fn test_resume_when_powered_is_noop() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let before = rig.resources.log().len();
        dev.resume().unwrap();
        assert_eq!(rig.resources.log().len(), before);
        assert!(rig.secure.states().is_empty());
    }

    #[test]
    fn test_resume_after_release_rejected() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        dev.core_release().unwrap();
        assert_eq!(dev.resume(), Err(HfiError::InvalidState));
    }

    #[test]
    fn test_resume_failure_is_fatal() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        dev.suspend().unwrap();
        rig.secure.fail_on(cvp_hal::RemoteState::Resume);
        assert_eq!(dev.resume(), Err(HfiError::Fatal));
        assert!(!dev.is_powered());
        assert_eq!(rig.sink.fatals(), alloc::vec![FatalReason::ResumeFailed]);
    }

    #[test]
    fn test_not_ready_escalates_after_budget() {
        let mut rig = TestRig::new();
        rig.config.max_pc_skip_count = 3;
        let dev = booted(&rig);
        // Firmware never reaches WFI
        rig.hw.set(regs::WRAPPER_CPU_STATUS, 0);

        for _ in 0..3 {
            assert_eq!(dev.pm_work(), PmOutcome::Rescheduled);
        }
        assert_eq!(dev.pm_work(), PmOutcome::Escalated);
        assert_eq!(rig.sink.fatals(), alloc::vec![FatalReason::PowerCollapseStuck]);
        assert!(dev.is_powered());
    }

    #[test]
    fn test_prepare_pc_sent_when_not_ready() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let fw = rig.firmware();
        fw.take_commands();
        rig.hw.set(regs::CTRL_STATUS, (CtrlStatus::INIT_DONE | CtrlStatus::IDLE).bits());

        assert_eq!(dev.pm_work(), PmOutcome::Rescheduled);
        let kinds: Vec<_> = fw.take_commands().into_iter().map(|c| c.0).collect();
        assert_eq!(kinds, alloc::vec![CommandKind::SysPcPrep]);
        assert!(dev.is_powered());
    }

    #[test]
    fn test_trigger_ssr_busy_when_locked() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let guard = dev.core.lock();
        assert_eq!(dev.core_trigger_ssr(SsrKind::SwErrorFatal), Err(HfiError::Busy));
        drop(guard);
        dev.core_trigger_ssr(SsrKind::SwErrorFatal).unwrap();
    }

    #[test]
    fn test_fw_info() {
        let rig = TestRig::new();
        rig.loader.set_version(b"\0\0junkVIDEO.CVP.2.0-00042\0tail");
        let dev = rig.device();
        let info = dev.get_fw_info().unwrap();
        assert_eq!(info.version.as_str(), "VIDEO.CVP.2.0-00042");
        assert_eq!(info.irq, rig.irq.number());
        assert!(dev.get_core_capabilities().is_ok());
    }

    #[test]
    fn test_noc_error_info_once_per_boot() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let errlog3 = regs::NOC_CORE_ERR_LOGGER_BASE + 0x38;
        rig.hw.set(errlog3, 3 << 5 | 2 << 2);

        let log = dev.noc_error_info().unwrap().unwrap();
        assert_eq!(log.master_name(), "CVP_OD_ORIG_PIXEL");
        assert_eq!(NocErrorLog::sub_id(log.core_errlog3_low()), 2);
        assert_eq!(dev.noc_error_info(), Ok(None));
    }

    #[test]
    fn test_flush_debug_queue_needs_power() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let fw = rig.firmware();
        fw.post_debug("hello");
        fw.post_debug("world");
        assert_eq!(dev.flush_debug_queue(), Ok(2));

        dev.suspend().unwrap();
        assert_eq!(dev.flush_debug_queue(), Err(HfiError::InvalidState));
        assert!(rig.sink.fatals().is_empty());
    }

    #[test]
    fn test_subcaches_set_and_released() {
        let rig = TestRig::new().with_cache();
        let dev = booted(&rig);
        let fw = rig.firmware();
        let kinds: Vec<_> = fw.take_commands().into_iter().map(|c| c.0).collect();
        assert!(kinds.contains(&CommandKind::SysSetResource));
        assert_eq!(rig.resources.count("activate:cvp"), 1);

        dev.suspend().unwrap();
        assert_eq!(rig.resources.count("deactivate:cvp"), 1);
        dev.resume().unwrap();
        assert_eq!(rig.resources.count("activate:cvp"), 2);
    }

    #[test]
    fn test_dsp_receives_queues() {
        let rig = TestRig::new().with_dsp();
        let dev = booted(&rig);
        let dsp = rig.dsp.as_ref().unwrap();
        assert_eq!(dsp.queues_sent(), 1);
        assert!(rig.hw.get(regs::DSP_QTBL_ADDR) != 0);

        dsp.set_suspend_result(Err(HfiError::Busy));
        assert_eq!(dev.pm_work(), PmOutcome::Rescheduled);
        dev.core_release().unwrap();
        assert!(dsp.is_shut_down());
    }

    #[test]
    fn test_scale_clocks_and_votes() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        dev.scale_clocks(400_000_000).unwrap();
        assert_eq!(rig.resources.count("rate:400000000"), 1);

        let vote = BusVote {
            ddr_bw_kbps: 100,
            ..BusVote::default()
        };
        dev.vote_buses(&[vote]).unwrap();
        assert_eq!(rig.resources.count("bus:ddr=1000"), 2);
    }

    #[test]
    fn test_collapse_drops_bus_votes() {
        let rig = TestRig::new();
        let dev = booted(&rig);
        let vote = BusVote {
            ddr_bw_kbps: 100,
            ..BusVote::default()
        };
        dev.vote_buses(&[vote]).unwrap();
        assert_eq!(dev.core.lock().bus_votes, alloc::vec![vote]);

        dev.suspend().unwrap();
        assert!(dev.core.lock().bus_votes.is_empty());
        assert_eq!(rig.resources.count("bus:ddr=0"), 1);

        rig.resources.clear_log();
        dev.resume().unwrap();
        assert_eq!(rig.resources.count("bus:ddr=1000"), 1);
        assert!(dev.core.lock().bus_votes.is_empty());
    }
}
