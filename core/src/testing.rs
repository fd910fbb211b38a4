//! # Simulated Platform
//!
//! Register file, power resources, loader, secure monitor and a scripted
//! firmware peer, all recording what the core did to them. Every handle is
//! a cheap clone over shared state, so a test keeps one copy while the
//! device owns the other.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use cvp_hal::memory::HeapAllocator;
use cvp_hal::power::{CacheSlice, ClockController, Interconnect, Regulator, ResetLine};
use cvp_hal::regs::{self, CpuStatus, CtrlStatus, IntrStatus};
use cvp_hal::time::NoDelay;
use cvp_hal::{
    DmaAllocator, FirmwareLoader, HalError, IrqLine, MemoryKind, PowerResources, RegisterIo,
    RemoteState, SecureMonitor, SharedMemory, SocVariant,
};
use spin::{Mutex, Once};

use crate::config::{HfiConfig, PollConfig};
use crate::device::{HfiCore, HfiDevice, Platform};
use crate::dispatch::{EventSink, FatalReason, HfiEvent, SinkSlot};
use crate::dsp::DspLink;
use crate::packet::{
    encode_debug, packet_type, CommandKind, HfiCommand, HfiResponse, PacketBuilder, ResponseKind,
};
use crate::pm::PmSchedule;
use crate::queue::{QueueRole, QueueTable};
use crate::{HfiError, Result};

// =============================================================================
// REGISTERS
// =============================================================================

#[derive(Debug)]
struct SimRegs {
    values: BTreeMap<u32, u32>,
    reads: BTreeMap<u32, usize>,
    writes: BTreeMap<u32, usize>,
    boot_status: u32,
}

/// Register file with the handful of side effects the core depends on
///
/// - `CTRL_INIT = 1` publishes the boot status in `CTRL_STATUS`
/// - `NOC_RESET_REQ` is mirrored into `NOC_RESET_ACK`
/// - `A2HSOFTINTCLR` drops the soft interrupt bit
#[derive(Debug, Clone)]
pub struct SimHardware {
    inner: Arc<Mutex<SimRegs>>,
}

impl Default for SimHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHardware {
    /// Idle, healthy hardware
    pub fn new() -> Self {
        let mut values = BTreeMap::new();
        values.insert(regs::AON_WRAPPER_NOC_LPI_STATUS, 0x1);
        values.insert(regs::WRAPPER_CPU_NOC_LPI_STATUS, 0x1);
        values.insert(regs::SS_IDLE_STATUS, regs::SS_IDLE);
        values.insert(regs::WRAPPER_CPU_STATUS, CpuStatus::WFI.bits());
        values.insert(regs::WRAPPER_INTR_MASK, 0x1FF);
        Self {
            inner: Arc::new(Mutex::new(SimRegs {
                values,
                reads: BTreeMap::new(),
                writes: BTreeMap::new(),
                boot_status: (CtrlStatus::INIT_DONE | CtrlStatus::PC_READY).bits(),
            })),
        }
    }

    /// Current value of `reg`
    pub fn get(&self, reg: u32) -> u32 {
        self.inner.lock().values.get(&reg).copied().unwrap_or(0)
    }

    /// Set `reg` behind the core's back
    pub fn set(&self, reg: u32, value: u32) {
        self.inner.lock().values.insert(reg, value);
    }

    /// OR `bits` into the wrapper interrupt status
    pub fn raise(&self, bits: u32) {
        let mut sim = self.inner.lock();
        *sim.values.entry(regs::WRAPPER_INTR_STATUS).or_insert(0) |= bits;
    }

    /// Status the firmware reports after `CTRL_INIT`
    pub fn set_boot_status(&self, status: u32) {
        self.inner.lock().boot_status = status;
    }

    /// Reads of `reg` by the core so far
    pub fn reads_of(&self, reg: u32) -> usize {
        self.inner.lock().reads.get(&reg).copied().unwrap_or(0)
    }

    /// Writes to `reg` by the core so far
    pub fn writes_of(&self, reg: u32) -> usize {
        self.inner.lock().writes.get(&reg).copied().unwrap_or(0)
    }
}

impl RegisterIo for SimHardware {
    fn read32(&self, offset: u32) -> u32 {
        let mut sim = self.inner.lock();
        *sim.reads.entry(offset).or_insert(0) += 1;
        sim.values.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut sim = self.inner.lock();
        *sim.writes.entry(offset).or_insert(0) += 1;
        sim.values.insert(offset, value);
        match offset {
            regs::CTRL_INIT if value & 1 != 0 => {
                let status = sim.boot_status;
                sim.values.insert(regs::CTRL_STATUS, status);
            }
            regs::NOC_RESET_REQ => {
                sim.values.insert(regs::NOC_RESET_ACK, value);
            }
            regs::CPU_CS_A2HSOFTINTCLR => {
                if let Some(status) = sim.values.get_mut(&regs::WRAPPER_INTR_STATUS) {
                    *status &= !IntrStatus::A2HCPU.bits();
                }
            }
            _ => {}
        }
    }
}

// =============================================================================
// EVENT SINK
// =============================================================================

/// Sink that keeps everything it is given
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<HfiEvent>>,
    fatals: Mutex<Vec<FatalReason>>,
}

impl RecordingSink {
    /// Events delivered so far
    pub fn events(&self) -> Vec<HfiEvent> {
        self.events.lock().clone()
    }

    /// Fatal errors raised so far
    pub fn fatals(&self) -> Vec<FatalReason> {
        self.fatals.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn on_event(&self, event: HfiEvent) {
        self.events.lock().push(event);
    }

    fn on_fatal(&self, reason: FatalReason) {
        self.fatals.lock().push(reason);
    }
}

// =============================================================================
// POWER RESOURCES
// =============================================================================

#[derive(Debug, Default)]
struct ResourceState {
    log: Vec<String>,
    enabled: BTreeMap<String, bool>,
    fail_enable: Vec<String>,
    fail_hand_off: Vec<String>,
    hw_collapse: Vec<String>,
}

type SharedResources = Arc<Mutex<ResourceState>>;

/// Regulators `cvp` and `cvp-core`, one `ddr` bus, a `bridge` reset line
/// and optionally a `cvp` cache slice, logging every transition
#[derive(Debug, Clone, Default)]
pub struct RecordingResources {
    state: SharedResources,
    with_cache: Arc<AtomicBool>,
}

impl RecordingResources {
    /// Transitions so far, oldest first
    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// How often `entry` appears in the log
    pub fn count(&self, entry: &str) -> usize {
        self.state.lock().log.iter().filter(|e| *e == entry).count()
    }

    /// Forget the log
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Make enabling regulator `name` fail
    pub fn fail_enable(&self, name: &str) {
        self.state.lock().fail_enable.push(name.to_string());
    }

    /// Make handing regulator `name` to hardware fail
    pub fn fail_hand_off(&self, name: &str) {
        self.state.lock().fail_hand_off.push(name.to_string());
    }

    /// Whether regulator `name` supports hardware power collapse
    pub fn set_hw_collapse(&self, name: &str, on: bool) {
        let mut state = self.state.lock();
        state.hw_collapse.retain(|n| n != name);
        if on {
            state.hw_collapse.push(name.to_string());
        }
    }

    /// Build the resource set the core owns
    pub fn build(&self) -> PowerResources {
        let mut cache_slices: Vec<Box<dyn CacheSlice>> = Vec::new();
        if self.with_cache.load(Ordering::Relaxed) {
            cache_slices.push(Box::new(SimSlice {
                state: self.state.clone(),
                name: "cvp",
                id: 1,
            }));
        }
        PowerResources {
            regulators: alloc::vec![
                Box::new(SimRail::new(&self.state, "cvp")) as Box<dyn Regulator>,
                Box::new(SimRail::new(&self.state, "cvp-core")),
            ],
            clocks: Box::new(SimClocks(self.state.clone())),
            buses: alloc::vec![Box::new(SimBus(self.state.clone())) as Box<dyn Interconnect>],
            cache_slices,
            resets: alloc::vec![Box::new(SimReset(self.state.clone())) as Box<dyn ResetLine>],
        }
    }

    fn record(state: &SharedResources, entry: String) {
        state.lock().log.push(entry);
    }
}

struct SimRail {
    state: SharedResources,
    name: &'static str,
}

impl SimRail {
    fn new(state: &SharedResources, name: &'static str) -> Self {
        Self {
            state: state.clone(),
            name,
        }
    }

    fn set_enabled(&self, on: bool) {
        self.state.lock().enabled.insert(self.name.to_string(), on);
    }
}

impl Regulator for SimRail {
    fn name(&self) -> &str {
        self.name
    }

    fn enable(&mut self) -> cvp_hal::Result<()> {
        if self.state.lock().fail_enable.iter().any(|n| n == self.name) {
            return Err(HalError::ResourceFailure);
        }
        self.set_enabled(true);
        RecordingResources::record(&self.state, format!("enable:{}", self.name));
        Ok(())
    }

    fn disable(&mut self) -> cvp_hal::Result<()> {
        self.set_enabled(false);
        RecordingResources::record(&self.state, format!("disable:{}", self.name));
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().enabled.get(self.name).copied().unwrap_or(false)
    }

    fn has_hw_power_collapse(&self) -> bool {
        self.state.lock().hw_collapse.iter().any(|n| n == self.name)
    }

    fn set_hw_control(&mut self, hw: bool) -> cvp_hal::Result<()> {
        if hw && self.state.lock().fail_hand_off.iter().any(|n| n == self.name) {
            return Err(HalError::ResourceFailure);
        }
        RecordingResources::record(&self.state, format!("hw:{}={}", self.name, hw));
        Ok(())
    }
}

struct SimClocks(SharedResources);

impl ClockController for SimClocks {
    fn prepare_enable(&mut self, name: &str) -> cvp_hal::Result<()> {
        RecordingResources::record(&self.0, format!("clk_on:{}", name));
        Ok(())
    }

    fn disable_unprepare(&mut self, name: &str) {
        RecordingResources::record(&self.0, format!("clk_off:{}", name));
    }

    fn set_rate(&mut self, hz: u64) -> cvp_hal::Result<()> {
        RecordingResources::record(&self.0, format!("rate:{}", hz));
        Ok(())
    }
}

struct SimBus(SharedResources);

impl Interconnect for SimBus {
    fn name(&self) -> &str {
        "ddr"
    }

    fn max_bandwidth(&self) -> u64 {
        1000
    }

    fn set_bandwidth(&mut self, kbps: u64) -> cvp_hal::Result<()> {
        RecordingResources::record(&self.0, format!("bus:ddr={}", kbps));
        Ok(())
    }
}

struct SimSlice {
    state: SharedResources,
    name: &'static str,
    id: u32,
}

impl CacheSlice for SimSlice {
    fn name(&self) -> &str {
        self.name
    }

    fn slice_id(&self) -> u32 {
        self.id
    }

    fn size(&self) -> u32 {
        512
    }

    fn activate(&mut self) -> cvp_hal::Result<()> {
        RecordingResources::record(&self.state, format!("activate:{}", self.name));
        Ok(())
    }

    fn deactivate(&mut self) -> cvp_hal::Result<()> {
        RecordingResources::record(&self.state, format!("deactivate:{}", self.name));
        Ok(())
    }
}

struct SimReset(SharedResources);

impl ResetLine for SimReset {
    fn name(&self) -> &str {
        "bridge"
    }

    fn assert_reset(&mut self) -> cvp_hal::Result<()> {
        RecordingResources::record(&self.0, "reset:bridge".to_string());
        Ok(())
    }

    fn deassert_reset(&mut self) -> cvp_hal::Result<()> {
        RecordingResources::record(&self.0, "deassert:bridge".to_string());
        Ok(())
    }
}

// =============================================================================
// FIRMWARE, SECURE MONITOR, IRQ, MEMORY
// =============================================================================

#[derive(Debug, Default)]
struct LoaderState {
    loads: usize,
    unloads: usize,
}

/// Loader counting loads, with an optional version blob
#[derive(Debug, Clone, Default)]
pub struct RecordingLoader {
    state: Arc<Mutex<LoaderState>>,
    version: Arc<Once<Vec<u8>>>,
}

impl RecordingLoader {
    /// Images loaded so far
    pub fn loads(&self) -> usize {
        self.state.lock().loads
    }

    /// Images unloaded so far
    pub fn unloads(&self) -> usize {
        self.state.lock().unloads
    }

    /// Raw bytes of the image version region, settable once
    pub fn set_version(&self, raw: &[u8]) {
        self.version.call_once(|| raw.to_vec());
    }
}

impl FirmwareLoader for RecordingLoader {
    fn load(&mut self) -> cvp_hal::Result<()> {
        self.state.lock().loads += 1;
        Ok(())
    }

    fn unload(&mut self) {
        self.state.lock().unloads += 1;
    }

    fn firmware_base(&self) -> u64 {
        0x8A00_0000
    }

    fn version_region(&self) -> Option<&[u8]> {
        self.version.get().map(Vec::as_slice)
    }
}

#[derive(Debug, Default)]
struct SecureState {
    states: Vec<RemoteState>,
    fail_on: Option<RemoteState>,
}

/// Secure monitor recording every state request
#[derive(Debug, Clone, Default)]
pub struct RecordingSecure(Arc<Mutex<SecureState>>);

impl RecordingSecure {
    /// Requests so far, failed ones included
    pub fn states(&self) -> Vec<RemoteState> {
        self.0.lock().states.clone()
    }

    /// Fail every request for `state`
    pub fn fail_on(&self, state: RemoteState) {
        self.0.lock().fail_on = Some(state);
    }
}

impl SecureMonitor for RecordingSecure {
    fn set_remote_state(&mut self, state: RemoteState) -> cvp_hal::Result<()> {
        let mut s = self.0.lock();
        s.states.push(state);
        if s.fail_on == Some(state) {
            return Err(HalError::SecureCallFailed);
        }
        Ok(())
    }
}

/// Interrupt line tracking its mask state
#[derive(Debug, Default)]
pub struct RecordingIrq {
    enabled: AtomicBool,
}

impl RecordingIrq {
    /// Whether the line is unmasked
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl IrqLine for RecordingIrq {
    fn number(&self) -> u32 {
        42
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn disable_nosync(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

struct AllocState {
    heap: HeapAllocator,
    live: Vec<(MemoryKind, Arc<dyn SharedMemory>)>,
}

/// Heap allocator that remembers live regions for the firmware peer
#[derive(Clone)]
pub struct RecordingAllocator(Arc<Mutex<AllocState>>);

impl core::fmt::Debug for RecordingAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecordingAllocator")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Default for RecordingAllocator {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(AllocState {
            heap: HeapAllocator::new(0x8000_0000),
            live: Vec::new(),
        })))
    }
}

impl RecordingAllocator {
    /// Regions not yet freed
    pub fn outstanding(&self) -> usize {
        self.0.lock().heap.outstanding()
    }

    /// Oldest live region of `kind`
    pub fn region(&self, kind: MemoryKind) -> Option<Arc<dyn SharedMemory>> {
        self.0
            .lock()
            .live
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, r)| r.clone())
    }
}

impl DmaAllocator for RecordingAllocator {
    fn alloc(&mut self, size: usize, kind: MemoryKind) -> cvp_hal::Result<Arc<dyn SharedMemory>> {
        let mut state = self.0.lock();
        let region = state.heap.alloc(size, kind)?;
        state.live.push((kind, region.clone()));
        Ok(region)
    }

    fn free(&mut self, region: Arc<dyn SharedMemory>) {
        let mut state = self.0.lock();
        let addr = region.device_addr();
        state.live.retain(|(_, r)| r.device_addr() != addr);
        state.heap.free(region);
    }
}

// =============================================================================
// DSP
// =============================================================================

#[derive(Debug)]
struct DspState {
    queues_sent: usize,
    suspended: bool,
    shut_down: bool,
    suspend_result: Result<()>,
}

/// DSP link with a scriptable suspend answer
#[derive(Debug, Clone)]
pub struct RecordingDsp(Arc<Mutex<DspState>>);

impl Default for RecordingDsp {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(DspState {
            queues_sent: 0,
            suspended: false,
            shut_down: false,
            suspend_result: Ok(()),
        })))
    }
}

impl RecordingDsp {
    /// Queue tables handed over so far
    pub fn queues_sent(&self) -> usize {
        self.0.lock().queues_sent
    }

    /// Answer for the next suspend requests
    pub fn set_suspend_result(&self, result: Result<()>) {
        self.0.lock().suspend_result = result;
    }

    /// Whether the link was shut down
    pub fn is_shut_down(&self) -> bool {
        self.0.lock().shut_down
    }
}

impl DspLink for RecordingDsp {
    fn send_queues(&mut self, _table: &QueueTable) -> Result<()> {
        self.0.lock().queues_sent += 1;
        Ok(())
    }

    fn suspend(&mut self, _force: bool) -> Result<()> {
        let mut s = self.0.lock();
        s.suspend_result?;
        s.suspended = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.0.lock().suspended = false;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.0.lock().shut_down = true;
    }

    fn is_suspended(&self) -> bool {
        self.0.lock().suspended
    }
}

// =============================================================================
// PACKETS
// =============================================================================

/// Header words of a scripted packet: size, type, session id, status
const SCRIPTED_HEADER: usize = 16;

const COMMAND_CODES: [(CommandKind, u32); 16] = [
    (CommandKind::SysInit, 0x1_0001),
    (CommandKind::SysImageVersion, 0x1_0002),
    (CommandKind::SysSetDebug, 0x1_0003),
    (CommandKind::SysSetIdleIndicator, 0x1_0004),
    (CommandKind::SysSetResource, 0x1_0005),
    (CommandKind::SysReleaseResource, 0x1_0006),
    (CommandKind::SysSetUbwcConfig, 0x1_0007),
    (CommandKind::SysPcPrep, 0x1_0008),
    (CommandKind::SysTestSsr, 0x1_0009),
    (CommandKind::SessionInit, 0x1_1001),
    (CommandKind::SessionEnd, 0x1_1002),
    (CommandKind::SessionAbort, 0x1_1003),
    (CommandKind::SessionFlush, 0x1_1004),
    (CommandKind::SessionSetBuffers, 0x1_1005),
    (CommandKind::SessionReleaseBuffers, 0x1_1006),
    (CommandKind::SessionSend, 0x1_1007),
];

const RESPONSE_CODES: [(ResponseKind, u32); 15] = [
    (ResponseKind::SysInitDone, 0x2_0001),
    (ResponseKind::SysPcPrepDone, 0x2_0002),
    (ResponseKind::SysReleaseResourceDone, 0x2_0003),
    (ResponseKind::SysIdle, 0x2_0005),
    (ResponseKind::SysPropertyInfo, 0x2_0006),
    (ResponseKind::SysError, 0x2_0007),
    (ResponseKind::SessionInitDone, 0x2_1001),
    (ResponseKind::SessionEndDone, 0x2_1002),
    (ResponseKind::SessionAbortDone, 0x2_1003),
    (ResponseKind::SessionFlushDone, 0x2_1004),
    (ResponseKind::SessionSetBuffersDone, 0x2_1005),
    (ResponseKind::SessionReleaseBuffersDone, 0x2_1006),
    (ResponseKind::SessionError, 0x2_1007),
    (ResponseKind::SessionResult, 0x2_1008),
    (ResponseKind::NoResponse, 0x2_0fff),
];

/// Word-aligned `{size, type, session, status, params...}` encoding
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptedPackets;

impl ScriptedPackets {
    fn command_code(kind: CommandKind) -> u32 {
        COMMAND_CODES
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, c)| *c)
    }

    /// Command kind of a wire type code
    pub fn command_kind(code: u32) -> Option<CommandKind> {
        COMMAND_CODES.iter().find(|(_, c)| *c == code).map(|(k, _)| *k)
    }

    /// Frame a firmware response
    pub fn response(kind: ResponseKind, session_id: u32, status: u32) -> Vec<u8> {
        let code = RESPONSE_CODES
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, c)| *c);
        frame(&[code, session_id, status], &[])
    }
}

fn frame(words: &[u32], tail: &[u8]) -> Vec<u8> {
    let size = (4 + words.len() * 4 + tail.len()).next_multiple_of(4);
    let mut raw = Vec::with_capacity(size);
    raw.extend_from_slice(&(size as u32).to_le_bytes());
    for w in words {
        raw.extend_from_slice(&w.to_le_bytes());
    }
    raw.extend_from_slice(tail);
    raw.resize(size, 0);
    raw
}

impl PacketBuilder for ScriptedPackets {
    fn build(&self, command: &HfiCommand<'_>) -> Result<Vec<u8>> {
        let mut words = alloc::vec![
            Self::command_code(command.kind()),
            command.session_id().unwrap_or(0),
            0,
        ];
        let mut tail: &[u8] = &[];
        match *command {
            HfiCommand::SysSetDebug { level, mode } => words.extend([level, mode]),
            HfiCommand::SysSetIdleIndicator(on) => words.push(u32::from(on)),
            HfiCommand::SysSetResource(entries) | HfiCommand::SysReleaseResource(entries) => {
                words.push(entries.len() as u32);
                for e in entries {
                    words.extend([e.slice_id, e.size]);
                }
            }
            HfiCommand::SysSetUbwcConfig(ubwc) => words.push(ubwc.highest_bank_bit),
            HfiCommand::SysTestSsr(kind) => words.push(kind as u32),
            HfiCommand::SessionInit { session_type, .. } => words.push(session_type),
            HfiCommand::SessionFlush { flags, .. } => words.push(flags),
            HfiCommand::SessionSetBuffers { iova, size, .. } => words.extend([iova, size]),
            HfiCommand::SessionSend { payload, .. } => tail = payload,
            _ => {}
        }
        Ok(frame(&words, tail))
    }

    fn decode(&self, raw: &[u8]) -> Result<HfiResponse> {
        let word = |i: usize| {
            raw.get(i * 4..i * 4 + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
        };
        let size = word(0).ok_or(HfiError::InvalidArgument)? as usize;
        if size < SCRIPTED_HEADER || size > raw.len() {
            return Err(HfiError::InvalidArgument);
        }
        let code = packet_type(raw).ok_or(HfiError::InvalidArgument)?;
        let kind = RESPONSE_CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(k, _)| *k)
            .ok_or(HfiError::InvalidArgument)?;
        Ok(HfiResponse {
            kind,
            session_id: word(2).filter(|_| kind.carries_session()),
            status: word(3).unwrap_or(0),
            payload: raw[..size].to_vec(),
        })
    }
}

// =============================================================================
// FIRMWARE PEER
// =============================================================================

/// The firmware side of the host queue table
#[derive(Debug)]
pub struct SimFirmware {
    table: QueueTable,
    hw: SimHardware,
}

impl SimFirmware {
    /// Attach to the live host queue table
    pub fn attach(allocator: &RecordingAllocator, hw: &SimHardware, max_packet: usize) -> Result<Self> {
        let region = allocator.region(MemoryKind::Queues).ok_or(HfiError::InvalidState)?;
        Ok(Self {
            table: QueueTable::attach(region, max_packet)?,
            hw: hw.clone(),
        })
    }

    /// Drain the command queue as `(kind, session id)` pairs
    pub fn take_commands(&self) -> Vec<(CommandKind, u32)> {
        let mut out = Vec::new();
        while let Ok(read) = self.table.queue(QueueRole::Command).read() {
            let code = packet_type(&read.packet).unwrap_or(0);
            let session = read
                .packet
                .get(8..12)
                .and_then(|b| b.try_into().ok())
                .map_or(0, u32::from_le_bytes);
            if let Some(kind) = ScriptedPackets::command_kind(code) {
                out.push((kind, session));
            }
        }
        out
    }

    /// Queue a response
    pub fn post(&self, kind: ResponseKind, session_id: u32, status: u32) {
        self.post_raw(&ScriptedPackets::response(kind, session_id, status));
    }

    /// Queue raw bytes on the message queue
    pub fn post_raw(&self, raw: &[u8]) {
        if let Err(e) = self.table.queue(QueueRole::Message).write(raw) {
            log::warn!("sim firmware: message queue write failed: {}", e);
        }
    }

    /// Queue a log line
    pub fn post_debug(&self, line: &str) {
        if let Err(e) = self.table.queue(QueueRole::Debug).write(&encode_debug(line)) {
            log::warn!("sim firmware: debug queue write failed: {}", e);
        }
    }

    /// Signal the host
    pub fn raise_interrupt(&self) {
        self.hw.raise(IntrStatus::A2HCPU.bits());
    }

    /// Whether the host drained every response
    pub fn message_queue_empty(&self) -> bool {
        self.table.queue(QueueRole::Message).is_empty()
    }

    /// Whether the host drained every log line
    pub fn debug_queue_empty(&self) -> bool {
        self.table.queue(QueueRole::Debug).is_empty()
    }
}

// =============================================================================
// RIG
// =============================================================================

/// Everything needed to build a device on simulated hardware
#[derive(Debug)]
pub struct TestRig {
    /// Configuration used by [`TestRig::device`]
    pub config: HfiConfig,
    /// Register file
    pub hw: SimHardware,
    /// Power resources
    pub resources: RecordingResources,
    /// Firmware loader
    pub loader: RecordingLoader,
    /// Secure monitor
    pub secure: RecordingSecure,
    /// Interrupt line
    pub irq: Arc<RecordingIrq>,
    /// Shared memory
    pub allocator: RecordingAllocator,
    /// DSP link, see [`TestRig::with_dsp`]
    pub dsp: Option<RecordingDsp>,
    /// Event sink registered on every device
    pub sink: Arc<RecordingSink>,
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRig {
    /// Default variant on healthy hardware
    pub fn new() -> Self {
        Self::with_variant(SocVariant::default())
    }

    /// Rig for a specific chip
    pub fn with_variant(variant: SocVariant) -> Self {
        Self {
            config: Self::config(variant),
            hw: SimHardware::new(),
            resources: RecordingResources::default(),
            loader: RecordingLoader::default(),
            secure: RecordingSecure::default(),
            irq: Arc::new(RecordingIrq::default()),
            allocator: RecordingAllocator::default(),
            dsp: None,
            sink: Arc::new(RecordingSink::default()),
        }
    }

    /// Small queues and sleep-free polls
    pub fn config(variant: SocVariant) -> HfiConfig {
        HfiConfig {
            variant,
            queue_size: 0x1000,
            max_packet_size: 0x400,
            sfr_size: 0x100,
            qdss_size: 0x100,
            pc_delay_ms: 10,
            poll: PollConfig::fast(),
            ..HfiConfig::default()
        }
    }

    /// Add a system cache slice
    pub fn with_cache(self) -> Self {
        self.resources.with_cache.store(true, Ordering::Relaxed);
        self
    }

    /// Add a DSP consumer
    pub fn with_dsp(mut self) -> Self {
        self.config.dsp_enabled = true;
        self.dsp = Some(RecordingDsp::default());
        self
    }

    /// Fresh platform over the shared simulated state
    pub fn platform(&self) -> Platform {
        Platform {
            registers: Box::new(self.hw.clone()),
            resources: self.resources.build(),
            loader: Box::new(self.loader.clone()),
            secure: Box::new(self.secure.clone()),
            allocator: Box::new(self.allocator.clone()),
            packets: Box::new(ScriptedPackets),
            irq: self.irq.clone(),
            delay: Box::new(NoDelay),
            dsp: self
                .dsp
                .as_ref()
                .map(|d| Box::new(d.clone()) as Box<dyn DspLink>),
            trace_ranges: Vec::new(),
            owner_tag: 0xC0DE,
            register_base: 0xAB0_0000,
            register_size: 0x10_0000,
        }
    }

    /// Device with the rig sink registered
    pub fn device(&self) -> HfiDevice {
        let dev = match HfiDevice::new(self.config.clone(), self.platform()) {
            Ok(dev) => dev,
            Err(e) => panic!("rig config rejected: {}", e),
        };
        dev.register_callback(self.sink.clone());
        dev
    }

    /// Bare core for power sequence tests
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn core(&self) -> HfiCore {
        let slot = SinkSlot::default();
        slot.set(self.sink.clone());
        match HfiCore::new(
            self.config.clone(),
            self.platform(),
            slot,
            Arc::new(PmSchedule::new()),
        ) {
            Ok(core) => core,
            Err(e) => panic!("rig config rejected: {}", e),
        }
    }

    /// Firmware peer of the booted device
    pub fn firmware(&self) -> SimFirmware {
        match SimFirmware::attach(&self.allocator, &self.hw, self.config.max_packet_size) {
            Ok(fw) => fw,
            Err(e) => panic!("no queue table to attach to: {}", e),
        }
    }
}
