//! # Queue Table
//!
//! Shared-memory directory the firmware reads at boot to find the three
//! rings, plus the crash-report and trace regions whose addresses are
//! programmed into registers next to it.
//!
//! ```text
//!   +----------------------+ 0
//!   | QueueTableHeader     |
//!   | QueueHeader cmd      |
//!   | QueueHeader msg      |
//!   | QueueHeader dbg      |
//!   +----------------------+ 4 KiB aligned
//!   | cmd array            |
//!   | msg array            |
//!   | dbg array            |
//!   +----------------------+
//! ```

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;

use cvp_hal::barrier::wmb;
use cvp_hal::{regs, DmaAllocator, MemoryKind, SharedMemory};
use static_assertions::assert_eq_size;

use super::ring::{QueueRole, RingQueue, QUEUE_HEADER_SIZE};
use crate::config::{HfiConfig, DEBUG_MODE_QDSS};
use crate::hw::Registers;
use crate::{HfiError, Result};

/// Table header, as laid out in memory
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueTableHeader {
    /// Layout version
    pub version: u32,
    /// Header plus queue headers, in bytes
    pub size: u32,
    /// Offset of the first queue header
    pub qhdr0_offset: u32,
    /// Size of one queue header
    pub qhdr_size: u32,
    /// Queues described
    pub num_q: u32,
    /// Queues in use
    pub num_active_q: u32,
    /// Owner tag, low half
    pub owner_lo: u32,
    /// Owner tag, high half
    pub owner_hi: u32,
    /// NUL padded owner name
    pub name: [u8; 16],
}

assert_eq_size!(QueueTableHeader, [u32; 12]);

const TABLE_HEADER_SIZE: usize = size_of::<QueueTableHeader>();
const NUM_QUEUES: usize = 3;
const TABLE_SIZE: usize = TABLE_HEADER_SIZE + NUM_QUEUES * QUEUE_HEADER_SIZE;
const ARRAY_ALIGN: usize = 0x1000;
const TABLE_NAME: &[u8] = b"msm_cvp";

/// Device address where QDSS ranges are mapped for the firmware
pub const QDSS_IOVA_START: u32 = 0x8000_1000;

fn arrays_offset() -> usize {
    TABLE_SIZE.next_multiple_of(ARRAY_ALIGN)
}

// =============================================================================
// QUEUE TABLE
// =============================================================================

/// The three rings and the header describing them
pub struct QueueTable {
    region: Arc<dyn SharedMemory>,
    queues: [RingQueue; NUM_QUEUES],
}

impl core::fmt::Debug for QueueTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueTable")
            .field("device_addr", &self.region.device_addr())
            .field("size", &self.region.size())
            .field("queues", &self.queues)
            .finish()
    }
}

impl QueueTable {
    /// Bytes needed for a table with `queue_size`-byte arrays
    pub fn region_size(queue_size: usize) -> usize {
        arrays_offset() + NUM_QUEUES * queue_size
    }

    /// Lay out a fresh table in `region`
    pub fn create(
        region: Arc<dyn SharedMemory>,
        queue_size: usize,
        max_packet: usize,
        owner: u64,
    ) -> Result<Self> {
        if region.size() < Self::region_size(queue_size) || queue_size % 4 != 0 {
            return Err(HfiError::InvalidArgument);
        }
        region.zero(0, arrays_offset());

        let capacity = (queue_size / 4) as u32;
        let queues = Self::attach_queues(&region, max_packet, |role| {
            (arrays_offset() + role.index() * queue_size, capacity)
        })?;
        for q in queues.iter() {
            q.init_header();
        }

        let mut name = [0u32; 4];
        for (i, b) in TABLE_NAME.iter().enumerate() {
            name[i / 4] |= u32::from(*b) << ((i % 4) * 8);
        }
        region.write_words(
            0,
            &[
                0,
                TABLE_SIZE as u32,
                TABLE_HEADER_SIZE as u32,
                QUEUE_HEADER_SIZE as u32,
                NUM_QUEUES as u32,
                NUM_QUEUES as u32,
                owner as u32,
                (owner >> 32) as u32,
            ],
        );
        region.write_words(32, &name);
        wmb();

        Ok(Self { region, queues })
    }

    /// View a table someone else laid out
    ///
    /// Array positions come from each queue header's start address and size.
    pub fn attach(region: Arc<dyn SharedMemory>, max_packet: usize) -> Result<Self> {
        let header = read_table_header(region.as_ref());
        if header.num_q as usize != NUM_QUEUES
            || header.qhdr_size as usize != QUEUE_HEADER_SIZE
            || header.qhdr0_offset as usize != TABLE_HEADER_SIZE
        {
            log::error!("unexpected queue table layout: {:?}", header);
            return Err(HfiError::InvalidArgument);
        }

        let base = region.device_addr();
        let mut layout = [(0usize, 0u32); NUM_QUEUES];
        for role in QueueRole::ALL {
            let hdr = TABLE_HEADER_SIZE + role.index() * QUEUE_HEADER_SIZE;
            let start = u64::from(region.read32(hdr + 4));
            let q_size = region.read32(hdr + 12);
            let offset = start
                .checked_sub(base & 0xFFFF_FFFF)
                .ok_or(HfiError::InvalidArgument)?;
            layout[role.index()] = (offset as usize, q_size);
        }
        let queues = Self::attach_queues(&region, max_packet, |role| layout[role.index()])?;
        Ok(Self { region, queues })
    }

    fn attach_queues(
        region: &Arc<dyn SharedMemory>,
        max_packet: usize,
        layout: impl Fn(QueueRole) -> (usize, u32),
    ) -> Result<[RingQueue; NUM_QUEUES]> {
        let make = |role: QueueRole| {
            let (array, capacity) = layout(role);
            RingQueue::attach(
                role,
                region.clone(),
                TABLE_HEADER_SIZE + role.index() * QUEUE_HEADER_SIZE,
                array,
                capacity,
                max_packet,
            )
        };
        Ok([
            make(QueueRole::Command)?,
            make(QueueRole::Message)?,
            make(QueueRole::Debug)?,
        ])
    }

    /// Ring for `role`
    pub fn queue(&self, role: QueueRole) -> &RingQueue {
        &self.queues[role.index()]
    }

    /// Table header as currently in memory
    pub fn header(&self) -> QueueTableHeader {
        read_table_header(self.region.as_ref())
    }

    /// Device address of the table
    pub fn device_addr(&self) -> u64 {
        self.region.device_addr()
    }

    /// Bytes covered by the table and its arrays
    pub fn size(&self) -> usize {
        self.region.size()
    }

    fn into_region(self) -> Arc<dyn SharedMemory> {
        self.region
    }
}

fn read_table_header(region: &dyn SharedMemory) -> QueueTableHeader {
    let mut w = [0u32; 12];
    region.read_words(0, &mut w);
    let mut name = [0u8; 16];
    for (i, b) in name.iter_mut().enumerate() {
        *b = (w[8 + i / 4] >> ((i % 4) * 8)) as u8;
    }
    QueueTableHeader {
        version: w[0],
        size: w[1],
        qhdr0_offset: w[2],
        qhdr_size: w[3],
        num_q: w[4],
        num_active_q: w[5],
        owner_lo: w[6],
        owner_hi: w[7],
        name,
    }
}

// =============================================================================
// CRASH REPORT
// =============================================================================

/// Region the firmware writes its failure reason into
#[derive(Clone)]
pub struct CrashReport {
    region: Arc<dyn SharedMemory>,
}

impl core::fmt::Debug for CrashReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CrashReport")
            .field("device_addr", &self.region.device_addr())
            .finish()
    }
}

impl CrashReport {
    /// Initialise the region, recording its size in the first word
    pub fn new(region: Arc<dyn SharedMemory>) -> Self {
        region.zero(0, region.size());
        region.write32(0, region.size() as u32);
        Self { region }
    }

    /// Device address of the region
    pub fn device_addr(&self) -> u64 {
        self.region.device_addr()
    }

    /// Failure text left by the firmware
    ///
    /// The firmware is crashing when it writes this, so the text is cut at
    /// the buffer end if no NUL was written.
    pub fn message(&self) -> String {
        let declared = self.region.read32(0) as usize;
        let len = declared.min(self.region.size()).saturating_sub(4);
        let mut words = alloc::vec![0u32; len / 4];
        self.region.read_words(4, &mut words);
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let end = bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(bytes.len().saturating_sub(1));
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    fn into_region(self) -> Arc<dyn SharedMemory> {
        self.region
    }
}

// =============================================================================
// TRACE REGION
// =============================================================================

/// Physical QDSS range exposed to the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRange {
    /// Physical start
    pub start: u32,
    /// Length in bytes
    pub size: u32,
}

/// One entry of the trace memory-map table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceMapEntry {
    /// Address the firmware uses
    pub virtual_addr: u32,
    /// Physical address
    pub physical_addr: u32,
    /// Length in bytes
    pub size: u32,
    /// Mapping attributes
    pub attr: u32,
}

const TRACE_TABLE_HEADER: usize = 8;
const TRACE_ENTRY_SIZE: usize = 16;

/// QDSS memory-map table
#[derive(Clone)]
pub struct TraceRegion {
    region: Arc<dyn SharedMemory>,
}

impl core::fmt::Debug for TraceRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TraceRegion")
            .field("device_addr", &self.region.device_addr())
            .finish()
    }
}

impl TraceRegion {
    /// Write the memory-map table for `ranges`
    ///
    /// Ranges are laid out back to back from [`QDSS_IOVA_START`].
    pub fn new(region: Arc<dyn SharedMemory>, ranges: &[TraceRange]) -> Result<Self> {
        if ranges.is_empty()
            || TRACE_TABLE_HEADER + ranges.len() * TRACE_ENTRY_SIZE > region.size()
        {
            return Err(HfiError::InvalidArgument);
        }
        let table_base = region.device_addr() as u32 + TRACE_TABLE_HEADER as u32;
        region.write_words(0, &[ranges.len() as u32, table_base]);

        let mut iova = QDSS_IOVA_START;
        for (i, range) in ranges.iter().enumerate() {
            let at = TRACE_TABLE_HEADER + i * TRACE_ENTRY_SIZE;
            region.write_words(at, &[iova, range.start, range.size, 0]);
            iova = iova.wrapping_add(range.size);
        }
        wmb();
        Ok(Self { region })
    }

    /// Device address of the table
    pub fn device_addr(&self) -> u64 {
        self.region.device_addr()
    }

    /// Entries as currently in memory
    pub fn entries(&self) -> Vec<TraceMapEntry> {
        let count = self.region.read32(0) as usize;
        (0..count)
            .map(|i| {
                let mut w = [0u32; 4];
                self.region
                    .read_words(TRACE_TABLE_HEADER + i * TRACE_ENTRY_SIZE, &mut w);
                TraceMapEntry {
                    virtual_addr: w[0],
                    physical_addr: w[1],
                    size: w[2],
                    attr: w[3],
                }
            })
            .collect()
    }

    fn into_region(self) -> Arc<dyn SharedMemory> {
        self.region
    }
}

// =============================================================================
// INTERFACE MEMORY
// =============================================================================

/// Everything the firmware finds through the boot registers
#[derive(Debug)]
pub struct InterfaceMemory {
    /// Host queue table
    pub host: QueueTable,
    /// Mirror for the DSP consumer
    pub dsp: Option<QueueTable>,
    /// Crash report
    pub sfr: Option<CrashReport>,
    /// QDSS memory map
    pub trace: Option<TraceRegion>,
}

impl InterfaceMemory {
    /// Allocate and lay out every region
    ///
    /// The queue tables are mandatory. Crash report and trace regions are
    /// best effort.
    pub fn allocate(
        alloc: &mut dyn DmaAllocator,
        config: &HfiConfig,
        trace_ranges: &[TraceRange],
        owner: u64,
    ) -> Result<Self> {
        let size = QueueTable::region_size(config.queue_size);
        let region = alloc.alloc(size, MemoryKind::Queues).map_err(|e| {
            log::error!("queue table allocation failed: {}", e);
            HfiError::OutOfMemory
        })?;
        let host = QueueTable::create(region, config.queue_size, config.max_packet_size, owner)?;

        let mut trace = None;
        if config.fw_debug_mode & DEBUG_MODE_QDSS != 0 && !trace_ranges.is_empty() {
            match alloc.alloc(config.qdss_size, MemoryKind::Trace) {
                Ok(region) => match TraceRegion::new(region.clone(), trace_ranges) {
                    Ok(t) => trace = Some(t),
                    Err(_) => {
                        log::error!("trace table does not fit, dropping QDSS");
                        alloc.free(region);
                    }
                },
                Err(_) => log::warn!("qdss alloc failed, QDSS logging will not work"),
            }
        }

        let sfr = match alloc.alloc(config.sfr_size, MemoryKind::CrashReport) {
            Ok(region) => Some(CrashReport::new(region)),
            Err(_) => {
                log::warn!("sfr alloc failed, crash reports will not work");
                None
            }
        };

        let mut mem = Self {
            host,
            dsp: None,
            sfr,
            trace,
        };

        if config.dsp_enabled {
            let dsp = alloc
                .alloc(size, MemoryKind::Queues)
                .map_err(HfiError::from)
                .and_then(|region| {
                    QueueTable::create(region, config.queue_size, config.max_packet_size, owner)
                });
            match dsp {
                Ok(table) => mem.dsp = Some(table),
                Err(e) => {
                    log::error!("dsp queue init failed: {}", e);
                    mem.release(alloc);
                    return Err(HfiError::OutOfMemory);
                }
            }
        }

        Ok(mem)
    }

    /// Hand every region back to the allocator
    pub fn release(self, alloc: &mut dyn DmaAllocator) {
        if let Some(dsp) = self.dsp {
            alloc.free(dsp.into_region());
        }
        if let Some(trace) = self.trace {
            alloc.free(trace.into_region());
        }
        if let Some(sfr) = self.sfr {
            alloc.free(sfr.into_region());
        }
        alloc.free(self.host.into_region());
    }

    /// Ring for `role` on the host table
    pub fn queue(&self, role: QueueRole) -> &RingQueue {
        self.host.queue(role)
    }

    /// Point the firmware at the host regions
    pub(crate) fn program(&self, regs: &Registers) -> Result<()> {
        let addr = self.host.device_addr() as u32;
        regs.write(regs::UC_REGION_ADDR, addr)?;
        regs.write(regs::UC_REGION_SIZE, self.host.size() as u32)?;
        regs.write(regs::QTBL_ADDR, addr)?;
        regs.write(regs::QTBL_INFO, regs::QTBL_ENABLE)?;
        if let Some(sfr) = &self.sfr {
            regs.write(regs::SFR_ADDR, sfr.device_addr() as u32)?;
        }
        if let Some(trace) = &self.trace {
            regs.write(regs::MMAP_ADDR, trace.device_addr() as u32)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvp_hal::memory::{HeapAllocator, HeapMemory};

    fn small_config() -> HfiConfig {
        HfiConfig {
            queue_size: 0x400,
            max_packet_size: 0x200,
            sfr_size: 0x100,
            qdss_size: 0x100,
            ..HfiConfig::default()
        }
    }

    #[test]
    fn test_create_layout() {
        let size = QueueTable::region_size(0x400);
        let region: Arc<dyn SharedMemory> = Arc::new(HeapMemory::new(size, 0x9000_0000));
        let table = QueueTable::create(region, 0x400, 0x200, 0xDEAD_BEEF_0000_0001).unwrap();

        let hdr = table.header();
        assert_eq!(hdr.num_q, 3);
        assert_eq!(hdr.num_active_q, 3);
        assert_eq!(hdr.qhdr0_offset as usize, TABLE_HEADER_SIZE);
        assert_eq!(hdr.qhdr_size as usize, QUEUE_HEADER_SIZE);
        assert_eq!((hdr.owner_lo, hdr.owner_hi), (1, 0xDEAD_BEEF));
        assert_eq!(&hdr.name[..7], b"msm_cvp");

        let msg = table.queue(QueueRole::Message).header();
        assert_eq!(msg.start_addr, 0x9000_0000 + 0x1000 + 0x400);
        assert_eq!(msg.q_size, 0x100);
    }

    #[test]
    fn test_debug_shows_region() {
        let size = QueueTable::region_size(0x400);
        let region: Arc<dyn SharedMemory> = Arc::new(HeapMemory::new(size, 0x9000_0000));
        let table = QueueTable::create(region, 0x400, 0x200, 0).unwrap();

        let out = alloc::format!("{:?}", table);
        assert!(out.starts_with("QueueTable"));
        assert!(out.contains("device_addr: 2415919104"));
        assert!(out.contains("RingQueue"));
    }

    #[test]
    fn test_attach_sees_same_rings() {
        let size = QueueTable::region_size(0x400);
        let region: Arc<dyn SharedMemory> = Arc::new(HeapMemory::new(size, 0x9000_0000));
        let host = QueueTable::create(region.clone(), 0x400, 0x200, 0).unwrap();
        let peer = QueueTable::attach(region, 0x200).unwrap();

        let mut p = alloc::vec![0u8; 12];
        p[0] = 12;
        host.queue(QueueRole::Command).write(&p).unwrap();
        assert_eq!(peer.queue(QueueRole::Command).read().unwrap().packet, p);
    }

    #[test]
    fn test_crash_report_forces_terminator() {
        let region: Arc<dyn SharedMemory> = Arc::new(HeapMemory::new(16, 0));
        let sfr = CrashReport::new(region.clone());
        assert_eq!(region.read32(0), 16);
        assert_eq!(sfr.message(), "");

        region.write_words(4, &[u32::from_le_bytes(*b"abcd"); 3]);
        assert_eq!(sfr.message(), "abcdabcdabc");

        region.write32(8, u32::from_le_bytes(*b"xy\0z"));
        assert_eq!(sfr.message(), "abcdxy");
    }

    #[test]
    fn test_trace_table() {
        let region: Arc<dyn SharedMemory> = Arc::new(HeapMemory::new(64, 0x7000));
        let ranges = [
            TraceRange {
                start: 0x1000_0000,
                size: 0x1000,
            },
            TraceRange {
                start: 0x2000_0000,
                size: 0x2000,
            },
        ];
        let trace = TraceRegion::new(region.clone(), &ranges).unwrap();
        assert_eq!(region.read32(4), 0x7008);
        let entries = trace.entries();
        assert_eq!(entries[0].virtual_addr, QDSS_IOVA_START);
        assert_eq!(entries[1].virtual_addr, QDSS_IOVA_START + 0x1000);
        assert_eq!(entries[1].physical_addr, 0x2000_0000);
        assert!(TraceRegion::new(region, &[]).is_err());
    }

    #[test]
    fn test_allocate_and_release() {
        let mut alloc = HeapAllocator::new(0x8000_0000);
        let config = HfiConfig {
            fw_debug_mode: DEBUG_MODE_QDSS,
            dsp_enabled: true,
            ..small_config()
        };
        let ranges = [TraceRange {
            start: 0x100,
            size: 0x100,
        }];
        let mem = InterfaceMemory::allocate(&mut alloc, &config, &ranges, 0).unwrap();
        assert!(mem.sfr.is_some());
        assert!(mem.trace.is_some());
        assert!(mem.dsp.is_some());
        assert_eq!(alloc.outstanding(), 4);
        mem.release(&mut alloc);
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn test_no_trace_without_qdss_mode() {
        let mut alloc = HeapAllocator::new(0x8000_0000);
        let ranges = [TraceRange {
            start: 0x100,
            size: 0x100,
        }];
        let mem = InterfaceMemory::allocate(&mut alloc, &small_config(), &ranges, 0).unwrap();
        assert!(mem.trace.is_none());
        assert!(mem.dsp.is_none());
        assert_eq!(alloc.outstanding(), 2);
    }
}
