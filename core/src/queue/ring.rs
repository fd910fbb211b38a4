//! # Ring Queue
//!
//! One single-producer, single-consumer ring shared with the firmware.
//!
//! The ring is an array of 32-bit words plus a [`QueueHeader`] holding the
//! read and write indices (in words) and the flow-control request flags.
//! Every packet starts with its total size in bytes, so the consumer knows
//! how much to copy without a side channel. Packets may wrap around the end
//! of the array.
//!
//! The host and the firmware never share a lock. Ordering is carried by
//! barriers: payload before write index on the producer side, indices
//! before payload on the consumer side.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::{offset_of, size_of};

use cvp_hal::barrier::mb;
use cvp_hal::SharedMemory;
use spin::Mutex;
use static_assertions::{assert_eq_size, const_assert_eq};

use crate::packet::packet_size;
use crate::{HfiError, Result};

// =============================================================================
// HEADER LAYOUT
// =============================================================================

/// Shared queue header, as laid out in memory
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueHeader {
    /// 1 when the queue is active
    pub status: u32,
    /// Device address of the queue array
    pub start_addr: u32,
    /// Role flag ORed with the default type
    pub queue_type: u32,
    /// Capacity in words
    pub q_size: u32,
    /// Fixed packet size (unused, 0)
    pub pkt_size: u32,
    /// Packets dropped by the firmware
    pub pkt_drop_cnt: u32,
    /// Receive watermark
    pub rx_wm: u32,
    /// Transmit watermark
    pub tx_wm: u32,
    /// Consumer wants an interrupt on the next write
    pub rx_req: u32,
    /// Producer wants an interrupt once space frees up
    pub tx_req: u32,
    /// Receive interrupt status
    pub rx_irq_status: u32,
    /// Transmit interrupt status
    pub tx_irq_status: u32,
    /// Read index in words
    pub read_idx: u32,
    /// Write index in words
    pub write_idx: u32,
}

assert_eq_size!(QueueHeader, [u32; 14]);
const_assert_eq!(offset_of!(QueueHeader, rx_req), 32);
const_assert_eq!(offset_of!(QueueHeader, write_idx), 52);

/// Bytes in a [`QueueHeader`]
pub const QUEUE_HEADER_SIZE: usize = size_of::<QueueHeader>();

/// Default queue type, ORed with the role
pub const QUEUE_TYPE_DEFAULT: u32 = 0x0101_0000;

const STATUS: usize = offset_of!(QueueHeader, status);
const START_ADDR: usize = offset_of!(QueueHeader, start_addr);
const QUEUE_TYPE: usize = offset_of!(QueueHeader, queue_type);
const Q_SIZE: usize = offset_of!(QueueHeader, q_size);
const RX_WM: usize = offset_of!(QueueHeader, rx_wm);
const TX_WM: usize = offset_of!(QueueHeader, tx_wm);
const RX_REQ: usize = offset_of!(QueueHeader, rx_req);
const TX_REQ: usize = offset_of!(QueueHeader, tx_req);
const READ_IDX: usize = offset_of!(QueueHeader, read_idx);
const WRITE_IDX: usize = offset_of!(QueueHeader, write_idx);

/// Which of the three queues a ring is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueueRole {
    /// Host to firmware commands
    Command = 0,
    /// Firmware to host responses
    Message = 1,
    /// Firmware to host log lines
    Debug = 2,
}

impl QueueRole {
    /// All roles in table order
    pub const ALL: [QueueRole; 3] = [Self::Command, Self::Message, Self::Debug];

    /// Index of the queue in the table
    pub const fn index(self) -> usize {
        self as usize
    }
}

// =============================================================================
// RING QUEUE
// =============================================================================

/// Queue statistics, guarded by the queue lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Packets written
    pub written: u64,
    /// Packets read
    pub read: u64,
    /// Writes refused for lack of space
    pub full: u64,
    /// Packets dropped as corrupt
    pub corrupt: u64,
}

/// Result of a successful read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Packet bytes, starting with the size word
    pub packet: Vec<u8>,
    /// The producer asked to be told about freed space
    pub tx_requested: bool,
}

/// A ring in shared memory
pub struct RingQueue {
    role: QueueRole,
    mem: Arc<dyn SharedMemory>,
    header: usize,
    array: usize,
    capacity: u32,
    max_packet: usize,
    lock: Mutex<QueueStats>,
}

impl core::fmt::Debug for RingQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingQueue")
            .field("role", &self.role)
            .field("header", &self.header)
            .field("array", &self.array)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl RingQueue {
    /// View an existing ring
    ///
    /// `header` and `array` are byte offsets into `mem`, `capacity` is the
    /// array length in words.
    pub fn attach(
        role: QueueRole,
        mem: Arc<dyn SharedMemory>,
        header: usize,
        array: usize,
        capacity: u32,
        max_packet: usize,
    ) -> Result<Self> {
        let array_bytes = capacity as usize * 4;
        if capacity < 2
            || header % 4 != 0
            || array % 4 != 0
            || header + QUEUE_HEADER_SIZE > mem.size()
            || array + array_bytes > mem.size()
        {
            log::error!(
                "{:?} queue does not fit: hdr {:#x} array {:#x}+{:#x} in {:#x}",
                role,
                header,
                array,
                array_bytes,
                mem.size()
            );
            return Err(HfiError::InvalidArgument);
        }
        Ok(Self {
            role,
            mem,
            header,
            array,
            capacity,
            max_packet,
            lock: Mutex::new(QueueStats::default()),
        })
    }

    /// Reset the shared header to its defaults
    pub fn init_header(&self) {
        let _guard = self.lock.lock();
        let mut hdr = QueueHeader {
            status: 1,
            start_addr: (self.mem.device_addr() + self.array as u64) as u32,
            queue_type: QUEUE_TYPE_DEFAULT | self.role as u32,
            q_size: self.capacity,
            rx_wm: 1,
            tx_wm: 1,
            rx_req: 1,
            ..QueueHeader::default()
        };
        // No interrupts for log lines
        if self.role == QueueRole::Debug {
            hdr.rx_req = 0;
        }
        self.store_header(&hdr);
        mb();
    }

    /// Queue role
    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Capacity in words
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Snapshot of the shared header
    pub fn header(&self) -> QueueHeader {
        let mut words = [0u32; 14];
        self.mem.read_words(self.header, &mut words);
        QueueHeader {
            status: words[0],
            start_addr: words[1],
            queue_type: words[2],
            q_size: words[3],
            pkt_size: words[4],
            pkt_drop_cnt: words[5],
            rx_wm: words[6],
            tx_wm: words[7],
            rx_req: words[8],
            tx_req: words[9],
            rx_irq_status: words[10],
            tx_irq_status: words[11],
            read_idx: words[12],
            write_idx: words[13],
        }
    }

    /// Counters since attach
    pub fn stats(&self) -> QueueStats {
        *self.lock.lock()
    }

    /// Whether the ring currently holds no packet
    pub fn is_empty(&self) -> bool {
        self.field(READ_IDX) == self.field(WRITE_IDX)
    }

    /// Append one packet
    ///
    /// Returns `true` when the consumer asked for a doorbell. On
    /// [`HfiError::QueueFull`] the tx request flag is left set so the
    /// consumer signals once it has drained.
    pub fn write(&self, packet: &[u8]) -> Result<bool> {
        let size = packet_size(packet).ok_or(HfiError::InvalidArgument)? as usize;
        if size == 0 || size % 4 != 0 || size > packet.len() {
            log::error!("{:?} queue: bad packet size {:#x}", self.role, size);
            return Err(HfiError::InvalidArgument);
        }
        let words = size / 4;
        if words >= self.capacity as usize || size > self.max_packet {
            log::error!("{:?} queue: packet of {} bytes never fits", self.role, size);
            return Err(HfiError::PacketTooLarge);
        }
        let words = words as u32;

        let mut stats = self.lock.lock();
        let read = self.field(READ_IDX);
        let write = self.field(WRITE_IDX);
        if read >= self.capacity || write >= self.capacity {
            log::error!("{:?} queue: indices out of range r {} w {}", self.role, read, write);
            return Err(HfiError::CorruptPacket);
        }

        let empty = if write >= read {
            self.capacity - (write - read)
        } else {
            read - write
        };
        if empty <= words {
            self.set_field(TX_REQ, 1);
            stats.full += 1;
            log::debug!("{:?} queue full: need {} words, {} free", self.role, words, empty);
            return Err(HfiError::QueueFull);
        }
        self.set_field(TX_REQ, 0);

        let data: Vec<u32> = packet[..size]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let new_write = self.copy_in(write, &data);

        // Payload must land before the index moves
        mb();
        self.set_field(WRITE_IDX, new_write);
        mb();

        stats.written += 1;
        Ok(self.field(RX_REQ) == 1)
    }

    /// Take the oldest packet
    ///
    /// Only the message queue arms its rx request when empty, debug-queue
    /// interrupts would be pure noise. A corrupt packet is dropped by
    /// moving the read index up to the write index.
    pub fn read(&self) -> Result<ReadOutcome> {
        let mut stats = self.lock.lock();
        let receive_request = u32::from(self.role == QueueRole::Message);

        mb();
        let read = self.field(READ_IDX);
        let write = self.field(WRITE_IDX);

        if read == write {
            self.set_field(RX_REQ, receive_request);
            mb();
            // The producer may have written between the check and the arm
            if self.field(WRITE_IDX) == write {
                return Err(HfiError::QueueEmpty);
            }
            self.set_field(RX_REQ, 0);
        }

        // Payload loads must not pass the index loads
        mb();
        let size = if read < self.capacity {
            self.mem.read32(self.array + read as usize * 4) as usize
        } else {
            0
        };
        if read >= self.capacity
            || size == 0
            || size % 4 != 0
            || size > self.max_packet
            || size / 4 >= self.capacity as usize
        {
            log::warn!(
                "{:?} queue: bad packet at {:#x}, size {:#x}, dropping",
                self.role,
                read,
                size
            );
            let resync = self.field(WRITE_IDX);
            self.set_field(RX_REQ, receive_request);
            self.set_field(READ_IDX, resync);
            mb();
            stats.corrupt += 1;
            return Err(HfiError::CorruptPacket);
        }

        let (data, new_read) = self.copy_out(read, (size / 4) as u32);

        let rx_req = if new_read != self.field(WRITE_IDX) {
            0
        } else {
            receive_request
        };
        self.set_field(RX_REQ, rx_req);
        self.set_field(READ_IDX, new_read);
        let tx_requested = self.field(TX_REQ) == 1;
        mb();

        stats.read += 1;
        let packet = data.iter().flat_map(|w| w.to_le_bytes()).collect();
        Ok(ReadOutcome {
            packet,
            tx_requested,
        })
    }

    fn copy_in(&self, write: u32, data: &[u32]) -> u32 {
        let new_write = write + data.len() as u32;
        let at = self.array + write as usize * 4;
        if new_write < self.capacity {
            self.mem.write_words(at, data);
            return new_write;
        }
        let head = (self.capacity - write) as usize;
        self.mem.write_words(at, &data[..head]);
        self.mem.write_words(self.array, &data[head..]);
        new_write - self.capacity
    }

    fn copy_out(&self, read: u32, words: u32) -> (Vec<u32>, u32) {
        let mut data = alloc::vec![0u32; words as usize];
        let new_read = read + words;
        let at = self.array + read as usize * 4;
        if new_read < self.capacity {
            self.mem.read_words(at, &mut data);
            return (data, new_read);
        }
        let head = (self.capacity - read) as usize;
        self.mem.read_words(at, &mut data[..head]);
        self.mem.read_words(self.array, &mut data[head..]);
        (data, new_read - self.capacity)
    }

    fn field(&self, offset: usize) -> u32 {
        self.mem.read32(self.header + offset)
    }

    fn set_field(&self, offset: usize, value: u32) {
        self.mem.write32(self.header + offset, value);
    }

    fn store_header(&self, hdr: &QueueHeader) {
        self.mem.zero(self.header, QUEUE_HEADER_SIZE);
        self.set_field(STATUS, hdr.status);
        self.set_field(START_ADDR, hdr.start_addr);
        self.set_field(QUEUE_TYPE, hdr.queue_type);
        self.set_field(Q_SIZE, hdr.q_size);
        self.set_field(RX_WM, hdr.rx_wm);
        self.set_field(TX_WM, hdr.tx_wm);
        self.set_field(RX_REQ, hdr.rx_req);
        self.set_field(TX_REQ, hdr.tx_req);
        self.set_field(READ_IDX, hdr.read_idx);
        self.set_field(WRITE_IDX, hdr.write_idx);
    }

    #[cfg(test)]
    fn force_indices(&self, read: u32, write: u32) {
        self.set_field(READ_IDX, read);
        self.set_field(WRITE_IDX, write);
    }

    #[cfg(test)]
    fn poke_array(&self, index: u32, value: u32) {
        self.mem.write32(self.array + index as usize * 4, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvp_hal::memory::HeapMemory;

    fn packet(words: usize, fill: u8) -> Vec<u8> {
        let mut p = alloc::vec![fill; words * 4];
        p[..4].copy_from_slice(&((words * 4) as u32).to_le_bytes());
        p
    }

    fn ring(role: QueueRole, capacity: u32) -> RingQueue {
        let mem = Arc::new(HeapMemory::new(QUEUE_HEADER_SIZE + capacity as usize * 4, 0x1000));
        let q = RingQueue::attach(role, mem, 0, QUEUE_HEADER_SIZE, capacity, 4096).unwrap();
        q.init_header();
        q
    }

    #[test]
    fn test_header_defaults() {
        let q = ring(QueueRole::Debug, 64);
        let hdr = q.header();
        assert_eq!(hdr.status, 1);
        assert_eq!(hdr.queue_type, QUEUE_TYPE_DEFAULT | 2);
        assert_eq!(hdr.q_size, 64);
        assert_eq!(hdr.start_addr, 0x1000 + QUEUE_HEADER_SIZE as u32);
        assert_eq!(hdr.rx_req, 0);
        assert_eq!((hdr.read_idx, hdr.write_idx), (0, 0));
        assert_eq!(ring(QueueRole::Message, 64).header().rx_req, 1);
    }

    /// Peer that publishes a packet the moment the consumer arms rx_req
    struct LatePeer {
        inner: HeapMemory,
        packet: Vec<u32>,
        fired: core::sync::atomic::AtomicBool,
    }

    impl SharedMemory for LatePeer {
        fn device_addr(&self) -> u64 {
            self.inner.device_addr()
        }

        fn size(&self) -> usize {
            self.inner.size()
        }

        fn read32(&self, offset: usize) -> u32 {
            self.inner.read32(offset)
        }

        fn write32(&self, offset: usize, value: u32) {
            self.inner.write32(offset, value);
            if offset == RX_REQ
                && value == 1
                && !self.fired.swap(true, core::sync::atomic::Ordering::SeqCst)
            {
                self.inner.write_words(QUEUE_HEADER_SIZE, &self.packet);
                self.inner.write32(WRITE_IDX, self.packet.len() as u32);
            }
        }
    }

    #[test]
    fn test_read_sees_packet_published_while_arming() {
        let words: Vec<u32> = alloc::vec![16, 0x11, 0x22, 0x33];
        let mem = Arc::new(LatePeer {
            inner: HeapMemory::new(QUEUE_HEADER_SIZE + 64 * 4, 0x1000),
            packet: words.clone(),
            fired: core::sync::atomic::AtomicBool::new(false),
        });
        let q = RingQueue::attach(QueueRole::Message, mem.clone(), 0, QUEUE_HEADER_SIZE, 64, 4096)
            .unwrap();
        q.init_header();
        // init_header armed rx_req and triggered the peer; reset for the read
        mem.fired.store(false, core::sync::atomic::Ordering::SeqCst);
        mem.inner.write32(WRITE_IDX, 0);
        mem.inner.write32(RX_REQ, 0);

        let out = q.read().unwrap();
        let expected: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        assert_eq!(out.packet, expected);
        assert_eq!(q.header().read_idx, 4);
        assert_eq!(q.header().rx_req, 1);
    }

    #[test]
    fn test_write_read_in_order() {
        let q = ring(QueueRole::Message, 64);
        let a = packet(3, 0xAA);
        let b = packet(5, 0xBB);
        assert!(q.write(&a).unwrap());
        assert!(q.write(&b).is_ok());
        assert_eq!(q.read().unwrap().packet, a);
        assert_eq!(q.read().unwrap().packet, b);
        assert_eq!(q.read(), Err(HfiError::QueueEmpty));
        assert_eq!(q.stats().read, 2);
    }

    #[test]
    fn test_wrapping_write_splits() {
        let q = ring(QueueRole::Command, 256);
        q.force_indices(250, 250);
        let p = packet(40, 0x5A);
        q.write(&p).unwrap();
        assert_eq!(q.header().write_idx, 34);
        assert_eq!(q.read().unwrap().packet, p);
        assert_eq!(q.header().read_idx, 34);
    }

    #[test]
    fn test_write_exactly_to_end() {
        let q = ring(QueueRole::Command, 16);
        q.force_indices(10, 10);
        q.write(&packet(6, 1)).unwrap();
        assert_eq!(q.header().write_idx, 0);
        assert_eq!(q.read().unwrap().packet, packet(6, 1));
    }

    #[test]
    fn test_oversized_leaves_indices() {
        let q = ring(QueueRole::Command, 16);
        q.write(&packet(2, 0)).unwrap();
        let before = q.header();
        assert_eq!(q.write(&packet(16, 0)), Err(HfiError::PacketTooLarge));
        assert_eq!(q.write(&packet(40, 0)), Err(HfiError::PacketTooLarge));
        assert_eq!(q.header(), before);
    }

    #[test]
    fn test_bad_write_sizes() {
        let q = ring(QueueRole::Command, 16);
        let mut p = packet(2, 0);
        p[..4].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(q.write(&p), Err(HfiError::InvalidArgument));
        p[..4].copy_from_slice(&6u32.to_le_bytes());
        assert_eq!(q.write(&p), Err(HfiError::InvalidArgument));
        assert_eq!(q.write(&[1, 0]), Err(HfiError::InvalidArgument));
    }

    #[test]
    fn test_full_sets_then_clears_tx_request() {
        let q = ring(QueueRole::Command, 16);
        q.write(&packet(8, 1)).unwrap();
        assert_eq!(q.write(&packet(8, 2)), Err(HfiError::QueueFull));
        assert_eq!(q.header().tx_req, 1);
        assert_eq!(q.stats().full, 1);

        let out = q.read().unwrap();
        assert!(out.tx_requested);
        q.write(&packet(8, 2)).unwrap();
        assert_eq!(q.header().tx_req, 0);
    }

    #[test]
    fn test_empty_read_is_idempotent() {
        let q = ring(QueueRole::Message, 32);
        q.write(&packet(2, 1)).unwrap();
        q.read().unwrap();
        let before = q.header();
        assert_eq!(q.read(), Err(HfiError::QueueEmpty));
        assert_eq!(q.read(), Err(HfiError::QueueEmpty));
        let after = q.header();
        assert_eq!(after.read_idx, before.read_idx);
        assert_eq!(after.rx_req, 1);
    }

    #[test]
    fn test_debug_queue_never_arms_rx() {
        let q = ring(QueueRole::Debug, 32);
        assert_eq!(q.read(), Err(HfiError::QueueEmpty));
        assert_eq!(q.header().rx_req, 0);
    }

    #[test]
    fn test_zero_size_resyncs() {
        let q = ring(QueueRole::Message, 32);
        q.write(&packet(4, 1)).unwrap();
        q.poke_array(0, 0);
        assert_eq!(q.read(), Err(HfiError::CorruptPacket));
        assert!(q.is_empty());
        assert_eq!(q.stats().corrupt, 1);

        let p = packet(3, 7);
        q.write(&p).unwrap();
        assert_eq!(q.read().unwrap().packet, p);
    }

    #[test]
    fn test_huge_size_resyncs() {
        let q = ring(QueueRole::Message, 32);
        q.write(&packet(4, 1)).unwrap();
        q.write(&packet(4, 2)).unwrap();
        q.poke_array(0, 0x10_0000);
        assert_eq!(q.read(), Err(HfiError::CorruptPacket));
        let hdr = q.header();
        assert_eq!(hdr.read_idx, hdr.write_idx);
        let p = packet(5, 9);
        q.write(&p).unwrap();
        assert_eq!(q.read().unwrap().packet, p);
    }

    #[test]
    fn test_read_clears_rx_request_while_data_remains() {
        let q = ring(QueueRole::Message, 32);
        q.write(&packet(2, 1)).unwrap();
        q.write(&packet(2, 2)).unwrap();
        q.read().unwrap();
        assert_eq!(q.header().rx_req, 0);
        q.read().unwrap();
        assert_eq!(q.header().rx_req, 1);
    }

    #[test]
    fn test_attach_rejects_overflow() {
        let mem: Arc<dyn SharedMemory> = Arc::new(HeapMemory::new(128, 0));
        assert!(RingQueue::attach(QueueRole::Command, mem, 0, 64, 32, 64).is_err());
    }
}
