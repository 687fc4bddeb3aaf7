//! Legacy virtio-PCI transport and the split-ring walker.
//!
//! Every paravirtual device is a PCI function whose BAR0 exposes the
//! legacy (pre-1.0) virtio configuration block, and one or more virtqueues
//! living entirely in guest RAM:
//!
//! ```text
//! Guest driver                         Device back-end (argon)
//!   write descriptors ───┐
//!   publish avail.idx ───┼── shared ──► walk chains, do the I/O
//!   OUT queue-notify ────┘   memory ◄── write used ring, bump used.idx
//!        ▲                                    │
//!        └───────── IRQ edge ◄────────────────┘
//! ```
//!
//! The driver owns the descriptor table and the available ring; the device
//! owns the used ring. Ordering is the contract: the device acquires
//! `avail.idx` before trusting descriptors, and releases its used-ring
//! payload before bumping `used.idx`. The IRQ edge always follows the
//! index store.
//!
//! Reference: Virtual I/O Device (VIRTIO) v1.1, §2.6 (split virtqueues)
//! and §4.1 (legacy PCI interface).

pub mod blk;
pub mod net;

use crate::boot::{BootError, GuestMemory};
use std::sync::atomic::{fence, Ordering};
use thiserror::Error;

/// Legacy BAR0 register offsets.
mod bar {
    /// Device feature bits (u32, read-only).
    pub const HOST_FEATURES: u16 = 0x00;
    /// Features the driver accepted (u32).
    pub const GUEST_FEATURES: u16 = 0x04;
    /// Page frame number of the selected queue (u32); ring base = pfn << 12.
    pub const QUEUE_PFN: u16 = 0x08;
    /// Size of the selected queue (u16, read-only).
    pub const QUEUE_SIZE: u16 = 0x0c;
    /// Queue selector (u16).
    pub const QUEUE_SEL: u16 = 0x0e;
    /// Doorbell: the driver writes a queue index here (u16).
    pub const QUEUE_NOTIFY: u16 = 0x10;
    /// Device status (u8).
    pub const DEVICE_STATUS: u16 = 0x12;
    /// Interrupt status (u8); reading acknowledges.
    pub const ISR: u16 = 0x13;
    /// Device-specific configuration starts here.
    pub const CONFIG: u16 = 0x14;
}

/// Device status bits, in negotiation order.
pub mod status {
    pub const ACKNOWLEDGE: u8 = 1;
    pub const DRIVER: u8 = 2;
    pub const DRIVER_OK: u8 = 4;
    pub const FEATURES_OK: u8 = 8;
    /// Terminal: the device gave up and ignores the rings from here on.
    pub const FAILED: u8 = 0x80;
}

/// Descriptor flags.
mod desc_flags {
    /// Chain continues at `next`.
    pub const NEXT: u16 = 1;
    /// Buffer is device-writable.
    pub const WRITE: u16 = 2;
    /// Buffer holds an indirect descriptor table (never negotiated here).
    pub const INDIRECT: u16 = 4;
}

/// Driver-side interrupt suppression bit in `avail.flags`.
const AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Queue size presented for every queue. Power of two, within the legacy
/// limit of 1024.
pub const QUEUE_SIZE: u16 = 256;

/// Legacy ring alignment: the used ring starts on the next page boundary
/// after the available ring.
const RING_ALIGN: u64 = 4096;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("avail.idx {avail} is more than a queue ahead of {last}")]
    AvailIndexOutOfRange { avail: u16, last: u16 },

    #[error("descriptor chain starting at {0} exceeds the queue size")]
    ChainTooLong(u16),

    #[error("descriptor index {0} out of range")]
    BadDescriptorIndex(u16),

    #[error("descriptor [{addr:#x}, {addr:#x}+{len:#x}) outside guest memory")]
    AddressOutOfRange { addr: u64, len: u32 },

    #[error("device-readable descriptor after a device-writable one in chain {0}")]
    ReadableAfterWritable(u16),

    #[error("indirect descriptors are not negotiated")]
    Indirect,

    #[error(transparent)]
    Memory(#[from] BootError),
}

/// One descriptor table entry.
#[derive(Debug, Clone, Copy)]
struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

impl Descriptor {
    const SIZE: u64 = 16;

    fn read_from(mem: &GuestMemory, addr: u64) -> Result<Self, QueueError> {
        let mut raw = [0u8; Self::SIZE as usize];
        mem.read(addr, &mut raw)?;
        Ok(Self {
            addr: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            flags: u16::from_le_bytes(raw[12..14].try_into().unwrap()),
            next: u16::from_le_bytes(raw[14..16].try_into().unwrap()),
        })
    }
}

/// A guest buffer segment named by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u32,
}

/// A validated descriptor chain, split at the readable/writable boundary.
#[derive(Debug)]
pub struct Chain {
    /// Head descriptor index, echoed into the used ring.
    pub head: u16,
    /// Guest→device segments, in chain order.
    pub readable: Vec<Segment>,
    /// Device→guest segments, in chain order.
    pub writable: Vec<Segment>,
}

impl Chain {
    /// Read every readable segment into one buffer.
    pub fn read_all(&self, mem: &GuestMemory) -> Result<Vec<u8>, QueueError> {
        let total: usize = self.readable.iter().map(|s| s.len as usize).sum();
        let mut data = vec![0u8; total];
        let mut at = 0;
        for seg in &self.readable {
            mem.read(seg.addr, &mut data[at..at + seg.len as usize])?;
            at += seg.len as usize;
        }
        Ok(data)
    }

    /// Scatter `data` across the writable segments, truncating to their
    /// capacity. Returns the bytes actually written.
    pub fn write_all(&self, mem: &GuestMemory, data: &[u8]) -> Result<u32, QueueError> {
        let mut remaining = data;
        let mut written = 0u32;
        for seg in &self.writable {
            if remaining.is_empty() {
                break;
            }
            let take = remaining.len().min(seg.len as usize);
            mem.write(seg.addr, &remaining[..take])?;
            remaining = &remaining[take..];
            written += take as u32;
        }
        Ok(written)
    }
}

/// Device-side state of one legacy split virtqueue.
///
/// The three rings live contiguously in guest memory at `pfn << 12`:
/// descriptor table, then the available ring, then — on the next page
/// boundary — the used ring.
#[derive(Debug, Default)]
pub struct VirtQueue {
    pfn: u32,
    /// Next available-ring slot this device will consume.
    last_avail_idx: u16,
    /// Next used-ring slot this device will publish.
    used_idx: u16,
}

impl VirtQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pfn(&mut self, pfn: u32) {
        self.pfn = pfn;
        self.last_avail_idx = 0;
        self.used_idx = 0;
    }

    pub fn pfn(&self) -> u32 {
        self.pfn
    }

    /// The driver has placed the ring and told us where.
    pub fn ready(&self) -> bool {
        self.pfn != 0
    }

    fn desc_table(&self) -> u64 {
        (self.pfn as u64) << 12
    }

    fn avail_ring(&self) -> u64 {
        self.desc_table() + Descriptor::SIZE * QUEUE_SIZE as u64
    }

    fn used_ring(&self) -> u64 {
        // avail = flags + idx + ring[size] + used_event
        let avail_end = self.avail_ring() + 6 + 2 * QUEUE_SIZE as u64;
        avail_end.div_ceil(RING_ALIGN) * RING_ALIGN
    }

    /// Driver-published available index, acquired so the descriptors it
    /// covers are visible before we walk them.
    fn avail_idx(&self, mem: &GuestMemory) -> Result<u16, QueueError> {
        let idx = mem.read_u16(self.avail_ring() + 2)?;
        fence(Ordering::Acquire);
        Ok(idx)
    }

    /// True when the driver asked us not to interrupt on used-ring updates.
    pub fn interrupt_suppressed(&self, mem: &GuestMemory) -> bool {
        match mem.read_u16(self.avail_ring()) {
            Ok(flags) => flags & AVAIL_F_NO_INTERRUPT != 0,
            Err(_) => false,
        }
    }

    /// Pop the next pending chain, or `None` when the ring is idle.
    ///
    /// The walk is defensive against a broken or hostile driver: chain
    /// length is capped at the queue size (cycle break), every segment
    /// must lie inside guest RAM, and a readable descriptor after a
    /// writable one is malformed. Any violation is an error the device
    /// answers by entering FAILED.
    pub fn pop_chain(&mut self, mem: &GuestMemory) -> Result<Option<Chain>, QueueError> {
        if !self.ready() {
            return Ok(None);
        }

        let avail = self.avail_idx(mem)?;
        if avail == self.last_avail_idx {
            return Ok(None);
        }
        // The driver can be at most a full ring ahead of us.
        if avail.wrapping_sub(self.last_avail_idx) > QUEUE_SIZE {
            return Err(QueueError::AvailIndexOutOfRange {
                avail,
                last: self.last_avail_idx,
            });
        }

        let slot = self.avail_ring() + 4 + 2 * (self.last_avail_idx % QUEUE_SIZE) as u64;
        let head = mem.read_u16(slot)?;

        let mut chain = Chain {
            head,
            readable: Vec::new(),
            writable: Vec::new(),
        };

        let mut index = head;
        loop {
            if chain.readable.len() + chain.writable.len() == QUEUE_SIZE as usize {
                return Err(QueueError::ChainTooLong(head));
            }
            if index >= QUEUE_SIZE {
                return Err(QueueError::BadDescriptorIndex(index));
            }

            let desc =
                Descriptor::read_from(mem, self.desc_table() + index as u64 * Descriptor::SIZE)?;

            if desc.flags & desc_flags::INDIRECT != 0 {
                return Err(QueueError::Indirect);
            }
            if !mem.contains_range(desc.addr, desc.len as u64) {
                return Err(QueueError::AddressOutOfRange {
                    addr: desc.addr,
                    len: desc.len,
                });
            }

            let segment = Segment {
                addr: desc.addr,
                len: desc.len,
            };
            if desc.flags & desc_flags::WRITE != 0 {
                chain.writable.push(segment);
            } else {
                if !chain.writable.is_empty() {
                    return Err(QueueError::ReadableAfterWritable(head));
                }
                chain.readable.push(segment);
            }

            if desc.flags & desc_flags::NEXT == 0 {
                break;
            }
            index = desc.next;
        }

        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(Some(chain))
    }

    /// Publish a completed chain: element first, release fence, then the
    /// index bump the driver polls on.
    pub fn push_used(&mut self, mem: &GuestMemory, head: u16, len: u32) -> Result<(), QueueError> {
        let elem = self.used_ring() + 4 + 8 * (self.used_idx % QUEUE_SIZE) as u64;
        mem.write_u32(elem, head as u32)?;
        mem.write_u32(elem + 4, len)?;

        fence(Ordering::Release);

        self.used_idx = self.used_idx.wrapping_add(1);
        mem.write_u16(self.used_ring() + 2, self.used_idx)?;
        Ok(())
    }
}

/// Register state shared by every legacy virtio device.
pub struct Transport {
    device_features: u32,
    guest_features: u32,
    status: u8,
    isr: u8,
    queue_sel: u16,
    pub queues: Vec<VirtQueue>,
}

/// Side effect of a BAR write the device must act on.
#[derive(Debug, PartialEq, Eq)]
pub enum BarEffect {
    None,
    /// The driver rang the doorbell for this queue.
    Notify(u16),
}

impl Transport {
    pub fn new(device_features: u32, n_queues: usize) -> Self {
        Self {
            device_features,
            guest_features: 0,
            status: 0,
            isr: 0,
            queue_sel: 0,
            queues: (0..n_queues).map(|_| VirtQueue::new()).collect(),
        }
    }

    /// The driver completed negotiation and the device has not failed.
    pub fn active(&self) -> bool {
        self.status & status::DRIVER_OK != 0 && self.status & status::FAILED == 0
    }

    /// Latch FAILED; ring activity stops until the driver resets us.
    pub fn set_failed(&mut self) {
        self.status |= status::FAILED;
    }

    /// Raise the used-buffer interrupt status bit. The caller follows up
    /// with the IRQ edge.
    pub fn raise_isr(&mut self) {
        self.isr |= 1;
    }

    fn selected_queue(&mut self) -> Option<&mut VirtQueue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    pub fn bar_read(&mut self, offset: u16, data: &mut [u8], config: &[u8]) {
        match offset {
            bar::HOST_FEATURES => put(data, &self.device_features.to_le_bytes()),
            bar::GUEST_FEATURES => put(data, &self.guest_features.to_le_bytes()),
            bar::QUEUE_PFN => {
                let pfn = self
                    .queues
                    .get(self.queue_sel as usize)
                    .map_or(0, VirtQueue::pfn);
                put(data, &pfn.to_le_bytes());
            }
            bar::QUEUE_SIZE => {
                // Size zero tells the driver the selected queue does not
                // exist.
                let size = if (self.queue_sel as usize) < self.queues.len() {
                    QUEUE_SIZE
                } else {
                    0
                };
                put(data, &size.to_le_bytes());
            }
            bar::QUEUE_SEL => put(data, &self.queue_sel.to_le_bytes()),
            bar::QUEUE_NOTIFY => put(data, &[0, 0]),
            bar::DEVICE_STATUS => put(data, &[self.status]),
            bar::ISR => {
                // Read-to-acknowledge.
                put(data, &[self.isr]);
                self.isr = 0;
            }
            _ => {
                // Device config window; anything else (including odd
                // offsets into the register block) reads as zero.
                let at = offset.checked_sub(bar::CONFIG).map(usize::from);
                for (i, slot) in data.iter_mut().enumerate() {
                    *slot = at.and_then(|a| config.get(a + i)).copied().unwrap_or(0);
                }
            }
        }
    }

    pub fn bar_write(&mut self, offset: u16, data: &[u8]) -> BarEffect {
        match offset {
            bar::GUEST_FEATURES if data.len() >= 4 => {
                self.guest_features = u32::from_le_bytes(data[..4].try_into().unwrap());
            }
            bar::QUEUE_PFN if data.len() >= 4 => {
                let pfn = u32::from_le_bytes(data[..4].try_into().unwrap());
                if let Some(queue) = self.selected_queue() {
                    queue.set_pfn(pfn);
                }
            }
            bar::QUEUE_SEL if data.len() >= 2 => {
                self.queue_sel = u16::from_le_bytes(data[..2].try_into().unwrap());
            }
            bar::QUEUE_NOTIFY if data.len() >= 2 => {
                return BarEffect::Notify(u16::from_le_bytes(data[..2].try_into().unwrap()));
            }
            bar::DEVICE_STATUS if !data.is_empty() => {
                self.status = data[0];
                if self.status == 0 {
                    // Driver reset.
                    for queue in &mut self.queues {
                        queue.set_pfn(0);
                    }
                    self.guest_features = 0;
                    self.isr = 0;
                }
            }
            _ => {}
        }
        BarEffect::None
    }
}

fn put(data: &mut [u8], value: &[u8]) {
    for (i, slot) in data.iter_mut().enumerate() {
        *slot = value.get(i).copied().unwrap_or(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PFN: u32 = 4; // rings at 0x4000

    struct Ring {
        mem: GuestMemory,
        queue: VirtQueue,
    }

    /// Hand-built ring the way a driver would lay it out.
    impl Ring {
        fn new() -> Self {
            let mem = GuestMemory::new(1 << 20).unwrap();
            // The walker only trusts zeroed state.
            mem.write(PFN as u64 * 4096, &vec![0u8; 3 * 4096]).unwrap();
            let mut queue = VirtQueue::new();
            queue.set_pfn(PFN);
            Self { mem, queue }
        }

        fn write_desc(&self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
            let at = self.queue.desc_table() + index as u64 * 16;
            self.mem.write_u64(at, addr).unwrap();
            self.mem.write_u32(at + 8, len).unwrap();
            self.mem.write_u16(at + 12, flags).unwrap();
            self.mem.write_u16(at + 14, next).unwrap();
        }

        fn publish(&self, slot: u16, head: u16) {
            let avail = self.queue.avail_ring();
            self.mem.write_u16(avail + 4 + 2 * slot as u64, head).unwrap();
            self.mem.write_u16(avail + 2, slot + 1).unwrap();
        }
    }

    #[test]
    fn test_idle_queue_pops_nothing() {
        let mut ring = Ring::new();
        assert!(ring.queue.pop_chain(&ring.mem).unwrap().is_none());

        let mut unplaced = VirtQueue::new();
        assert!(unplaced.pop_chain(&ring.mem).unwrap().is_none());
    }

    #[test]
    fn test_chain_walk_in_order() {
        let mut ring = Ring::new();
        ring.write_desc(0, 0x8000, 16, desc_flags::NEXT, 1);
        ring.write_desc(1, 0x9000, 32, desc_flags::NEXT, 2);
        ring.write_desc(2, 0xa000, 1, desc_flags::WRITE, 0);
        ring.publish(0, 0);

        let chain = ring.queue.pop_chain(&ring.mem).unwrap().unwrap();
        assert_eq!(chain.head, 0);
        assert_eq!(
            chain.readable,
            vec![
                Segment { addr: 0x8000, len: 16 },
                Segment { addr: 0x9000, len: 32 },
            ]
        );
        assert_eq!(chain.writable, vec![Segment { addr: 0xa000, len: 1 }]);

        // Consumed; ring is idle again.
        assert!(ring.queue.pop_chain(&ring.mem).unwrap().is_none());
    }

    #[test]
    fn test_runaway_avail_idx_rejected() {
        let mut ring = Ring::new();
        ring.write_desc(0, 0x8000, 8, 0, 0);
        ring.mem.write_u16(ring.queue.avail_ring() + 4, 0).unwrap();
        ring.mem
            .write_u16(ring.queue.avail_ring() + 2, QUEUE_SIZE + 2)
            .unwrap();

        assert!(matches!(
            ring.queue.pop_chain(&ring.mem),
            Err(QueueError::AvailIndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_cycle_is_broken() {
        let mut ring = Ring::new();
        ring.write_desc(0, 0x8000, 8, desc_flags::NEXT, 1);
        ring.write_desc(1, 0x8100, 8, desc_flags::NEXT, 0);
        ring.publish(0, 0);

        assert!(matches!(
            ring.queue.pop_chain(&ring.mem),
            Err(QueueError::ChainTooLong(0))
        ));
    }

    #[test]
    fn test_out_of_range_segment_rejected() {
        let mut ring = Ring::new();
        ring.write_desc(0, (1 << 20) - 8, 64, 0, 0);
        ring.publish(0, 0);

        assert!(matches!(
            ring.queue.pop_chain(&ring.mem),
            Err(QueueError::AddressOutOfRange { .. })
        ));
    }

    #[test]
    fn test_readable_after_writable_rejected() {
        let mut ring = Ring::new();
        ring.write_desc(0, 0x8000, 8, desc_flags::WRITE | desc_flags::NEXT, 1);
        ring.write_desc(1, 0x8100, 8, 0, 0);
        ring.publish(0, 0);

        assert!(matches!(
            ring.queue.pop_chain(&ring.mem),
            Err(QueueError::ReadableAfterWritable(0))
        ));
    }

    #[test]
    fn test_used_ring_publication() {
        let mut ring = Ring::new();
        ring.write_desc(0, 0x8000, 8, 0, 0);
        ring.publish(0, 0);
        ring.queue.pop_chain(&ring.mem).unwrap().unwrap();

        ring.queue.push_used(&ring.mem, 0, 42).unwrap();

        let used = ring.queue.used_ring();
        assert_eq!(ring.mem.read_u16(used + 2).unwrap(), 1);
        assert_eq!(ring.mem.read_u32(used + 4).unwrap(), 0); // id
        assert_eq!(ring.mem.read_u32(used + 8).unwrap(), 42); // len
    }

    #[test]
    fn test_interrupt_suppression_flag() {
        let ring = Ring::new();
        assert!(!ring.queue.interrupt_suppressed(&ring.mem));
        ring.mem.write_u16(ring.queue.avail_ring(), 1).unwrap();
        assert!(ring.queue.interrupt_suppressed(&ring.mem));
    }

    #[test]
    fn test_chain_read_write_helpers() {
        let mut ring = Ring::new();
        ring.mem.write(0x8000, b"abcd").unwrap();
        ring.write_desc(0, 0x8000, 4, desc_flags::NEXT, 1);
        ring.write_desc(1, 0x9000, 3, desc_flags::WRITE | desc_flags::NEXT, 2);
        ring.write_desc(2, 0xa000, 3, desc_flags::WRITE, 0);
        ring.publish(0, 0);

        let chain = ring.queue.pop_chain(&ring.mem).unwrap().unwrap();
        assert_eq!(chain.read_all(&ring.mem).unwrap(), b"abcd");

        let written = chain.write_all(&ring.mem, b"012345678").unwrap();
        assert_eq!(written, 6); // truncated to capacity
        let mut buf = [0u8; 3];
        ring.mem.read(0x9000, &mut buf).unwrap();
        assert_eq!(&buf, b"012");
        ring.mem.read(0xa000, &mut buf).unwrap();
        assert_eq!(&buf, b"345");
    }

    #[test]
    fn test_transport_negotiation_registers() {
        let mut t = Transport::new(0x20, 2);

        let mut word = [0u8; 4];
        t.bar_read(0x00, &mut word, &[]);
        assert_eq!(u32::from_le_bytes(word), 0x20);

        assert_eq!(t.bar_write(0x04, &0x20u32.to_le_bytes()), BarEffect::None);
        t.bar_read(0x04, &mut word, &[]);
        assert_eq!(u32::from_le_bytes(word), 0x20);

        // Select queue 1, place its ring.
        t.bar_write(0x0e, &1u16.to_le_bytes());
        t.bar_write(0x08, &7u32.to_le_bytes());
        assert_eq!(t.queues[1].pfn(), 7);
        assert_eq!(t.queues[0].pfn(), 0);

        let mut half = [0u8; 2];
        t.bar_read(0x0c, &mut half, &[]);
        assert_eq!(u16::from_le_bytes(half), QUEUE_SIZE);

        // A selector past the last queue reads size zero.
        t.bar_write(0x0e, &5u16.to_le_bytes());
        t.bar_read(0x0c, &mut half, &[]);
        assert_eq!(u16::from_le_bytes(half), 0);
        t.bar_write(0x0e, &1u16.to_le_bytes());

        assert_eq!(
            t.bar_write(0x10, &1u16.to_le_bytes()),
            BarEffect::Notify(1)
        );
    }

    #[test]
    fn test_transport_status_and_isr() {
        let mut t = Transport::new(0, 1);
        assert!(!t.active());

        t.bar_write(0x12, &[status::ACKNOWLEDGE | status::DRIVER | status::DRIVER_OK]);
        assert!(t.active());

        t.set_failed();
        assert!(!t.active());

        t.raise_isr();
        let mut byte = [0u8; 1];
        t.bar_read(0x13, &mut byte, &[]);
        assert_eq!(byte[0], 1);
        t.bar_read(0x13, &mut byte, &[]);
        assert_eq!(byte[0], 0); // read cleared it

        // Reset clears rings and features.
        t.queues[0].set_pfn(9);
        t.bar_write(0x12, &[0]);
        assert_eq!(t.queues[0].pfn(), 0);
        assert!(!t.active());
    }

    #[test]
    fn test_transport_config_window() {
        let mut t = Transport::new(0, 1);
        let config = [0xaa, 0xbb, 0xcc];
        let mut data = [0u8; 2];
        t.bar_read(0x14, &mut data, &config);
        assert_eq!(data, [0xaa, 0xbb]);
        t.bar_read(0x16, &mut data, &config);
        assert_eq!(data, [0xcc, 0x00]);
    }
}
