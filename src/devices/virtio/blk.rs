//! Virtio-blk back-end over a raw disk image.
//!
//! One queue. Every request chain carries a 16-byte device-readable
//! header, data descriptors, and a one-byte device-writable status:
//!
//! ```text
//! +----------------------+  readable
//! | type:u32 _:u32       |  0 = read, 1 = write, 4 = flush
//! | sector:u64           |  in 512-byte units
//! +----------------------+  readable (write) / writable (read)
//! | data ...             |
//! +----------------------+  writable
//! | status:u8            |  0 = OK, 1 = IOERR, 2 = UNSUPP
//! +----------------------+
//! ```
//!
//! A worker thread parks on the doorbell and services requests with
//! positional I/O against the image. A host I/O failure completes the
//! request with status 1 so the guest sees the error, then latches the
//! device FAILED — the same terminal answer ring corruption gets. It
//! never kills the VMM.

use super::{BarEffect, Chain, Segment, Transport};
use crate::boot::GuestMemory;
use crate::devices::pci::{ConfigSpace, PciDevice};
use crate::kvm::IrqTrigger;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

const SECTOR_SIZE: u64 = 512;

/// VIRTIO_BLK_F_FLUSH: the guest may submit flush requests.
const FEATURE_FLUSH: u32 = 1 << 9;

// Request types.
const REQUEST_READ: u32 = 0;
const REQUEST_WRITE: u32 = 1;
const REQUEST_FLUSH: u32 = 4;

// Status codes.
const STATUS_OK: u8 = 0;
const STATUS_IOERR: u8 = 1;
const STATUS_UNSUPPORTED: u8 = 2;

const REQUEST_HEADER_SIZE: usize = 16;

/// Virtio-blk device model plus its image file.
pub struct VirtioBlk {
    transport: Mutex<Transport>,
    config: Mutex<ConfigSpace>,
    disk: File,
    /// Capacity in sectors, exposed through config space.
    capacity: u64,
    mem: Arc<GuestMemory>,
    irq: Arc<dyn IrqTrigger>,
    io_base: u16,
    pending: Mutex<bool>,
    doorbell: Condvar,
}

impl VirtioBlk {
    pub fn new(
        disk_path: &Path,
        mem: Arc<GuestMemory>,
        irq: Arc<dyn IrqTrigger>,
        io_base: u16,
        irq_line: u8,
    ) -> io::Result<Self> {
        let disk = OpenOptions::new().read(true).write(true).open(disk_path)?;
        let capacity = disk.metadata()?.len() / SECTOR_SIZE;

        let mut config = ConfigSpace::new(0x1af4, 0x1001, 0x01_80_00, 2);
        config.set_bar0_io(io_base, 64);
        config.set_interrupt(irq_line, 1);

        log::info!(
            "virtio-blk: {} ({capacity} sectors)",
            disk_path.display()
        );

        Ok(Self {
            transport: Mutex::new(Transport::new(FEATURE_FLUSH, 1)),
            config: Mutex::new(config),
            disk,
            capacity,
            mem,
            irq,
            io_base,
            pending: Mutex::new(false),
            doorbell: Condvar::new(),
        })
    }

    /// Start the request worker. It runs for the life of the process.
    pub fn start(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        thread::Builder::new()
            .name("virtio-blk".into())
            .spawn(move || worker.worker_loop())
            .expect("spawn virtio-blk thread");
    }

    fn worker_loop(&self) {
        loop {
            let mut pending = self.pending.lock().unwrap();
            while !*pending {
                pending = self.doorbell.wait(pending).unwrap();
            }
            *pending = false;
            drop(pending);

            self.process_queue();
        }
    }

    /// Service every pending request, completing each with a status byte,
    /// a used-ring entry and an IRQ edge.
    fn process_queue(&self) {
        let mut transport = self.transport.lock().unwrap();
        if !transport.active() {
            return;
        }

        loop {
            let chain = match transport.queues[0].pop_chain(&self.mem) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("virtio-blk: ring corrupt: {e}");
                    transport.set_failed();
                    return;
                }
            };

            let (written, status) = match self.execute(&chain) {
                Some(done) => done,
                None => {
                    // Malformed chain; nothing sane to complete.
                    log::warn!("virtio-blk: malformed request chain, dropped");
                    transport.set_failed();
                    return;
                }
            };

            if let Err(e) = transport.queues[0].push_used(&self.mem, chain.head, written) {
                log::warn!("virtio-blk: used-ring update failed: {e}");
                transport.set_failed();
                return;
            }

            if !transport.queues[0].interrupt_suppressed(&self.mem) {
                transport.raise_isr();
                if let Err(e) = self.irq.trigger() {
                    log::warn!("virtio-blk: irq injection failed: {e}");
                }
            }

            // The request completed with the error visible to the guest;
            // a host I/O failure still poisons the device.
            if status == STATUS_IOERR {
                log::warn!("virtio-blk: host i/o error, device failed");
                transport.set_failed();
                return;
            }
        }
    }

    /// Run one request. Returns the used-ring length (bytes written into
    /// device-writable buffers, status byte included) and the status code
    /// handed to the guest, or `None` when the chain does not even have
    /// the header + status shape.
    fn execute(&self, chain: &Chain) -> Option<(u32, u8)> {
        let header_seg = chain.readable.first()?;
        let status_seg = *chain.writable.last()?;
        if header_seg.len < REQUEST_HEADER_SIZE as u32 {
            return None;
        }

        let mut header = [0u8; REQUEST_HEADER_SIZE];
        self.mem.read(header_seg.addr, &mut header).ok()?;
        let request = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let sector = u64::from_le_bytes(header[8..16].try_into().unwrap());

        let (status, data_len) = match request {
            REQUEST_READ => {
                // All writable descriptors except the status byte receive
                // data.
                let data = &chain.writable[..chain.writable.len() - 1];
                self.read_sectors(sector, data)
            }
            REQUEST_WRITE => {
                let data = &chain.readable[1..];
                (self.write_sectors(sector, data), 0)
            }
            REQUEST_FLUSH => (self.flush(), 0),
            other => {
                log::debug!("virtio-blk: unsupported request type {other}");
                (STATUS_UNSUPPORTED, 0)
            }
        };

        if self.mem.write_u8(status_seg.addr, status).is_err() {
            return None;
        }

        Some((data_len + 1, status))
    }

    fn read_sectors(&self, sector: u64, data: &[Segment]) -> (u8, u32) {
        let mut offset = sector * SECTOR_SIZE;
        let mut total = 0u32;
        let mut buf = Vec::new();

        for seg in data {
            buf.resize(seg.len as usize, 0);
            if let Err(e) = self.disk.read_exact_at(&mut buf, offset) {
                log::warn!("virtio-blk: read at {offset:#x} failed: {e}");
                return (STATUS_IOERR, total);
            }
            if self.mem.write(seg.addr, &buf).is_err() {
                return (STATUS_IOERR, total);
            }
            offset += seg.len as u64;
            total += seg.len;
        }

        (STATUS_OK, total)
    }

    fn write_sectors(&self, sector: u64, data: &[Segment]) -> u8 {
        let mut offset = sector * SECTOR_SIZE;
        let mut buf = Vec::new();

        for seg in data {
            buf.resize(seg.len as usize, 0);
            if self.mem.read(seg.addr, &mut buf).is_err() {
                return STATUS_IOERR;
            }
            if let Err(e) = self.disk.write_all_at(&buf, offset) {
                log::warn!("virtio-blk: write at {offset:#x} failed: {e}");
                return STATUS_IOERR;
            }
            offset += seg.len as u64;
        }

        STATUS_OK
    }

    fn flush(&self) -> u8 {
        match self.disk.sync_all() {
            Ok(()) => STATUS_OK,
            Err(e) => {
                log::warn!("virtio-blk: flush failed: {e}");
                STATUS_IOERR
            }
        }
    }

    fn ring_doorbell(&self) {
        *self.pending.lock().unwrap() = true;
        self.doorbell.notify_one();
    }
}

impl PciDevice for VirtioBlk {
    fn config_space(&self) -> &Mutex<ConfigSpace> {
        &self.config
    }

    fn io_range(&self) -> (u16, u16) {
        (self.io_base, self.io_base + 64)
    }

    fn io_in(&self, port: u16, data: &mut [u8]) {
        let offset = port - self.io_base;
        let capacity = self.capacity.to_le_bytes();
        self.transport.lock().unwrap().bar_read(offset, data, &capacity);
    }

    fn io_out(&self, port: u16, data: &[u8]) {
        let offset = port - self.io_base;
        let effect = self.transport.lock().unwrap().bar_write(offset, data);
        if let BarEffect::Notify(_) = effect {
            self.ring_doorbell();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::{status, QUEUE_SIZE};
    use crate::kvm::KvmError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vmm_sys_util::tempfile::TempFile;

    #[derive(Default)]
    struct CountingIrq(AtomicUsize);

    impl IrqTrigger for CountingIrq {
        fn trigger(&self) -> Result<(), KvmError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const PFN: u32 = 4;
    const HEADER_ADDR: u64 = 0x8000;
    const DATA_ADDR: u64 = 0x9000;
    const STATUS_ADDR: u64 = 0xa000;

    struct Harness {
        blk: VirtioBlk,
        mem: Arc<GuestMemory>,
        irq: Arc<CountingIrq>,
        _disk: TempFile,
        avail_slot: u16,
    }

    impl Harness {
        fn new(disk_size: u64) -> Self {
            let disk = TempFile::new().unwrap();
            disk.as_file().set_len(disk_size).unwrap();

            let mem = Arc::new(GuestMemory::new(1 << 20).unwrap());
            let irq = Arc::new(CountingIrq::default());
            let blk =
                VirtioBlk::new(disk.as_path(), mem.clone(), irq.clone(), 0x6240, 9).unwrap();

            // Zero the ring pages and bring the device up the way a
            // driver would.
            mem.write(PFN as u64 * 4096, &vec![0u8; 3 * 4096]).unwrap();
            {
                let mut t = blk.transport.lock().unwrap();
                t.queues[0].set_pfn(PFN);
                t.bar_write(0x12, &[status::ACKNOWLEDGE | status::DRIVER | status::DRIVER_OK]);
            }

            Self {
                blk,
                mem,
                irq,
                _disk: disk,
                avail_slot: 0,
            }
        }

        fn desc_table(&self) -> u64 {
            (PFN as u64) << 12
        }

        fn avail_ring(&self) -> u64 {
            self.desc_table() + 16 * QUEUE_SIZE as u64
        }

        fn used_ring(&self) -> u64 {
            let end = self.avail_ring() + 6 + 2 * QUEUE_SIZE as u64;
            end.div_ceil(4096) * 4096
        }

        fn write_desc(&self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
            let at = self.desc_table() + index as u64 * 16;
            self.mem.write_u64(at, addr).unwrap();
            self.mem.write_u32(at + 8, len).unwrap();
            self.mem.write_u16(at + 12, flags).unwrap();
            self.mem.write_u16(at + 14, next).unwrap();
        }

        /// Publish a three-descriptor request chain and process it.
        fn submit(&mut self, request: u32, sector: u64, data_len: u32, data_writable: bool) {
            let mut header = [0u8; 16];
            header[0..4].copy_from_slice(&request.to_le_bytes());
            header[8..16].copy_from_slice(&sector.to_le_bytes());
            self.mem.write(HEADER_ADDR, &header).unwrap();

            const NEXT: u16 = 1;
            const WRITE: u16 = 2;
            self.write_desc(0, HEADER_ADDR, 16, NEXT, 1);
            if data_len > 0 {
                let flags = NEXT | if data_writable { WRITE } else { 0 };
                self.write_desc(1, DATA_ADDR, data_len, flags, 2);
                self.write_desc(2, STATUS_ADDR, 1, WRITE, 0);
            } else {
                self.write_desc(1, STATUS_ADDR, 1, WRITE, 0);
            }

            let avail = self.avail_ring();
            self.mem
                .write_u16(avail + 4 + 2 * self.avail_slot as u64, 0)
                .unwrap();
            self.avail_slot += 1;
            self.mem.write_u16(avail + 2, self.avail_slot).unwrap();

            self.blk.process_queue();
        }

        fn status_byte(&self) -> u8 {
            let mut b = [0u8; 1];
            self.mem.read(STATUS_ADDR, &mut b).unwrap();
            b[0]
        }

        fn used_len(&self, slot: u16) -> u32 {
            self.mem
                .read_u32(self.used_ring() + 4 + 8 * slot as u64 + 4)
                .unwrap()
        }
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut h = Harness::new(64 * SECTOR_SIZE);

        let payload = [0xabu8; 1024];
        h.mem.write(DATA_ADDR, &payload).unwrap();
        h.submit(REQUEST_WRITE, 3, 1024, false);
        assert_eq!(h.status_byte(), STATUS_OK);
        assert_eq!(h.used_len(0), 1); // status byte only

        // Clobber the buffer, then read the sectors back.
        h.mem.write(DATA_ADDR, &[0u8; 1024]).unwrap();
        h.submit(REQUEST_READ, 3, 1024, true);
        assert_eq!(h.status_byte(), STATUS_OK);
        assert_eq!(h.used_len(1), 1024 + 1);

        let mut read_back = [0u8; 1024];
        h.mem.read(DATA_ADDR, &mut read_back).unwrap();
        assert_eq!(read_back, payload);

        assert_eq!(h.irq.0.load(Ordering::SeqCst), 2);
        assert!(h.blk.transport.lock().unwrap().active());
    }

    #[test]
    fn test_read_past_end_reports_ioerr_and_fails_device() {
        let mut h = Harness::new(4 * SECTOR_SIZE);
        h.submit(REQUEST_READ, 100, 512, true);

        // The guest sees the error status, and the device is done.
        assert_eq!(h.status_byte(), STATUS_IOERR);
        assert!(!h.blk.transport.lock().unwrap().active());

        // A failed device ignores further doorbells.
        let irqs = h.irq.0.load(Ordering::SeqCst);
        h.submit(REQUEST_FLUSH, 0, 0, false);
        assert_eq!(h.irq.0.load(Ordering::SeqCst), irqs);
    }

    #[test]
    fn test_flush_succeeds() {
        let mut h = Harness::new(4 * SECTOR_SIZE);
        h.submit(REQUEST_FLUSH, 0, 0, false);
        assert_eq!(h.status_byte(), STATUS_OK);
        assert_eq!(h.used_len(0), 1);
    }

    #[test]
    fn test_unknown_request_type_unsupported() {
        let mut h = Harness::new(4 * SECTOR_SIZE);
        h.submit(7, 0, 0, false);
        assert_eq!(h.status_byte(), STATUS_UNSUPPORTED);
        // Unsupported is the guest's mistake, not a host failure.
        assert!(h.blk.transport.lock().unwrap().active());
    }

    #[test]
    fn test_capacity_in_config_space() {
        let h = Harness::new(16 * SECTOR_SIZE);
        let mut data = [0u8; 8];
        h.blk.io_in(0x6240 + 0x14, &mut data);
        assert_eq!(u64::from_le_bytes(data), 16);
    }

    #[test]
    fn test_inactive_device_ignores_doorbell() {
        let mut h = Harness::new(4 * SECTOR_SIZE);
        h.blk.transport.lock().unwrap().bar_write(0x12, &[0]);
        // Rings were reset; reprogram the pfn but leave DRIVER_OK clear.
        h.blk.transport.lock().unwrap().queues[0].set_pfn(PFN);
        h.submit(REQUEST_FLUSH, 0, 0, false);
        assert_eq!(h.irq.0.load(Ordering::SeqCst), 0);
    }
}
