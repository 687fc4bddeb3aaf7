//! The machine: composition root and vCPU run loop.
//!
//! A [`Machine`] owns everything with a lifetime: the VM handle, the
//! vCPUs, guest RAM, the serial port, the PCI bus with its virtio
//! functions, the sparse MMIO bus, and the port-I/O handler table. Device
//! back-ends get narrow capabilities (guest memory, an IRQ line) instead
//! of a reference back to the machine, so ownership stays a tree.
//!
//! ```text
//! InitialRegState  GuestPhysAddr          Contents
//!
//!                  0x0000_0000 ┌──────────────────┐
//!                  0x0000_9fc0 │ EBDA / MP tables │
//! RSI ───────────► 0x0001_0000 │ boot_params      │
//!                  0x0002_0000 │ cmdline          │
//! RIP ───────────► 0x0010_0000 │ 64-bit kernel    │
//!                  0x0f00_0000 │ initrd           │
//!                  mem_size    └──────────────────┘
//! ```
//!
//! The run loop drives one vCPU per host thread: enter the guest, decode
//! the exit, route port I/O through the handler table and MMIO through the
//! MMIO bus, repeat. Transient run failures (`EINTR`/`EAGAIN`) continue;
//! HLT ends the vCPU cleanly; a 0xcf9 write surfaces as the distinguished
//! power-cycle error; everything unexpected is fatal for the VM but never
//! a panic.

use crate::boot::{bzimage, layout, mptable, BootError, GuestMemory};
use crate::devices::mmio::{MmioBus, MmioDevice, MmioError};
use crate::devices::pci::{self, HostBridge, PciBus, PciDevice, PciError};
use crate::devices::serial::{Serial, COM1_BASE, COM1_END, SERIAL_IRQ};
use crate::devices::virtio::blk::VirtioBlk;
use crate::devices::virtio::net::VirtioNet;
use crate::kvm::{self, IrqLine, KvmError, Vcpu, VmHandle};
use crate::tap::{Tap, TapError};
use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::VcpuExit;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Smallest guest RAM we accept; the fixed layout needs the low megabytes
/// and the kernel needs room to decompress.
pub const MIN_MEM_SIZE: u64 = 64 << 20;

/// Default guest RAM.
pub const DEFAULT_MEM_SIZE: u64 = 1 << 30;

/// PIC lines for the virtio functions. Serial is on 4 (see the serial
/// module); these two land on free ISA lines routed 1:1 by the MP tables.
const VIRTIO_NET_IRQ: u32 = 10;
const VIRTIO_BLK_IRQ: u32 = 9;

/// I/O BAR bases, 64 bytes each, disjoint by construction.
const NET_IO_BASE: u16 = 0x6200;
const BLK_IO_BASE: u16 = 0x6240;

#[derive(Error, Debug)]
pub enum Error {
    #[error("guest memory size {0:#x} is below the 64 MiB minimum")]
    MemTooSmall(u64),

    #[error("guest memory size {0:#x} is not a multiple of 4 KiB")]
    MemUnaligned(u64),

    #[error("no vcpu {0}")]
    BadCpu(usize),

    #[error("virtual address {0:#x} cannot be translated")]
    BadVirtualAddress(u64),

    /// The guest wrote the reset port; shutdown, not failure.
    #[error("power cycle requested via port 0xcf9")]
    PowerCycle,

    /// A single-step trap; the caller decides whether to resume.
    #[error("single-step trap")]
    SingleStep,

    #[error("unexpected guest access to io port {port:#x}")]
    UnexpectedIoPort { port: u16 },

    #[error("unexpected kvm exit: {0}")]
    UnexpectedExit(String),

    #[error("failed to read {path:?}: {source}")]
    ReadImage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open disk image {path:?}: {source}")]
    DiskOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error(transparent)]
    Boot(#[from] BootError),

    #[error(transparent)]
    Pci(#[from] PciError),

    #[error(transparent)]
    Mmio(#[from] MmioError),

    #[error(transparent)]
    Tap(#[from] TapError),
}

/// Index into the per-port handler pair.
const IN: usize = 0;
const OUT: usize = 1;

/// What a port access routes to. The devices themselves live on the
/// machine; keeping the table a dense array of small tags makes lookup a
/// plain index and keeps the handlers free to borrow the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortHandler {
    /// Default: fail the VM with "unexpected io port".
    Deny,
    /// Legacy port the guest may poke but we do not model.
    Ignore,
    /// PS/2 controller status: reads as "system flag set, output buffer
    /// empty" so keyboard probes terminate.
    Ps2Status,
    /// 0xcf9 reset control; any write is a power-cycle request.
    ResetControl,
    /// COM1 register block.
    Com1,
    /// PCI CONFIG_ADDRESS latch.
    PciAddr,
    /// PCI CONFIG_DATA window.
    PciData,
    /// Some PCI function's I/O BAR.
    PciBar,
}

pub struct Machine {
    vm: Arc<VmHandle>,
    vcpus: Vec<Mutex<Vcpu>>,
    mem: Arc<GuestMemory>,
    serial: Mutex<Serial>,
    pci: PciBus,
    mmio: MmioBus,
    io_table: Box<[[PortHandler; 2]]>,
    /// Raised by the first fatal vCPU error; other run loops drain out at
    /// their next exit.
    stop: AtomicBool,
}

impl Machine {
    /// Build the whole machine: VM, vCPUs, poisoned RAM in slot 0, MP
    /// tables, devices, and the port table. Optional TAP and disk names
    /// decide whether the virtio functions exist at all.
    pub fn new(
        n_cpus: usize,
        mem_size: u64,
        tap_name: Option<&str>,
        disk_path: Option<&Path>,
    ) -> Result<Self, Error> {
        if mem_size < MIN_MEM_SIZE {
            return Err(Error::MemTooSmall(mem_size));
        }
        if mem_size % 4096 != 0 {
            return Err(Error::MemUnaligned(mem_size));
        }

        let vm = Arc::new(kvm::create_vm()?);

        let vcpus = (0..n_cpus)
            .map(|id| vm.create_vcpu(id as u64).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;

        let mem = Arc::new(GuestMemory::new(mem_size)?);
        let (host_addr, size) = mem.host_range();
        // SAFETY: the mapping is owned by `mem`, which this machine keeps
        // alive for as long as the VM exists, and slot 0 is never
        // replaced.
        unsafe {
            vm.install_ram(size, host_addr)?;
        }

        mptable::write(&mem, n_cpus.min(255) as u8)?;

        let serial = Mutex::new(Serial::new(Arc::new(IrqLine::new(
            Arc::clone(&vm),
            SERIAL_IRQ,
        ))));

        let mut devices: Vec<Arc<dyn PciDevice>> = vec![Arc::new(HostBridge::new())];

        if let Some(name) = tap_name {
            let tap = Tap::open(name)?;
            let net = Arc::new(VirtioNet::new(
                tap,
                Arc::clone(&mem),
                Arc::new(IrqLine::new(Arc::clone(&vm), VIRTIO_NET_IRQ)),
                NET_IO_BASE,
                VIRTIO_NET_IRQ as u8,
            ));
            net.start();
            devices.push(net);
        }

        if let Some(path) = disk_path {
            let blk = VirtioBlk::new(
                path,
                Arc::clone(&mem),
                Arc::new(IrqLine::new(Arc::clone(&vm), VIRTIO_BLK_IRQ)),
                BLK_IO_BASE,
                VIRTIO_BLK_IRQ as u8,
            )
            .map_err(|source| Error::DiskOpen {
                path: path.into(),
                source,
            })?;
            let blk = Arc::new(blk);
            blk.start();
            devices.push(blk);
        }

        let pci = PciBus::new(devices);
        let io_table = build_io_table(&pci);

        Ok(Self {
            vm,
            vcpus,
            mem,
            serial,
            pci,
            mmio: MmioBus::new(),
            io_table,
            stop: AtomicBool::new(false),
        })
    }

    pub fn num_cpus(&self) -> usize {
        self.vcpus.len()
    }

    /// Load kernel, initrd and command line per the Linux boot protocol,
    /// then point every vCPU at the protected-mode entry.
    pub fn load_linux(
        &self,
        kernel_path: &Path,
        initrd_path: &Path,
        cmdline: &str,
    ) -> Result<(), Error> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|source| Error::ReadImage {
                path: path.into(),
                source,
            })
        };
        let kernel = read(kernel_path)?;
        let initrd = read(initrd_path)?;

        bzimage::load(&self.mem, &kernel, &initrd, cmdline)?;
        self.setup_regs(layout::KERNEL_ADDR, layout::BOOT_PARAMS_ADDR)
    }

    /// Put every vCPU in flat protected mode with `RIP = rip` and
    /// `RSI = boot_params`, the state the kernel's 32-bit entry expects.
    pub fn setup_regs(&self, rip: u64, boot_params: u64) -> Result<(), Error> {
        for vcpu in &self.vcpus {
            let vcpu = vcpu.lock().unwrap();

            let mut regs = vcpu.get_regs()?;
            regs.rflags = 2; // only the always-one bit
            regs.rip = rip;
            regs.rsi = boot_params;
            vcpu.set_regs(&regs)?;

            let mut sregs = vcpu.get_sregs()?;
            for segment in [
                &mut sregs.cs,
                &mut sregs.ds,
                &mut sregs.es,
                &mut sregs.fs,
                &mut sregs.gs,
                &mut sregs.ss,
            ] {
                segment.base = 0;
                segment.limit = 0xffff_ffff;
                segment.g = 1;
            }
            sregs.cs.db = 1;
            sregs.ss.db = 1;
            sregs.cr0 |= 1; // protected mode, no paging
            vcpu.set_sregs(&sregs)?;
        }
        Ok(())
    }

    /// Drive one vCPU until it halts, a fatal condition surfaces, or
    /// another vCPU raised the stop flag.
    ///
    /// Must be called from a single thread per vCPU for the vCPU's entire
    /// lifetime: KVM expects vCPU ioctls from the owning thread, and a
    /// host thread never migrates mid-loop.
    pub fn run_infinite_loop(&self, cpu: usize) -> Result<(), Error> {
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            match self.run_once(cpu) {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => {
                    self.stop.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
    }

    /// Run the guest to the next exit and dispatch it. `Ok(true)` means
    /// keep running, `Ok(false)` means the vCPU is done (HLT).
    pub fn run_once(&self, cpu: usize) -> Result<bool, Error> {
        let mut vcpu = self.vcpu(cpu)?.lock().unwrap();

        match vcpu.run()? {
            VcpuExit::Hlt => {
                log::info!("cpu {cpu}: guest halted");
                Ok(false)
            }
            VcpuExit::IoIn(port, data) => {
                self.io_in(port, data)?;
                Ok(true)
            }
            VcpuExit::IoOut(port, data) => {
                self.io_out(port, data)?;
                Ok(true)
            }
            VcpuExit::MmioRead(addr, data) => {
                self.mmio.read(addr, data)?;
                Ok(true)
            }
            VcpuExit::MmioWrite(addr, data) => {
                self.mmio.write(addr, data)?;
                Ok(true)
            }
            // A host signal yanked us out of the guest; nothing to do.
            VcpuExit::Intr => Ok(true),
            VcpuExit::Unknown => {
                log::debug!("cpu {cpu}: unknown exit, continuing");
                Ok(true)
            }
            VcpuExit::Debug(_) => Err(Error::SingleStep),
            // Shutdown, FailEntry, InternalError and anything newer all
            // end the guest.
            exit => Err(Error::UnexpectedExit(format!("{exit:?}"))),
        }
    }

    fn io_in(&self, port: u16, data: &mut [u8]) -> Result<(), Error> {
        match self.io_table[port as usize][IN] {
            PortHandler::Deny => Err(Error::UnexpectedIoPort { port }),
            PortHandler::Ignore => Ok(()),
            PortHandler::Ps2Status => {
                data.fill(0x20);
                Ok(())
            }
            PortHandler::ResetControl => Err(Error::PowerCycle),
            PortHandler::Com1 => {
                self.serial.lock().unwrap().io_in(port - COM1_BASE, data);
                Ok(())
            }
            PortHandler::PciAddr => {
                self.pci.conf_addr_in(port, data);
                Ok(())
            }
            PortHandler::PciData => {
                self.pci.conf_data_in(port, data);
                Ok(())
            }
            PortHandler::PciBar => Ok(self.pci.bar_in(port, data)?),
        }
    }

    fn io_out(&self, port: u16, data: &[u8]) -> Result<(), Error> {
        match self.io_table[port as usize][OUT] {
            PortHandler::Deny => Err(Error::UnexpectedIoPort { port }),
            PortHandler::Ignore | PortHandler::Ps2Status => Ok(()),
            PortHandler::ResetControl => {
                // 0x0e asks for a full power cycle; we treat every value
                // the same way, and the guest's reboot-on-panic writes
                // land here.
                log::info!("guest wrote {data:02x?} to reset port 0xcf9");
                Err(Error::PowerCycle)
            }
            PortHandler::Com1 => {
                self.serial.lock().unwrap().io_out(port - COM1_BASE, data);
                Ok(())
            }
            PortHandler::PciAddr => {
                self.pci.conf_addr_out(port, data);
                Ok(())
            }
            PortHandler::PciData => {
                self.pci.conf_data_out(port, data);
                Ok(())
            }
            PortHandler::PciBar => Ok(self.pci.bar_out(port, data)?),
        }
    }

    /// Push one byte of host input into the serial FIFO. The caller
    /// follows up with [`Machine::inject_serial_irq`].
    pub fn queue_serial_input(&self, byte: u8) {
        self.serial.lock().unwrap().queue_input(byte);
    }

    /// Edge-inject the serial IRQ: line low, then high. Safe to call for
    /// every byte; duplicate edges coalesce at the PIC.
    pub fn inject_serial_irq(&self) -> Result<(), Error> {
        self.vm.set_irq_line(SERIAL_IRQ, false)?;
        self.vm.set_irq_line(SERIAL_IRQ, true)?;
        Ok(())
    }

    /// Map a guest MMIO window to a device model.
    pub fn register_mmio(&mut self, base: u64, size: u64, device: Box<dyn MmioDevice>) {
        self.mmio.register(base, size, device);
    }

    fn vcpu(&self, cpu: usize) -> Result<&Mutex<Vcpu>, Error> {
        self.vcpus.get(cpu).ok_or(Error::BadCpu(cpu))
    }

    /// Raw fd of a vCPU, mostly useful to callers doing their own ioctls.
    pub fn cpu_to_fd(&self, cpu: usize) -> Result<RawFd, Error> {
        Ok(self.vcpu(cpu)?.lock().unwrap().as_raw_fd())
    }

    pub fn get_regs(&self, cpu: usize) -> Result<kvm_regs, Error> {
        Ok(self.vcpu(cpu)?.lock().unwrap().get_regs()?)
    }

    pub fn set_regs(&self, cpu: usize, regs: &kvm_regs) -> Result<(), Error> {
        Ok(self.vcpu(cpu)?.lock().unwrap().set_regs(regs)?)
    }

    pub fn get_sregs(&self, cpu: usize) -> Result<kvm_sregs, Error> {
        Ok(self.vcpu(cpu)?.lock().unwrap().get_sregs()?)
    }

    /// Toggle single-step on every vCPU.
    pub fn single_step(&self, enable: bool) -> Result<(), Error> {
        for vcpu in &self.vcpus {
            vcpu.lock().unwrap().set_single_step(enable)?;
        }
        Ok(())
    }

    /// Translate a guest virtual address through `cpu`'s current paging
    /// mode. Non-canonical addresses fail before KVM is asked.
    pub fn vtop(&self, cpu: usize, va: u64) -> Result<u64, Error> {
        // Bits 63:47 must be all zero or all one.
        let top = va >> 47;
        if top != 0 && top != 0x1_ffff {
            return Err(Error::BadVirtualAddress(va));
        }

        let translation = self.vcpu(cpu)?.lock().unwrap().translate(va)?;
        if translation.valid == 0 {
            return Err(Error::BadVirtualAddress(va));
        }
        Ok(translation.physical_address)
    }

    /// Read guest physical memory.
    pub fn read_at(&self, data: &mut [u8], offset: u64) -> Result<(), Error> {
        Ok(self.mem.read(offset, data)?)
    }

    /// Write guest physical memory.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<(), Error> {
        Ok(self.mem.write(offset, data)?)
    }
}

/// Build the 65,536 × 2 port handler table. Installation order matters:
/// later entries overwrite earlier ones for the same slot.
fn build_io_table(pci: &PciBus) -> Box<[[PortHandler; 2]]> {
    let mut table = vec![[PortHandler::Deny; 2]; 0x10000].into_boxed_slice();

    // Legacy ports whose absence would confuse the kernel: CMOS RTC, DMA
    // page registers, COM2/3/4, VGA, and the alternate PCI mechanisms.
    let quiet: [(u16, u16); 10] = [
        (0x70, 0x71),
        (0x80, 0x9f),
        (0x2f8, 0x2ff),
        (0x3e8, 0x3ef),
        (0x2e8, 0x2ef),
        (0x3c0, 0x3da),
        (0x3b4, 0x3b5),
        (0xcfa, 0xcfb),
        (0xcfe, 0xcfe),
        (0xc000, 0xcfff),
    ];
    for (start, end) in quiet {
        for port in start..=end {
            table[port as usize] = [PortHandler::Ignore; 2];
        }
    }

    // PS/2 controller: status reads must terminate the kernel's probe
    // loop; writes are ignored.
    for port in 0x60..=0x6f {
        table[port as usize][IN] = PortHandler::Ps2Status;
        table[port as usize][OUT] = PortHandler::Ignore;
    }

    // Reset control.
    table[0xcf9] = [PortHandler::ResetControl; 2];

    // COM1.
    for port in COM1_BASE..COM1_END {
        table[port as usize] = [PortHandler::Com1; 2];
    }

    // PCI configuration mechanism #1.
    table[pci::CONFIG_ADDR_PORT as usize] = [PortHandler::PciAddr; 2];
    for port in pci::CONFIG_DATA_PORT..pci::CONFIG_DATA_PORT + 4 {
        table[port as usize] = [PortHandler::PciData; 2];
    }

    // Each PCI function's I/O BAR.
    for device in pci.devices() {
        let (start, end) = device.io_range();
        for port in start..end {
            table[port as usize] = [PortHandler::PciBar; 2];
        }
    }

    table
}
