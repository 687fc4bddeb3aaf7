//! PCI fabric: configuration mechanism #1 and the device contract.
//!
//! A three-slot bus on bus 0, function 0 only: slot 0 is the host bridge,
//! slots 1 and 2 the virtio functions. Config space is reached through the
//! classic address/data pair:
//!
//! ```text
//! 0xcf8  CONFIG_ADDRESS   enable:1 reserved:7 bus:8 device:5 func:3 offset:8
//! 0xcfc  CONFIG_DATA      1/2/4-byte window into the selected device
//! ```
//!
//! Accesses with enable clear, a non-zero bus or function, or an absent
//! slot read all-ones and drop writes, which is how the kernel's probe
//! discovers the end of the bus.
//!
//! Each device also owns a 64-byte I/O BAR; the machine's port router
//! installs thunks over each claimed range and resolves the device with a
//! linear scan — the list has three entries, an index would be theater.

use std::sync::{Arc, Mutex};
use thiserror::Error;

/// CONFIG_ADDRESS latch.
pub const CONFIG_ADDR_PORT: u16 = 0xcf8;
/// CONFIG_DATA window, four bytes wide.
pub const CONFIG_DATA_PORT: u16 = 0xcfc;

/// Standard configuration header offsets (type 0).
mod cfg {
    pub const VENDOR_ID: usize = 0x00;
    pub const DEVICE_ID: usize = 0x02;
    pub const COMMAND: usize = 0x04;
    pub const REVISION_AND_CLASS: usize = 0x08;
    pub const CACHE_LINE_SIZE: usize = 0x0c;
    pub const LATENCY_TIMER: usize = 0x0d;
    pub const HEADER_TYPE: usize = 0x0e;
    pub const BAR0: usize = 0x10;
    pub const SUBSYSTEM_VENDOR_ID: usize = 0x2c;
    pub const SUBSYSTEM_ID: usize = 0x2e;
    pub const INTERRUPT_LINE: usize = 0x3c;
    pub const INTERRUPT_PIN: usize = 0x3d;
}

#[derive(Error, Debug)]
pub enum PciError {
    #[error("no pci device claims io port {0:#x}")]
    DeviceNotFound(u16),
}

/// One device's 256-byte configuration space.
///
/// Writes are mostly ignored — the bus assigns fixed resources — except
/// the handful of fields an OS legitimately owns and the BAR0 sizing
/// handshake: writing all-ones to a BAR makes the next read return the
/// encoded size mask until the OS writes the address back.
pub struct ConfigSpace {
    regs: [u8; 256],
    bar0_size: u32,
    bar0_probing: bool,
}

impl ConfigSpace {
    /// `class` is the 24-bit class code `base << 16 | sub << 8 | prog_if`.
    pub fn new(vendor_id: u16, device_id: u16, class: u32, subsystem_id: u16) -> Self {
        let mut regs = [0u8; 256];
        regs[cfg::VENDOR_ID..cfg::VENDOR_ID + 2].copy_from_slice(&vendor_id.to_le_bytes());
        regs[cfg::DEVICE_ID..cfg::DEVICE_ID + 2].copy_from_slice(&device_id.to_le_bytes());
        // Revision 0 in the low byte, class code above it.
        regs[cfg::REVISION_AND_CLASS..cfg::REVISION_AND_CLASS + 4]
            .copy_from_slice(&(class << 8).to_le_bytes());
        regs[cfg::HEADER_TYPE] = 0;
        regs[cfg::SUBSYSTEM_VENDOR_ID..cfg::SUBSYSTEM_VENDOR_ID + 2]
            .copy_from_slice(&vendor_id.to_le_bytes());
        regs[cfg::SUBSYSTEM_ID..cfg::SUBSYSTEM_ID + 2].copy_from_slice(&subsystem_id.to_le_bytes());

        Self {
            regs,
            bar0_size: 0,
            bar0_probing: false,
        }
    }

    /// Claim `[base, base + size)` in port space as BAR0. Bit 0 marks an
    /// I/O (not memory) BAR.
    pub fn set_bar0_io(&mut self, base: u16, size: u32) {
        self.regs[cfg::BAR0..cfg::BAR0 + 4].copy_from_slice(&(base as u32 | 1).to_le_bytes());
        self.bar0_size = size;
    }

    pub fn set_interrupt(&mut self, line: u8, pin: u8) {
        self.regs[cfg::INTERRUPT_LINE] = line;
        self.regs[cfg::INTERRUPT_PIN] = pin;
    }

    pub fn read(&self, offset: usize, data: &mut [u8]) {
        for (i, slot) in data.iter_mut().enumerate() {
            let pos = offset + i;
            *slot = if self.bar0_probing && (cfg::BAR0..cfg::BAR0 + 4).contains(&pos) {
                let mask = !(self.bar0_size - 1) | 1;
                mask.to_le_bytes()[pos - cfg::BAR0]
            } else if pos < self.regs.len() {
                self.regs[pos]
            } else {
                0xff
            };
        }
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) {
        if offset == cfg::BAR0 && data.len() == 4 && self.bar0_size != 0 {
            // Sizing handshake; actual BAR reassignment is not supported
            // (the guest runs with pci=realloc=off).
            self.bar0_probing = u32::from_le_bytes(data.try_into().unwrap()) == u32::MAX;
            return;
        }

        for (i, &byte) in data.iter().enumerate() {
            let pos = offset + i;
            let writable = (cfg::COMMAND..cfg::COMMAND + 2).contains(&pos)
                || pos == cfg::CACHE_LINE_SIZE
                || pos == cfg::LATENCY_TIMER
                || pos == cfg::INTERRUPT_LINE;
            if writable && pos < self.regs.len() {
                self.regs[pos] = byte;
            }
        }
    }
}

/// The contract between the bus, the port router and a PCI function.
pub trait PciDevice: Send + Sync {
    fn config_space(&self) -> &Mutex<ConfigSpace>;

    /// Half-open port range claimed by BAR0; empty for BAR-less devices.
    fn io_range(&self) -> (u16, u16);

    fn io_in(&self, port: u16, data: &mut [u8]);

    fn io_out(&self, port: u16, data: &[u8]);
}

/// The host bridge at 00:00.0. Pure configuration presence: its vendor and
/// class code tell the kernel a root bus is here.
pub struct HostBridge {
    config: Mutex<ConfigSpace>,
}

impl HostBridge {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(ConfigSpace::new(0x8086, 0x1237, 0x06_00_00, 0)),
        }
    }
}

impl Default for HostBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PciDevice for HostBridge {
    fn config_space(&self) -> &Mutex<ConfigSpace> {
        &self.config
    }

    fn io_range(&self) -> (u16, u16) {
        (0, 0)
    }

    fn io_in(&self, _port: u16, _data: &mut [u8]) {}

    fn io_out(&self, _port: u16, _data: &[u8]) {}
}

/// The bus: an address latch plus the slot list.
pub struct PciBus {
    addr: Mutex<u32>,
    devices: Vec<Arc<dyn PciDevice>>,
}

/// CONFIG_ADDRESS decoded. Offset keeps its low two bits; the data port
/// supplies them again byte-wise.
fn decode_addr(addr: u32) -> Option<(usize, usize)> {
    if addr & 0x8000_0000 == 0 {
        return None;
    }
    let bus = (addr >> 16) & 0xff;
    let device = (addr >> 11) & 0x1f;
    let function = (addr >> 8) & 0x7;
    if bus != 0 || function != 0 {
        return None;
    }
    Some((device as usize, (addr & 0xfc) as usize))
}

impl PciBus {
    pub fn new(devices: Vec<Arc<dyn PciDevice>>) -> Self {
        Self {
            addr: Mutex::new(0),
            devices,
        }
    }

    pub fn devices(&self) -> &[Arc<dyn PciDevice>] {
        &self.devices
    }

    /// IN from the CONFIG_ADDRESS latch.
    pub fn conf_addr_in(&self, port: u16, data: &mut [u8]) {
        let bytes = self.addr.lock().unwrap().to_le_bytes();
        let start = (port - CONFIG_ADDR_PORT) as usize;
        for (i, slot) in data.iter_mut().enumerate() {
            *slot = bytes.get(start + i).copied().unwrap_or(0);
        }
    }

    /// OUT to the CONFIG_ADDRESS latch. Only full 32-bit writes latch; the
    /// kernel's mechanism-#1 accessors never do anything narrower.
    pub fn conf_addr_out(&self, port: u16, data: &[u8]) {
        if port == CONFIG_ADDR_PORT && data.len() == 4 {
            *self.addr.lock().unwrap() = u32::from_le_bytes(data.try_into().unwrap());
        }
    }

    /// IN from the CONFIG_DATA window.
    pub fn conf_data_in(&self, port: u16, data: &mut [u8]) {
        let addr = *self.addr.lock().unwrap();
        match self.select(addr) {
            Some((device, offset)) => {
                let byte_offset = offset + (port - CONFIG_DATA_PORT) as usize;
                device.config_space().lock().unwrap().read(byte_offset, data);
            }
            None => data.fill(0xff),
        }
    }

    /// OUT to the CONFIG_DATA window; writes to absent targets are dropped.
    pub fn conf_data_out(&self, port: u16, data: &[u8]) {
        let addr = *self.addr.lock().unwrap();
        if let Some((device, offset)) = self.select(addr) {
            let byte_offset = offset + (port - CONFIG_DATA_PORT) as usize;
            device.config_space().lock().unwrap().write(byte_offset, data);
        }
    }

    fn select(&self, addr: u32) -> Option<(&Arc<dyn PciDevice>, usize)> {
        let (slot, offset) = decode_addr(addr)?;
        self.devices.get(slot).map(|d| (d, offset))
    }

    /// IN on a port inside some device's BAR0.
    pub fn bar_in(&self, port: u16, data: &mut [u8]) -> Result<(), PciError> {
        let device = self.claiming(port)?;
        device.io_in(port, data);
        Ok(())
    }

    /// OUT on a port inside some device's BAR0.
    pub fn bar_out(&self, port: u16, data: &[u8]) -> Result<(), PciError> {
        let device = self.claiming(port)?;
        device.io_out(port, data);
        Ok(())
    }

    fn claiming(&self, port: u16) -> Result<&Arc<dyn PciDevice>, PciError> {
        self.devices
            .iter()
            .find(|d| {
                let (start, end) = d.io_range();
                (start..end).contains(&port)
            })
            .ok_or(PciError::DeviceNotFound(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubDevice {
        config: Mutex<ConfigSpace>,
        range: (u16, u16),
    }

    impl StubDevice {
        fn new(base: u16) -> Self {
            let mut config = ConfigSpace::new(0x1af4, 0x1000, 0x02_00_00, 1);
            config.set_bar0_io(base, 64);
            config.set_interrupt(10, 1);
            Self {
                config: Mutex::new(config),
                range: (base, base + 64),
            }
        }
    }

    impl PciDevice for StubDevice {
        fn config_space(&self) -> &Mutex<ConfigSpace> {
            &self.config
        }

        fn io_range(&self) -> (u16, u16) {
            self.range
        }

        fn io_in(&self, port: u16, data: &mut [u8]) {
            data.fill((port & 0xff) as u8);
        }

        fn io_out(&self, _port: u16, _data: &[u8]) {}
    }

    fn bus() -> PciBus {
        PciBus::new(vec![
            Arc::new(HostBridge::new()),
            Arc::new(StubDevice::new(0x6200)),
        ])
    }

    fn config_read_u32(bus: &PciBus, slot: u32, offset: u32) -> u32 {
        let addr = 0x8000_0000 | (slot << 11) | offset;
        bus.conf_addr_out(CONFIG_ADDR_PORT, &addr.to_le_bytes());
        let mut data = [0u8; 4];
        bus.conf_data_in(CONFIG_DATA_PORT, &mut data);
        u32::from_le_bytes(data)
    }

    #[test]
    fn test_bridge_identifies_itself() {
        let bus = bus();
        assert_eq!(config_read_u32(&bus, 0, 0), 0x1237_8086);
        // Class code in the top three bytes of the dword at 0x08.
        assert_eq!(config_read_u32(&bus, 0, 0x08) >> 8, 0x06_00_00);
    }

    #[test]
    fn test_absent_slot_reads_all_ones() {
        let bus = bus();
        assert_eq!(config_read_u32(&bus, 2, 0), 0xffff_ffff);
        assert_eq!(config_read_u32(&bus, 31, 0), 0xffff_ffff);
    }

    #[test]
    fn test_disabled_or_nonzero_bus_reads_all_ones() {
        let bus = bus();
        // Enable bit clear.
        bus.conf_addr_out(CONFIG_ADDR_PORT, &0u32.to_le_bytes());
        let mut data = [0u8; 4];
        bus.conf_data_in(CONFIG_DATA_PORT, &mut data);
        assert_eq!(data, [0xff; 4]);

        // Bus 1 is not decoded.
        let addr = 0x8000_0000u32 | (1 << 16);
        bus.conf_addr_out(CONFIG_ADDR_PORT, &addr.to_le_bytes());
        bus.conf_data_in(CONFIG_DATA_PORT, &mut data);
        assert_eq!(data, [0xff; 4]);
    }

    #[test]
    fn test_addr_latch_reads_back() {
        let bus = bus();
        let addr = 0x8000_0000u32 | (1 << 11) | 0x10;
        bus.conf_addr_out(CONFIG_ADDR_PORT, &addr.to_le_bytes());
        let mut data = [0u8; 4];
        bus.conf_addr_in(CONFIG_ADDR_PORT, &mut data);
        assert_eq!(u32::from_le_bytes(data), addr);
    }

    #[test]
    fn test_data_window_sub_word_access() {
        let bus = bus();
        let addr = 0x8000_0000u32 | (1 << 11); // slot 1, offset 0
        bus.conf_addr_out(CONFIG_ADDR_PORT, &addr.to_le_bytes());

        // Device ID lives in the upper half of the dword: ports 0xcfe/0xcff.
        let mut data = [0u8; 2];
        bus.conf_data_in(CONFIG_DATA_PORT + 2, &mut data);
        assert_eq!(u16::from_le_bytes(data), 0x1000);
    }

    #[test]
    fn test_bar_sizing_probe() {
        let bus = bus();
        let addr = 0x8000_0000u32 | (1 << 11) | 0x10;
        bus.conf_addr_out(CONFIG_ADDR_PORT, &addr.to_le_bytes());

        assert_eq!(config_read_u32(&bus, 1, 0x10), 0x6200 | 1);

        bus.conf_data_out(CONFIG_DATA_PORT, &u32::MAX.to_le_bytes());
        assert_eq!(config_read_u32(&bus, 1, 0x10), !(64 - 1) | 1);

        // Writing the address back ends the probe.
        bus.conf_data_out(CONFIG_DATA_PORT, &(0x6200u32 | 1).to_le_bytes());
        assert_eq!(config_read_u32(&bus, 1, 0x10), 0x6200 | 1);
    }

    #[test]
    fn test_bar_scan_routes_and_rejects() {
        let bus = bus();
        let mut data = [0u8; 1];
        bus.bar_in(0x6210, &mut data).unwrap();
        assert_eq!(data[0], 0x10);

        assert!(matches!(
            bus.bar_in(0x7000, &mut data),
            Err(PciError::DeviceNotFound(0x7000))
        ));
    }

    #[test]
    fn test_interrupt_line_fields() {
        let bus = bus();
        let dword = config_read_u32(&bus, 1, 0x3c);
        assert_eq!(dword & 0xff, 10); // line
        assert_eq!((dword >> 8) & 0xff, 1); // pin INTA#
    }
}
