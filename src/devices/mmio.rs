//! Sparse MMIO router.
//!
//! The port table's memory-mapped sibling: devices claim `[base, base +
//! size)` windows of guest physical address space, and the run loop routes
//! MMIO exits here. Unclaimed addresses are an error the run loop treats
//! exactly like an unexpected I/O port — there is no benign unmapped MMIO.

use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MmioError {
    #[error("unexpected mmio access at {0:#x}")]
    Unclaimed(u64),
}

/// A device mapped into guest physical address space. Offsets are relative
/// to the device's base.
pub trait MmioDevice: Send {
    fn read(&mut self, offset: u64, data: &mut [u8]);
    fn write(&mut self, offset: u64, data: &[u8]);
}

struct MmioRegion {
    base: u64,
    size: u64,
    device: Mutex<Box<dyn MmioDevice>>,
}

/// Routes MMIO exits to the claiming device.
#[derive(Default)]
pub struct MmioBus {
    regions: Vec<MmioRegion>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, base: u64, size: u64, device: Box<dyn MmioDevice>) {
        self.regions.push(MmioRegion {
            base,
            size,
            device: Mutex::new(device),
        });
        self.regions.sort_by_key(|r| r.base);
    }

    fn claiming(&self, addr: u64) -> Result<(&MmioRegion, u64), MmioError> {
        self.regions
            .iter()
            .find(|r| addr >= r.base && addr < r.base + r.size)
            .map(|r| (r, addr - r.base))
            .ok_or(MmioError::Unclaimed(addr))
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MmioError> {
        let (region, offset) = self.claiming(addr)?;
        region.device.lock().unwrap().read(offset, data);
        Ok(())
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MmioError> {
        let (region, offset) = self.claiming(addr)?;
        region.device.lock().unwrap().write(offset, data);
        Ok(())
    }
}
