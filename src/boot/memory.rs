//! Guest physical memory backed by the vm-memory crate.
//!
//! The VMM owns a single contiguous mapping that becomes the guest's
//! physical RAM, registered with KVM as memory slot 0 at guest physical
//! address 0. KVM translates guest physical to host physical through the
//! host MMU (EPT on Intel, NPT on AMD); the VMM and the device back-ends
//! see the same bytes through the host virtual mapping.
//!
//! # Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────┐
//!             │ Low memory      │ ← IVT, BDA, EBDA/MP tables, zero page
//! 0x0010_0000 ├─────────────────┤
//!             │ Kernel          │ ← bzImage payload
//!             ├─────────────────┤
//! 0x0f00_0000 │ Initrd          │
//!             ├─────────────────┤
//!             │ Free RAM        │
//! mem_size    └─────────────────┘
//! ```
//!
//! The mapping is anonymous, shared and read/write. Shared matters: the
//! device worker threads and every vCPU thread observe one coherent buffer,
//! synchronized only by the virtio ring protocol.
//!
//! Fresh memory is filled with a repeating [`POISON`] pattern rather than
//! zeros, so a guest (or a test) reading memory nothing ever wrote gets a
//! recognizable value instead of a plausible one.

use super::BootError;
use vm_memory::{
    Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap, GuestRegionMmap,
    MmapRegion,
};

/// Pattern tiled across guest RAM at allocation time.
pub const POISON: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

/// Guest physical memory: one region starting at guest address 0.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    /// Allocate guest RAM of `size` bytes and fill it with [`POISON`].
    ///
    /// The backing mapping is `MAP_SHARED | MAP_ANONYMOUS | MAP_NORESERVE`:
    /// shared so all VMM threads and KVM agree on one buffer, anonymous
    /// because nothing persists, noreserve to allow overcommit.
    pub fn new(size: u64) -> Result<Self, BootError> {
        let region = MmapRegion::build(
            None,
            size as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        )
        .map_err(|e| {
            BootError::MemoryAllocation(std::io::Error::other(format!("mmap guest RAM: {e}")))
        })?;

        let region = GuestRegionMmap::new(region, GuestAddress(0)).map_err(|e| {
            BootError::MemoryAllocation(std::io::Error::other(format!("guest region: {e}")))
        })?;

        let inner = GuestMemoryMmap::from_regions(vec![region]).map_err(|e| {
            BootError::MemoryAllocation(std::io::Error::other(format!("guest memory: {e}")))
        })?;

        let mem = Self { inner, size };
        mem.fill_poison()?;

        Ok(mem)
    }

    fn fill_poison(&self) -> Result<(), BootError> {
        let mut page = [0u8; 4096];
        for chunk in page.chunks_exact_mut(POISON.len()) {
            chunk.copy_from_slice(&POISON);
        }

        let mut offset = 0u64;
        while offset < self.size {
            let len = page.len().min((self.size - offset) as usize);
            self.write(offset, &page[..len])?;
            offset += len as u64;
        }

        Ok(())
    }

    /// Total size of guest RAM in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Host virtual address and length of the mapping, for registering the
    /// KVM memory slot.
    ///
    /// The pointer is valid only while this `GuestMemory` is alive; the
    /// machine keeps the memory alive for the lifetime of the VM.
    pub fn host_range(&self) -> (u64, u64) {
        let region = self.inner.iter().next().expect("memory has no regions");
        (region.as_ptr() as u64, self.size)
    }

    /// True when `[addr, addr + len)` lies entirely inside guest RAM.
    ///
    /// Every guest-supplied DMA address (virtio descriptors) goes through
    /// this check before the host touches it.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => end <= self.size,
            None => false,
        }
    }

    /// Write `data` at guest physical address `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), BootError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|e| BootError::MemoryAccess {
                addr,
                reason: e.to_string(),
            })
    }

    /// Read into `data` from guest physical address `addr`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), BootError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|e| BootError::MemoryAccess {
                addr,
                reason: e.to_string(),
            })
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), BootError> {
        self.write(addr, &[value])
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), BootError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), BootError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), BootError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, BootError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, BootError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(mem: &GuestMemory, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        mem.read(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn test_allocate() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        assert_eq!(mem.size(), 1 << 20);
        let (host, len) = mem.host_range();
        assert_ne!(host, 0);
        assert_eq!(len, 1 << 20);
    }

    #[test]
    fn test_poisoned_until_written() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        assert_eq!(read_vec(&mem, 0x1000, 4), POISON.to_vec());
        assert_eq!(read_vec(&mem, 0, 8), [POISON, POISON].concat());

        mem.write(0x1000, &[0u8; 8]).unwrap();
        assert_eq!(read_vec(&mem, 0x1000, 8), vec![0u8; 8]);
    }

    #[test]
    fn test_write_read() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        mem.write(0x40, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&mem, 0x40, 4), vec![1, 2, 3, 4]);

        mem.write_u32(0x100, 0x1234_5678).unwrap();
        assert_eq!(mem.read_u32(0x100).unwrap(), 0x1234_5678);

        mem.write_u64(0x108, 0x1234_5678_9abc_def0).unwrap();
        assert_eq!(
            read_vec(&mem, 0x108, 8),
            vec![0xf0, 0xde, 0xbc, 0x9a, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_out_of_bounds() {
        let mem = GuestMemory::new(0x1000).unwrap();
        assert!(mem.write(0xfff, &[1, 2]).is_err());
        let mut buf = [0u8; 2];
        assert!(mem.read(0xfff, &mut buf).is_err());
    }

    #[test]
    fn test_contains_range() {
        let mem = GuestMemory::new(0x1000).unwrap();
        assert!(mem.contains_range(0, 0x1000));
        assert!(mem.contains_range(0xfff, 1));
        assert!(!mem.contains_range(0xfff, 2));
        assert!(!mem.contains_range(u64::MAX, 2));
    }
}
