//! bzImage loading and `boot_params` (zero page) construction.
//!
//! A bzImage is three parts: a legacy boot sector, `setup_sects` 512-byte
//! real-mode setup sectors carrying the setup header, and the protected-mode
//! kernel payload. Booting without a BIOS means we play bootloader:
//!
//! ```text
//! bzImage file                       Guest physical memory
//! +------------------+ 0x0000       +------------------+ 0x10000
//! | boot sector      |              | boot_params      | ← header copy
//! +------------------+ 0x0200       | + E820 map       |   + overrides
//! | setup header     | ──────────►  +------------------+ 0x20000
//! | & setup code     |              | cmdline          |
//! +------------------+ (sects+1)    +------------------+ 0x100000
//! | protected-mode   | ──────────►  | kernel payload   |
//! | kernel           |              +------------------+ 0xf000000
//! +------------------+              | initrd           |
//!                                   +------------------+
//! ```
//!
//! The setup header is copied verbatim into the zero page, then the fields
//! a bootloader owns are overridden: loader type, load flags, ramdisk
//! location and size, heap end, and the command line pointer. The E820 map
//! tells the kernel which physical ranges are RAM and which are reserved
//! legacy holes.
//!
//! Reference: <https://www.kernel.org/doc/html/latest/arch/x86/boot.html>

use super::layout;
use super::memory::GuestMemory;
use super::BootError;

/// "HdrS", little-endian, at offset 0x202 of a valid bzImage.
const BOOT_MAGIC: u32 = 0x5372_6448;

/// Boot protocol 2.06: first version with `cmdline_size`.
const MIN_BOOT_PROTOCOL: u16 = 0x0206;

/// The setup header occupies 0x1f1..0x280 of both the file and the zero page.
const SETUP_HEADER_OFFSET: usize = 0x1f1;
const SETUP_HEADER_END: usize = 0x280;

/// Zero page field offsets (x86 boot protocol).
mod zeropage {
    pub const E820_ENTRIES: usize = 0x1e8;
    pub const VID_MODE: usize = 0x1fa;
    pub const TYPE_OF_LOADER: usize = 0x210;
    pub const LOADFLAGS: usize = 0x211;
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21c;
    pub const HEAP_END_PTR: usize = 0x224;
    pub const EXT_LOADER_VER: usize = 0x226;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const CMDLINE_SIZE: usize = 0x238;
    pub const E820_TABLE: usize = 0x2d0;
}

/// `loadflags` bits.
mod loadflags {
    /// Protected-mode code loaded at 0x100000.
    pub const LOADED_HIGH: u8 = 1 << 0;
    /// Do not reload segment registers in real mode.
    pub const KEEP_SEGMENTS: u8 = 1 << 6;
    /// `heap_end_ptr` is valid.
    pub const CAN_USE_HEAP: u8 = 1 << 7;
}

const E820_RAM: u32 = 1;
const E820_RESERVED: u32 = 2;

/// Load kernel, initrd and command line into guest memory and build the
/// zero page. The caller initializes vCPU registers separately (`RIP` at
/// [`layout::KERNEL_ADDR`], `RSI` at [`layout::BOOT_PARAMS_ADDR`]).
pub fn load(
    mem: &GuestMemory,
    kernel: &[u8],
    initrd: &[u8],
    cmdline: &str,
) -> Result<(), BootError> {
    if !initrd.is_empty() {
        mem.write(layout::INITRD_ADDR, initrd)?;
    }

    write_cmdline(mem, cmdline)?;

    let setup = SetupHeader::parse(kernel)?;
    write_boot_params(mem, &setup, initrd.len() as u32, cmdline)?;

    // The protected-mode payload starts after the boot sector plus the
    // setup sectors; it lands at the traditional 1 MiB mark.
    let payload_offset = (setup.setup_sects as usize + 1) * 512;
    if payload_offset >= kernel.len() {
        return Err(BootError::InvalidKernel(format!(
            "setup sectors ({}) exceed the {} byte image",
            setup.setup_sects,
            kernel.len()
        )));
    }
    mem.write(layout::KERNEL_ADDR, &kernel[payload_offset..])?;

    log::info!(
        "loaded {} byte kernel at {:#x}, {} byte initrd at {:#x}",
        kernel.len() - payload_offset,
        layout::KERNEL_ADDR,
        initrd.len(),
        layout::INITRD_ADDR,
    );

    Ok(())
}

/// Validated view of the bzImage setup header.
struct SetupHeader {
    /// Number of 512-byte setup sectors after the boot sector.
    setup_sects: u8,
    /// Raw header bytes, `0x1f1..0x280` of the image.
    raw: Vec<u8>,
}

impl SetupHeader {
    fn parse(kernel: &[u8]) -> Result<Self, BootError> {
        if kernel.len() < SETUP_HEADER_END {
            return Err(BootError::InvalidKernel(format!(
                "{} bytes is too small to hold a setup header",
                kernel.len()
            )));
        }

        let magic = u32::from_le_bytes(kernel[0x202..0x206].try_into().unwrap());
        if magic != BOOT_MAGIC {
            return Err(BootError::InvalidKernel(format!(
                "bad boot magic {magic:#x} (want {BOOT_MAGIC:#x})"
            )));
        }

        let protocol = u16::from_le_bytes(kernel[0x206..0x208].try_into().unwrap());
        if protocol < MIN_BOOT_PROTOCOL {
            return Err(BootError::InvalidKernel(format!(
                "boot protocol {protocol:#x} too old (want >= {MIN_BOOT_PROTOCOL:#x})"
            )));
        }

        // A zero here historically means 4 setup sectors.
        let setup_sects = match kernel[SETUP_HEADER_OFFSET] {
            0 => 4,
            n => n,
        };

        Ok(Self {
            setup_sects,
            raw: kernel[SETUP_HEADER_OFFSET..SETUP_HEADER_END].to_vec(),
        })
    }
}

fn write_cmdline(mem: &GuestMemory, cmdline: &str) -> Result<(), BootError> {
    if cmdline.len() + 1 > layout::CMDLINE_MAX_SIZE {
        return Err(BootError::CmdlineTooLong {
            len: cmdline.len(),
            max: layout::CMDLINE_MAX_SIZE - 1,
        });
    }

    mem.write(layout::CMDLINE_ADDR, cmdline.as_bytes())?;
    mem.write_u8(layout::CMDLINE_ADDR + cmdline.len() as u64, 0)
}

/// Build the zero page: the kernel's setup header plus bootloader
/// overrides, and the E820 memory map.
fn write_boot_params(
    mem: &GuestMemory,
    setup: &SetupHeader,
    initrd_size: u32,
    cmdline: &str,
) -> Result<(), BootError> {
    let mut params = [0u8; 4096];

    params[SETUP_HEADER_OFFSET..SETUP_HEADER_END].copy_from_slice(&setup.raw);

    let put_u16 = |params: &mut [u8], off: usize, v: u16| {
        params[off..off + 2].copy_from_slice(&v.to_le_bytes());
    };
    let put_u32 = |params: &mut [u8], off: usize, v: u32| {
        params[off..off + 4].copy_from_slice(&v.to_le_bytes());
    };

    put_u16(&mut params, zeropage::VID_MODE, 0xffff);
    params[zeropage::TYPE_OF_LOADER] = 0xff;
    params[zeropage::LOADFLAGS] |=
        loadflags::LOADED_HIGH | loadflags::KEEP_SEGMENTS | loadflags::CAN_USE_HEAP;
    put_u32(
        &mut params,
        zeropage::RAMDISK_IMAGE,
        layout::INITRD_ADDR as u32,
    );
    put_u32(&mut params, zeropage::RAMDISK_SIZE, initrd_size);
    put_u16(&mut params, zeropage::HEAP_END_PTR, 0xfe00);
    params[zeropage::EXT_LOADER_VER] = 0;
    put_u32(
        &mut params,
        zeropage::CMD_LINE_PTR,
        layout::CMDLINE_ADDR as u32,
    );
    put_u32(&mut params, zeropage::CMDLINE_SIZE, cmdline.len() as u32 + 1);

    // E820: conventional memory, the EBDA and BIOS shadow holes, then
    // everything from the kernel load address up.
    let entries = [
        (
            layout::REAL_MODE_IVT_END,
            layout::EBDA_ADDR - layout::REAL_MODE_IVT_END,
            E820_RAM,
        ),
        (
            layout::EBDA_ADDR,
            layout::VGA_RAM_ADDR - layout::EBDA_ADDR,
            E820_RESERVED,
        ),
        (
            layout::MB_BIOS_ADDR,
            layout::MB_BIOS_END - layout::MB_BIOS_ADDR,
            E820_RESERVED,
        ),
        (
            layout::KERNEL_ADDR,
            mem.size() - layout::KERNEL_ADDR,
            E820_RAM,
        ),
    ];

    let mut off = zeropage::E820_TABLE;
    for (base, size, kind) in entries {
        params[off..off + 8].copy_from_slice(&base.to_le_bytes());
        params[off + 8..off + 16].copy_from_slice(&size.to_le_bytes());
        params[off + 16..off + 20].copy_from_slice(&kind.to_le_bytes());
        off += 20;
    }
    params[zeropage::E820_ENTRIES] = entries.len() as u8;

    mem.write(layout::BOOT_PARAMS_ADDR, &params)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal image that passes header validation: one setup sector, a
    /// recognizable payload right after it.
    fn synthetic_bzimage(payload: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; 1024 + payload.len()];
        image[SETUP_HEADER_OFFSET] = 1; // setup_sects
        image[0x202..0x206].copy_from_slice(&BOOT_MAGIC.to_le_bytes());
        image[0x206..0x208].copy_from_slice(&MIN_BOOT_PROTOCOL.to_le_bytes());
        image[1024..].copy_from_slice(payload);
        image
    }

    fn test_mem() -> GuestMemory {
        // Large enough to reach the initrd load address.
        GuestMemory::new(layout::INITRD_ADDR + (1 << 20)).unwrap()
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        let mut image = synthetic_bzimage(b"xxxx");
        image[0x202] = 0;
        assert!(load(&mem, &image, &[], "console=ttyS0").is_err());
    }

    #[test]
    fn test_rejects_old_protocol() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        let mut image = synthetic_bzimage(b"xxxx");
        image[0x206..0x208].copy_from_slice(&0x0200u16.to_le_bytes());
        assert!(load(&mem, &image, &[], "console=ttyS0").is_err());
    }

    #[test]
    fn test_rejects_truncated_image() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        assert!(load(&mem, &[0u8; 64], &[], "").is_err());
    }

    #[test]
    fn test_loads_payload_and_initrd() {
        let mem = test_mem();
        let image = synthetic_bzimage(b"payload!");
        load(&mem, &image, b"initrd-bytes", "console=ttyS0").unwrap();

        let mut payload = [0u8; 8];
        mem.read(layout::KERNEL_ADDR, &mut payload).unwrap();
        assert_eq!(&payload, b"payload!");

        let mut initrd = [0u8; 12];
        mem.read(layout::INITRD_ADDR, &mut initrd).unwrap();
        assert_eq!(&initrd, b"initrd-bytes");
    }

    #[test]
    fn test_zero_page_fields() {
        let mem = test_mem();
        let image = synthetic_bzimage(b"payload!");
        let cmdline = "console=ttyS0 rdinit=/init";
        load(&mem, &image, b"rd", cmdline).unwrap();

        let base = layout::BOOT_PARAMS_ADDR;
        let read_u8 = |off: usize| {
            let mut b = [0u8; 1];
            mem.read(base + off as u64, &mut b).unwrap();
            b[0]
        };

        assert_eq!(read_u8(zeropage::TYPE_OF_LOADER), 0xff);
        assert_eq!(
            read_u8(zeropage::LOADFLAGS)
                & (loadflags::LOADED_HIGH | loadflags::KEEP_SEGMENTS | loadflags::CAN_USE_HEAP),
            loadflags::LOADED_HIGH | loadflags::KEEP_SEGMENTS | loadflags::CAN_USE_HEAP
        );
        assert_eq!(
            mem.read_u32(base + zeropage::CMD_LINE_PTR as u64).unwrap(),
            layout::CMDLINE_ADDR as u32
        );
        assert_eq!(
            mem.read_u32(base + zeropage::CMDLINE_SIZE as u64).unwrap(),
            cmdline.len() as u32 + 1
        );
        assert_eq!(
            mem.read_u32(base + zeropage::RAMDISK_IMAGE as u64).unwrap(),
            layout::INITRD_ADDR as u32
        );
        assert_eq!(
            mem.read_u32(base + zeropage::RAMDISK_SIZE as u64).unwrap(),
            2
        );
        assert_eq!(read_u8(zeropage::E820_ENTRIES), 4);

        // Command line lands NUL terminated at its fixed address.
        let mut buf = vec![0u8; cmdline.len() + 1];
        mem.read(layout::CMDLINE_ADDR, &mut buf).unwrap();
        assert_eq!(&buf[..cmdline.len()], cmdline.as_bytes());
        assert_eq!(buf[cmdline.len()], 0);
    }

    #[test]
    fn test_cmdline_too_long() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        let image = synthetic_bzimage(b"p");
        let long = "x".repeat(layout::CMDLINE_MAX_SIZE);
        assert!(matches!(
            load(&mem, &image, &[], &long),
            Err(BootError::CmdlineTooLong { .. })
        ));
    }
}
