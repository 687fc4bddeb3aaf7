//! Guest memory and the Linux boot protocol.
//!
//! This module owns everything that has to be in guest RAM before the first
//! vCPU runs: the RAM itself, the bzImage payload, the initrd, the kernel
//! command line, the `boot_params` zero page with its E820 map, and the MP
//! tables describing the CPU topology.
//!
//! # Boot flow
//!
//! We boot the kernel through the 32-bit protected-mode entry point of the
//! x86 Linux Boot Protocol rather than a BIOS or bootloader:
//!
//! 1. The initrd is copied to its fixed load address.
//! 2. The command line is copied, NUL terminated.
//! 3. The bzImage setup header is parsed, copied into the zero page, and a
//!    handful of fields are overridden to describe this loader.
//! 4. The protected-mode kernel payload (everything after the setup
//!    sectors) is copied to the 1 MiB mark.
//! 5. Each vCPU starts with flat segments, `CR0.PE` set, `RIP` at the
//!    kernel entry point and `RSI` pointing at the zero page. The kernel's
//!    own startup code builds page tables and enters long mode itself.
//!
//! Reference: <https://www.kernel.org/doc/html/latest/arch/x86/boot.html>

pub mod bzimage;
pub mod memory;
pub mod mptable;

pub use memory::{GuestMemory, POISON};

use thiserror::Error;

/// Fixed guest physical addresses used by the loader.
///
/// The layout mirrors what the protected-mode kernel expects: the zero page
/// anywhere below 1 MiB (`RSI` tells the kernel where), the command line
/// below 4 GiB at the address stored in `cmd_line_ptr`, the kernel payload
/// at the traditional 1 MiB mark, and the initrd high enough that the
/// decompressed kernel cannot collide with it.
pub mod layout {
    /// `boot_params` (zero page); initial `RSI` for every vCPU.
    pub const BOOT_PARAMS_ADDR: u64 = 0x10000;

    /// Kernel command line, NUL terminated.
    pub const CMDLINE_ADDR: u64 = 0x20000;

    /// Maximum command line size, terminator included.
    pub const CMDLINE_MAX_SIZE: usize = 2048;

    /// Protected-mode kernel payload; initial `RIP` for every vCPU.
    pub const KERNEL_ADDR: u64 = 0x10_0000;

    /// Initial RAM disk.
    pub const INITRD_ADDR: u64 = 0x0f00_0000;

    /// Extended BIOS Data Area; holds the MP tables.
    pub const EBDA_ADDR: u64 = 0x0009_fc00;

    /// First usable byte of conventional memory (above the real-mode IVT).
    pub const REAL_MODE_IVT_END: u64 = 0x500;

    /// Legacy VGA RAM window.
    pub const VGA_RAM_ADDR: u64 = 0x000a_0000;

    /// Motherboard BIOS ROM shadow.
    pub const MB_BIOS_ADDR: u64 = 0x000f_0000;
    pub const MB_BIOS_END: u64 = 0x0010_0000;
}

/// Errors raised while preparing guest memory for boot.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("failed to allocate guest memory: {0}")]
    MemoryAllocation(#[source] std::io::Error),

    #[error("guest memory access at {addr:#x} failed: {reason}")]
    MemoryAccess { addr: u64, reason: String },

    #[error("invalid kernel image: {0}")]
    InvalidKernel(String),

    #[error("command line too long: {len} bytes (max {max})")]
    CmdlineTooLong { len: usize, max: usize },
}
