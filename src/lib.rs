//! argon — a minimal KVM virtual machine monitor.
//!
//! Boots an unmodified 64-bit Linux bzImage with an initrd on top of
//! `/dev/kvm`, with enough emulated hardware to reach a shell and speak
//! TCP/IP:
//!
//! - an 8250 serial console on COM1, wired to host stdin/stdout
//! - a legacy virtio-net PCI function backed by a host TAP interface
//! - a legacy virtio-blk PCI function backed by a raw disk image
//!
//! The in-kernel irqchip and PIT handle interrupts and timing; everything
//! else the guest touches — port I/O, PCI configuration space, the virtio
//! rings — is emulated here in user space.
//!
//! ```no_run
//! use argon::Machine;
//! use std::path::Path;
//!
//! fn main() -> Result<(), argon::machine::Error> {
//!     let machine = Machine::new(1, argon::machine::DEFAULT_MEM_SIZE, None, None)?;
//!     machine.load_linux(Path::new("bzImage"), Path::new("initrd"), "console=ttyS0")?;
//!     machine.run_infinite_loop(0)
//! }
//! ```

pub mod boot;
pub mod devices;
pub mod kvm;
pub mod machine;
pub mod tap;

pub use machine::Machine;
