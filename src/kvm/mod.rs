//! Safe wrappers over the KVM ioctl surface.
//!
//! KVM exposes hardware-assisted virtualization through ioctls on three
//! kinds of file descriptors:
//!
//! - `/dev/kvm` — system scope: API version, capability queries, VM creation
//! - VM fd — machine scope: memory slots, irqchip, PIT, vCPU creation,
//!   interrupt lines
//! - vCPU fd — per-CPU scope: run, registers, debug, address translation
//!
//! ```text
//! User space (argon)                 Kernel (KVM module)
//! ┌──────────────┐     ioctl()     ┌──────────────────┐
//! │ VmHandle ────┼────────────────►│ VM state         │
//! │ Vcpu ────────┼────────────────►│ vCPU state       │
//! └──────────────┘                 └────────┬─────────┘
//!                                           │ VT-x / AMD-V
//!                                  ┌────────▼─────────┐
//!                                  │ CPU hardware     │
//!                                  └──────────────────┘
//! ```
//!
//! The kvm-ioctls crate carries the raw ioctl plumbing; this module adds
//! the VMM's policy: the API version gate, the fixed TSS/identity-map
//! addresses Intel hardware needs, the in-kernel irqchip and PIT, the
//! CPUID filtering applied to every vCPU, and the edge-triggered interrupt
//! line capability handed to device back-ends.
//!
//! A note on threading: vCPU ioctls should be issued from the thread that
//! runs the vCPU. Each [`Vcpu`] is driven by exactly one host thread for
//! its lifetime; the machine enforces this by construction.

mod vcpu;
mod vm;

pub use vcpu::Vcpu;
pub use vm::{IrqLine, IrqTrigger, VmHandle};

use kvm_bindings::{KVM_API_VERSION, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VmFd};
use thiserror::Error;

/// Errors from the KVM ioctl layer.
#[derive(Error, Debug)]
pub enum KvmError {
    /// `/dev/kvm` missing, inaccessible, or nested virt disabled.
    #[error("failed to open /dev/kvm: {0}")]
    Open(#[source] kvm_ioctls::Error),

    #[error("unsupported KVM API version {0} (want {KVM_API_VERSION})")]
    ApiVersion(i32),

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("failed to set TSS address: {0}")]
    SetTssAddr(#[source] kvm_ioctls::Error),

    #[error("failed to set identity map address: {0}")]
    SetIdentityMapAddr(#[source] kvm_ioctls::Error),

    #[error("failed to create in-kernel irqchip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("failed to create PIT: {0}")]
    CreatePit(#[source] kvm_ioctls::Error),

    #[error("failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("failed to query supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("failed to toggle guest debug: {0}")]
    SetGuestDebug(#[source] kvm_ioctls::Error),

    #[error("failed to translate guest address: {0}")]
    Translate(#[source] kvm_ioctls::Error),

    #[error("failed to set irq line {irq}: {source}")]
    IrqLine {
        irq: u32,
        #[source]
        source: kvm_ioctls::Error,
    },
}

/// Open `/dev/kvm`, check the API version, and create a fully initialized
/// VM (TSS, identity map, irqchip, PIT — see [`VmHandle::new`]).
pub fn create_vm() -> Result<VmHandle, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::Open)?;

    let version = kvm.get_api_version();
    if version != KVM_API_VERSION as i32 {
        return Err(KvmError::ApiVersion(version));
    }

    // The supported-CPUID table is queried once and filtered per vCPU when
    // the machine creates them.
    let supported_cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(KvmError::GetSupportedCpuid)?;

    let vm: VmFd = kvm.create_vm().map_err(KvmError::CreateVm)?;

    VmHandle::new(vm, supported_cpuid)
}

/// True when this host can run a VM; used by tests to skip gracefully.
pub fn available() -> bool {
    Kvm::new().is_ok()
}
