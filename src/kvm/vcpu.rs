//! Per-vCPU KVM operations: run, registers, single-step, translation.

use super::KvmError;
use kvm_bindings::{
    kvm_guest_debug, kvm_regs, kvm_sregs, kvm_translation, KVM_GUESTDBG_ENABLE,
    KVM_GUESTDBG_SINGLESTEP,
};
use kvm_ioctls::VcpuExit;
use std::os::fd::{AsRawFd, RawFd};

/// A virtual CPU.
///
/// The wrapper owns the vCPU fd and its mmapped `kvm_run` page (both live
/// inside `kvm_ioctls::VcpuFd`). One host thread drives a vCPU for its
/// whole lifetime: KVM keeps per-vCPU state affine to the thread that
/// issues the ioctls, and switching threads between ioctls costs at best a
/// performance penalty.
pub struct Vcpu {
    fd: kvm_ioctls::VcpuFd,
}

impl Vcpu {
    pub fn new(fd: kvm_ioctls::VcpuFd) -> Self {
        Self { fd }
    }

    /// Enter the guest and block until the next VM exit.
    ///
    /// A run ioctl interrupted by a host signal (`EINTR`) or told to back
    /// off (`EAGAIN`) is not an error; it surfaces as an `Intr` exit the
    /// run loop treats as "continue". Everything else is fatal.
    pub fn run(&mut self) -> Result<VcpuExit<'_>, KvmError> {
        match self.fd.run() {
            Ok(exit) => Ok(exit),
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => Ok(VcpuExit::Intr),
            Err(e) => Err(KvmError::Run(e)),
        }
    }

    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.fd.get_regs().map_err(KvmError::GetRegisters)
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.fd.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.fd.get_sregs().map_err(KvmError::GetRegisters)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.fd.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    /// Toggle single-step execution. While enabled, every guest
    /// instruction retires into a DEBUG exit.
    pub fn set_single_step(&self, enable: bool) -> Result<(), KvmError> {
        let control = if enable {
            KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP
        } else {
            0
        };

        let debug = kvm_guest_debug {
            control,
            ..Default::default()
        };

        self.fd
            .set_guest_debug(&debug)
            .map_err(KvmError::SetGuestDebug)
    }

    /// Translate a guest virtual address through the vCPU's current paging
    /// mode (KVM_TRANSLATE).
    pub fn translate(&self, gva: u64) -> Result<kvm_translation, KvmError> {
        self.fd.translate_gva(gva).map_err(KvmError::Translate)
    }
}

impl AsRawFd for Vcpu {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
