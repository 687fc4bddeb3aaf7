//! VM-scope KVM operations: machine components, memory slots, vCPU
//! creation, interrupt lines.

use super::{KvmError, Vcpu};
use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, CpuId, KVM_PIT_SPEAKER_DUMMY};
use std::sync::Arc;

/// Guest-physical address of the three-page region Intel VT-x needs for
/// its task-state scratch area. Must not collide with RAM or MMIO; we park
/// it just below 4 GiB.
const TSS_ADDR: usize = 0xffff_d000;

/// Guest-physical address of the EPT identity-map page, directly below the
/// TSS pages. Like the TSS this is a VT-x implementation requirement.
const IDENTITY_MAP_ADDR: u64 = 0xffff_c000;

/// CPUID leaf for architectural performance monitoring.
const CPUID_LEAF_PERFMON: u32 = 0x0a;

/// KVM paravirtual CPUID leaves.
const CPUID_LEAF_KVM_SIGNATURE: u32 = 0x4000_0000;
const CPUID_LEAF_KVM_FEATURES: u32 = 0x4000_0001;

/// A VM with its required x86 machine components in place.
///
/// Construction installs, in order: the TSS address, the identity-map
/// address, the in-kernel irqchip (PIC master/slave + IOAPIC), and the
/// in-kernel PIT. All of these must exist before the first vCPU runs; the
/// irqchip must exist before any interrupt line is pulled.
pub struct VmHandle {
    vm: kvm_ioctls::VmFd,
    supported_cpuid: CpuId,
}

impl VmHandle {
    pub fn new(vm: kvm_ioctls::VmFd, supported_cpuid: CpuId) -> Result<Self, KvmError> {
        vm.set_tss_address(TSS_ADDR).map_err(KvmError::SetTssAddr)?;

        vm.set_identity_map_address(IDENTITY_MAP_ADDR)
            .map_err(KvmError::SetIdentityMapAddr)?;

        // In-kernel PIC + IOAPIC: interrupt delivery without a VM exit per
        // injection, and the target of our edge-triggered IRQ lines.
        vm.create_irq_chip().map_err(KvmError::CreateIrqChip)?;

        // The guest calibrates its early timekeeping against the 8254.
        // SPEAKER_DUMMY keeps port 0x61 handled in-kernel so speaker polls
        // never reach our port table.
        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        vm.create_pit2(pit_config).map_err(KvmError::CreatePit)?;

        Ok(Self {
            vm,
            supported_cpuid,
        })
    }

    /// Install the guest RAM mapping as memory slot 0 at guest physical 0.
    ///
    /// # Safety
    ///
    /// `host_addr..host_addr + size` must be a valid mapping that outlives
    /// the VM and is never unmapped or moved while any vCPU can run. The
    /// machine guarantees this by owning the memory for its own lifetime.
    pub unsafe fn install_ram(&self, size: u64, host_addr: u64) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot: 0,
            flags: 0,
            guest_phys_addr: 0,
            memory_size: size,
            userspace_addr: host_addr,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Create a vCPU and apply the filtered CPUID table.
    pub fn create_vcpu(&self, id: u64) -> Result<Vcpu, KvmError> {
        let fd = self.vm.create_vcpu(id).map_err(KvmError::CreateVcpu)?;

        // Start from what the host supports, then hide the PMU and claim
        // the KVM paravirt signature so the guest enables kvmclock and
        // friends.
        let mut cpuid = self.supported_cpuid.clone();
        for entry in cpuid.as_mut_slice() {
            match entry.function {
                CPUID_LEAF_PERFMON => entry.eax = 0,
                CPUID_LEAF_KVM_SIGNATURE => {
                    entry.eax = CPUID_LEAF_KVM_FEATURES;
                    entry.ebx = 0x4b4d_564b; // "KVMK"
                    entry.ecx = 0x564b_4d56; // "VMKV"
                    entry.edx = 0x0000_004d; // "M"
                }
                _ => {}
            }
        }
        fd.set_cpuid2(&cpuid).map_err(KvmError::SetCpuid)?;

        Ok(Vcpu::new(fd))
    }

    /// Set the level of a GSI on the in-kernel interrupt controller.
    pub fn set_irq_line(&self, irq: u32, active: bool) -> Result<(), KvmError> {
        self.vm
            .set_irq_line(irq, active)
            .map_err(|source| KvmError::IrqLine { irq, source })
    }
}

/// Interrupt-injection capability handed to device back-ends.
///
/// Devices never see the VM handle; they get a trigger for exactly the
/// line they own. Keeping this a trait lets device tests count injections
/// without a VM.
pub trait IrqTrigger: Send + Sync {
    fn trigger(&self) -> Result<(), KvmError>;
}

/// An edge-triggered interrupt line on the in-kernel PIC/IOAPIC.
#[derive(Clone)]
pub struct IrqLine {
    vm: Arc<VmHandle>,
    irq: u32,
}

impl IrqLine {
    pub fn new(vm: Arc<VmHandle>, irq: u32) -> Self {
        Self { vm, irq }
    }
}

impl IrqTrigger for IrqLine {
    /// Pulse the line low then high. Edge-triggered inputs latch on the
    /// 0→1 transition, so back-to-back pulses deliver distinct interrupts.
    fn trigger(&self) -> Result<(), KvmError> {
        self.vm.set_irq_line(self.irq, false)?;
        self.vm.set_irq_line(self.irq, true)
    }
}
