//! MP (Intel MultiProcessor spec 1.4) table generation.
//!
//! The kernel discovers CPU topology and legacy interrupt routing by
//! scanning for the `_MP_` floating pointer in the EBDA. We generate a
//! floating pointer plus a configuration table with one processor entry per
//! vCPU, an ISA bus, the IOAPIC, a 1:1 mapping of the 16 ISA IRQs and the
//! ExtINT/NMI local interrupt lines.
//!
//! Layout in guest memory:
//!
//! ```text
//! 0x0009_fc00  MP floating pointer (16 bytes)
//! 0x0009_fc10  MP configuration table header + entries
//! ```

use super::layout;
use super::memory::GuestMemory;
use super::BootError;

const LOCAL_APIC_ADDR: u32 = 0xfee0_0000;
const IO_APIC_ADDR: u32 = 0xfec0_0000;
const APIC_VERSION: u8 = 0x14;
const NUM_ISA_IRQS: u8 = 16;

const MP_SPEC_REVISION: u8 = 4; // MP spec 1.4

// Configuration table entry types.
const ENTRY_PROCESSOR: u8 = 0;
const ENTRY_BUS: u8 = 1;
const ENTRY_IOAPIC: u8 = 2;
const ENTRY_INTSRC: u8 = 3;
const ENTRY_LINTSRC: u8 = 4;

const CPU_FLAG_ENABLED: u8 = 0x01;
const CPU_FLAG_BSP: u8 = 0x02;
const CPU_SIGNATURE: u32 = 0x600;
const CPU_FEATURE_FPU: u32 = 0x001;
const CPU_FEATURE_APIC: u32 = 0x200;

const INT_TYPE_INT: u8 = 0;
const INT_TYPE_NMI: u8 = 1;
const INT_TYPE_EXTINT: u8 = 3;

/// Two's-complement byte checksum: the table must sum to zero.
fn checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Write the MP floating pointer and configuration table for `n_cpus`
/// processors into the EBDA. Returns the base address.
pub fn write(mem: &GuestMemory, n_cpus: u8) -> Result<u64, BootError> {
    let config_addr = layout::EBDA_ADDR + 16;
    let ioapic_id = n_cpus; // APIC IDs 0..n_cpus are the processors

    let mut table = Vec::with_capacity(256);
    let mut entry_count = 0u16;

    // Header, length/count/checksum patched once the entries are in place.
    table.extend_from_slice(b"PCMP");
    table.extend_from_slice(&0u16.to_le_bytes()); // length, patched below
    table.push(MP_SPEC_REVISION);
    table.push(0); // checksum, patched below
    table.extend_from_slice(b"ARGON   "); // OEM id, 8 bytes
    table.extend_from_slice(b"VMM         "); // product id, 12 bytes
    table.extend_from_slice(&0u32.to_le_bytes()); // OEM table pointer
    table.extend_from_slice(&0u16.to_le_bytes()); // OEM table size
    table.extend_from_slice(&0u16.to_le_bytes()); // entry count, patched below
    table.extend_from_slice(&LOCAL_APIC_ADDR.to_le_bytes());
    table.extend_from_slice(&0u16.to_le_bytes()); // extended table length
    table.push(0); // extended table checksum
    table.push(0); // reserved

    for cpu in 0..n_cpus {
        table.push(ENTRY_PROCESSOR);
        table.push(cpu); // local APIC id
        table.push(APIC_VERSION);
        table.push(CPU_FLAG_ENABLED | if cpu == 0 { CPU_FLAG_BSP } else { 0 });
        table.extend_from_slice(&CPU_SIGNATURE.to_le_bytes());
        table.extend_from_slice(&(CPU_FEATURE_FPU | CPU_FEATURE_APIC).to_le_bytes());
        table.extend_from_slice(&[0u8; 8]); // reserved
        entry_count += 1;
    }

    table.push(ENTRY_BUS);
    table.push(0); // bus id
    table.extend_from_slice(b"ISA   ");
    entry_count += 1;

    table.push(ENTRY_IOAPIC);
    table.push(ioapic_id);
    table.push(APIC_VERSION);
    table.push(1); // enabled
    table.extend_from_slice(&IO_APIC_ADDR.to_le_bytes());
    entry_count += 1;

    for irq in 0..NUM_ISA_IRQS {
        table.push(ENTRY_INTSRC);
        table.push(INT_TYPE_INT);
        table.extend_from_slice(&0u16.to_le_bytes()); // default polarity/trigger
        table.push(0); // ISA bus
        table.push(irq);
        table.push(ioapic_id);
        table.push(irq); // 1:1 routing
        entry_count += 1;
    }

    // ExtINT on LINT0 of the BSP, NMI on LINT1 of all processors.
    for (int_type, dst_apic, lint) in [(INT_TYPE_EXTINT, 0u8, 0u8), (INT_TYPE_NMI, 0xff, 1)] {
        table.push(ENTRY_LINTSRC);
        table.push(int_type);
        table.extend_from_slice(&0u16.to_le_bytes());
        table.push(0);
        table.push(0);
        table.push(dst_apic);
        table.push(lint);
        entry_count += 1;
    }

    let len = table.len() as u16;
    table[4..6].copy_from_slice(&len.to_le_bytes());
    table[34..36].copy_from_slice(&entry_count.to_le_bytes());
    table[7] = checksum(&table);

    let mut floating = Vec::with_capacity(16);
    floating.extend_from_slice(b"_MP_");
    floating.extend_from_slice(&(config_addr as u32).to_le_bytes());
    floating.push(1); // structure length in 16-byte units
    floating.push(MP_SPEC_REVISION);
    floating.push(0); // checksum, patched below
    floating.extend_from_slice(&[0u8; 5]); // features: config table present
    floating[10] = checksum(&floating);

    mem.write(layout::EBDA_ADDR, &floating)?;
    mem.write(config_addr, &table)?;

    log::debug!(
        "MP tables at {:#x}: {} entries for {} cpu(s)",
        layout::EBDA_ADDR,
        entry_count,
        n_cpus
    );

    Ok(layout::EBDA_ADDR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(mem: &GuestMemory, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        mem.read(addr, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_checksum_balances() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let c = checksum(&data);
        let total = data.iter().fold(c, |acc, &b| acc.wrapping_add(b));
        assert_eq!(total, 0);
    }

    #[test]
    fn test_signatures_and_checksums() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        write(&mem, 2).unwrap();

        let floating = read_vec(&mem, layout::EBDA_ADDR, 16);
        assert_eq!(&floating[0..4], b"_MP_");
        assert_eq!(floating.iter().fold(0u8, |a, &b| a.wrapping_add(b)), 0);

        let header = read_vec(&mem, layout::EBDA_ADDR + 16, 44);
        assert_eq!(&header[0..4], b"PCMP");

        let table_len = u16::from_le_bytes([header[4], header[5]]) as usize;
        let table = read_vec(&mem, layout::EBDA_ADDR + 16, table_len);
        assert_eq!(table.iter().fold(0u8, |a, &b| a.wrapping_add(b)), 0);
    }

    #[test]
    fn test_entry_count_scales_with_cpus() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        for n_cpus in [1u8, 4] {
            write(&mem, n_cpus).unwrap();
            let header = read_vec(&mem, layout::EBDA_ADDR + 16, 44);
            let entries = u16::from_le_bytes([header[34], header[35]]);
            // processors + bus + ioapic + 16 intsrc + 2 lintsrc
            assert_eq!(entries, n_cpus as u16 + 1 + 1 + 16 + 2);
        }
    }
}
