// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MP specification table construction. The table lands in the BIOS
//! window right after the ROM blob.

use remain::sorted;
use thiserror::Error;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::bios::bios_rom_size;
use crate::APIC_DEFAULT_PHYS_BASE;
use crate::BIOS_BEGIN;
use crate::BIOS_END;
use crate::IO_APIC_DEFAULT_PHYS_BASE;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("writing MP table to guest memory failed: {0}")]
    GuestMemory(vm_memory::GuestMemoryError),
    #[error("MP table does not fit in the BIOS window")]
    TableTooBig,
}

pub type Result<T> = std::result::Result<T, Error>;

const MPC_SIGNATURE: [u8; 4] = *b"PCMP";
const MPF_SIGNATURE: [u8; 4] = *b"_MP_";
const MPC_OEM: [u8; 8] = *b"BROILER ";
const MPC_PRODUCT_ID: [u8; 12] = *b"0.1         ";
const MPC_SPEC: u8 = 4;

const MP_PROCESSOR: u8 = 0;
const MP_BUS: u8 = 1;
const MP_IOAPIC: u8 = 2;
const MP_INTSRC: u8 = 3;
const MP_LINTSRC: u8 = 4;

const MP_IRQ_TYPE_INT: u8 = 0;
const MP_IRQ_TYPE_NMI: u8 = 1;
const MP_IRQ_TYPE_EXTINT: u8 = 3;

const CPU_ENABLED: u8 = 1;
const CPU_BOOTPROCESSOR: u8 = 2;
const MPC_APIC_USABLE: u8 = 1;

const APIC_VERSION: u8 = 0x14;

const BUS_ID_PCI: u8 = 0;
const BUS_ID_ISA: u8 = 1;

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
struct MpfIntel {
    signature: [u8; 4],
    physptr: u32,
    length: u8,
    specification: u8,
    checksum: u8,
    feature1: u8,
    feature2: u8,
    feature3: u8,
    feature4: u8,
    feature5: u8,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
struct MpcTable {
    signature: [u8; 4],
    length: u16,
    spec: u8,
    checksum: u8,
    oem: [u8; 8],
    product_id: [u8; 12],
    oemptr: u32,
    oemsize: u16,
    oemcount: u16,
    lapic: u32,
    reserved: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
struct MpcCpu {
    type_: u8,
    apicid: u8,
    apicver: u8,
    cpuflag: u8,
    cpufeature: u32,
    featureflag: u32,
    reserved: [u32; 2],
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
struct MpcBus {
    type_: u8,
    busid: u8,
    bustype: [u8; 6],
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
struct MpcIoapic {
    type_: u8,
    apicid: u8,
    apicver: u8,
    flags: u8,
    apicaddr: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
struct MpcIntsrc {
    type_: u8,
    irqtype: u8,
    irqflag: u16,
    srcbus: u8,
    srcbusirq: u8,
    dstapic: u8,
    dstirq: u8,
}

/// What the table needs to know about one PCI device.
#[derive(Copy, Clone, Debug)]
pub struct PciIrq {
    pub dev_num: u8,
    pub irq_pin: u8,
    pub irq_line: u8,
}

fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u32, |acc, b| acc + *b as u32);
    (!(sum as u8)).wrapping_add(1)
}

/// Builds the MP floating pointer and configuration table: one processor
/// entry per vCPU, the PCI and ISA buses, the IOAPIC, an interrupt
/// source per PCI device, and the two local interrupt assignments.
pub fn setup_mptable(mem: &GuestMemory, num_cpus: u8, pci_irqs: &[PciIrq]) -> Result<()> {
    let table_base = (BIOS_BEGIN + bios_rom_size() + 0xf) & !0xf;

    let mut body: Vec<u8> = Vec::new();
    let mut entry_count = 0u16;

    for cpu_id in 0..num_cpus {
        let cpu = MpcCpu {
            type_: MP_PROCESSOR,
            apicid: cpu_id,
            apicver: APIC_VERSION,
            cpuflag: CPU_ENABLED | if cpu_id == 0 { CPU_BOOTPROCESSOR } else { 0 },
            cpufeature: 0x600,
            featureflag: 0x201,
            ..Default::default()
        };
        body.extend_from_slice(cpu.as_bytes());
        entry_count += 1;
    }

    for (busid, name) in [(BUS_ID_PCI, *b"PCI   "), (BUS_ID_ISA, *b"ISA   ")] {
        let bus = MpcBus {
            type_: MP_BUS,
            busid,
            bustype: name,
        };
        body.extend_from_slice(bus.as_bytes());
        entry_count += 1;
    }

    let ioapic_id = num_cpus + 1;
    let ioapic = MpcIoapic {
        type_: MP_IOAPIC,
        apicid: ioapic_id,
        apicver: APIC_VERSION,
        flags: MPC_APIC_USABLE,
        apicaddr: IO_APIC_DEFAULT_PHYS_BASE,
    };
    body.extend_from_slice(ioapic.as_bytes());
    entry_count += 1;

    for pci_irq in pci_irqs {
        let intsrc = MpcIntsrc {
            type_: MP_INTSRC,
            irqtype: MP_IRQ_TYPE_INT,
            irqflag: 0,
            srcbus: BUS_ID_PCI,
            srcbusirq: (pci_irq.dev_num << 2) | (pci_irq.irq_pin - 1),
            dstapic: ioapic_id,
            dstirq: pci_irq.irq_line,
        };
        body.extend_from_slice(intsrc.as_bytes());
        entry_count += 1;
    }

    for (irqtype, dstirq) in [(MP_IRQ_TYPE_EXTINT, 0u8), (MP_IRQ_TYPE_NMI, 1)] {
        let lintsrc = MpcIntsrc {
            type_: MP_LINTSRC,
            irqtype,
            irqflag: 0,
            srcbus: BUS_ID_ISA,
            srcbusirq: 0,
            dstapic: 0,
            dstirq,
        };
        body.extend_from_slice(lintsrc.as_bytes());
        entry_count += 1;
    }

    let mut table = MpcTable {
        signature: MPC_SIGNATURE,
        length: (std::mem::size_of::<MpcTable>() + body.len()) as u16,
        spec: MPC_SPEC,
        checksum: 0,
        oem: MPC_OEM,
        product_id: MPC_PRODUCT_ID,
        oemcount: entry_count,
        lapic: APIC_DEFAULT_PHYS_BASE,
        ..Default::default()
    };
    let mut table_bytes = Vec::with_capacity(table.length as usize);
    table_bytes.extend_from_slice(table.as_bytes());
    table_bytes.extend_from_slice(&body);
    table.checksum = checksum(&table_bytes);
    table_bytes[..std::mem::size_of::<MpcTable>()].copy_from_slice(table.as_bytes());

    // Floating pointer directly after the table, paragraph aligned.
    let mpf_base = (table_base + table_bytes.len() as u64 + 0xf) & !0xf;
    let mut mpf = MpfIntel {
        signature: MPF_SIGNATURE,
        physptr: table_base as u32,
        length: 1,
        specification: MPC_SPEC,
        ..Default::default()
    };
    mpf.checksum = checksum(mpf.as_bytes());

    if mpf_base + std::mem::size_of::<MpfIntel>() as u64 > BIOS_END {
        return Err(Error::TableTooBig);
    }

    mem.write_all_at_addr(&table_bytes, GuestAddress(table_base))
        .map_err(Error::GuestMemory)?;
    mem.write_obj_at_addr(mpf, GuestAddress(mpf_base))
        .map_err(Error::GuestMemory)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_base() -> u64 {
        (BIOS_BEGIN + bios_rom_size() + 0xf) & !0xf
    }

    #[test]
    fn table_checksums_to_zero() {
        let mem = GuestMemory::x86_layout(16 << 20).unwrap();
        setup_mptable(
            &mem,
            2,
            &[PciIrq {
                dev_num: 0,
                irq_pin: 1,
                irq_line: 5,
            }],
        )
        .unwrap();

        let header: MpcTable = mem
            .read_obj_from_addr(GuestAddress(table_base()))
            .unwrap();
        assert_eq!(&header.signature, b"PCMP");
        let len = header.length as usize;
        let mut raw = vec![0u8; len];
        mem.read_exact_at_addr(&mut raw, GuestAddress(table_base()))
            .unwrap();
        let sum = raw.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn floating_pointer_references_table() {
        let mem = GuestMemory::x86_layout(16 << 20).unwrap();
        setup_mptable(&mem, 1, &[]).unwrap();
        let header: MpcTable = mem
            .read_obj_from_addr(GuestAddress(table_base()))
            .unwrap();
        let mpf_base = (table_base() + header.length as u64 + 0xf) & !0xf;
        let mpf: MpfIntel = mem.read_obj_from_addr(GuestAddress(mpf_base)).unwrap();
        assert_eq!(&mpf.signature, b"_MP_");
        assert_eq!({ mpf.physptr }, table_base() as u32);
        let sum = mpf
            .as_bytes()
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn processor_count_matches() {
        let mem = GuestMemory::x86_layout(16 << 20).unwrap();
        setup_mptable(&mem, 4, &[]).unwrap();
        let header: MpcTable = mem
            .read_obj_from_addr(GuestAddress(table_base()))
            .unwrap();
        // 4 CPUs + 2 buses + IOAPIC + 2 LINT entries.
        assert_eq!({ header.oemcount }, 9);
    }
}
