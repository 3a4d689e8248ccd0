// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Legacy BIOS environment: BDA/EBDA clears, the embedded ROM stub with
//! its patched real-mode interrupt handlers, the E820 map, and the VGA
//! ROM stub.

use remain::sorted;
use thiserror::Error;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use vm_memory::MEM_32BIT_GAP_START;
use vm_memory::FIRST_ADDR_PAST_32BITS;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::BDA_END;
use crate::BDA_START;
use crate::BIOS_BEGIN;
use crate::BIOS_END;
use crate::BZ_KERNEL_START;
use crate::E820_MAP_START;
use crate::EBDA_END;
use crate::EBDA_START;
use crate::REAL_MODE_IVT_BEGIN;
use crate::VGA_ROM_BEGIN;
use crate::VGA_ROM_END;
use crate::VGA_ROM_MODES;
use crate::VGA_ROM_OEM_STRING;
use crate::VGA_ROM_OEM_STRING_SIZE;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("writing firmware data to guest memory failed: {0}")]
    GuestMemory(vm_memory::GuestMemoryError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const E820_RAM: u32 = 1;
pub const E820_RESERVED: u32 = 2;

const E820_MAX_ENTRIES: usize = 128;

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub type_: u32,
}

/// One entry of the real-mode interrupt vector table.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
struct IvtEntry {
    offset: u16,
    segment: u16,
}

/// The embedded BIOS ROM stub. The blob is produced out of band; the
/// monitor only knows the offsets of the handler entry points it patches
/// into the IVT.
mod rom {
    /// Offsets of the real-mode handler stubs within the blob.
    pub const OFFSET_INTFAKE: u64 = 0x0;
    pub const OFFSET_INT10: u64 = 0x10;
    pub const OFFSET_INT15: u64 = 0x20;

    /// The ROM image itself: IRET stubs at each entry point, padded out
    /// to a paragraph boundary per handler.
    pub static BIOS_ROM: &[u8] = &[
        0xcf, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, // intfake
        0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
        0xcf, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, // int10
        0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
        0xcf, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, // int15
        0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    ];
}

pub use rom::BIOS_ROM;

/// Size of the ROM blob, used by the MP table to find free BIOS space.
pub fn bios_rom_size() -> u64 {
    rom::BIOS_ROM.len() as u64
}

fn real_segment(addr: u64) -> u16 {
    (addr >> 4) as u16
}

fn ivt_entry_for(handler_addr: u64) -> IvtEntry {
    IvtEntry {
        segment: real_segment(BIOS_BEGIN),
        offset: (handler_addr - BIOS_BEGIN) as u16,
    }
}

/// Builds the E820 map at its fixed location.
///
/// Low memory up to the EBDA is usable; the EBDA-to-VGA window and the
/// BIOS window are reserved; kernel RAM starts at 1 MiB and splits around
/// the PCI hole when it crosses 3 GiB.
fn setup_e820(mem: &GuestMemory, ram_size: u64) -> Result<()> {
    let mut entries: Vec<E820Entry> = Vec::with_capacity(6);
    entries.push(E820Entry {
        addr: REAL_MODE_IVT_BEGIN,
        size: EBDA_START - REAL_MODE_IVT_BEGIN,
        type_: E820_RAM,
    });
    entries.push(E820Entry {
        addr: EBDA_START,
        size: crate::VGA_RAM_BEGIN - EBDA_START,
        type_: E820_RESERVED,
    });
    entries.push(E820Entry {
        addr: BIOS_BEGIN,
        size: BIOS_END - BIOS_BEGIN,
        type_: E820_RESERVED,
    });
    if ram_size <= MEM_32BIT_GAP_START {
        entries.push(E820Entry {
            addr: BZ_KERNEL_START,
            size: ram_size - BZ_KERNEL_START,
            type_: E820_RAM,
        });
    } else {
        entries.push(E820Entry {
            addr: BZ_KERNEL_START,
            size: MEM_32BIT_GAP_START - BZ_KERNEL_START,
            type_: E820_RAM,
        });
        entries.push(E820Entry {
            addr: FIRST_ADDR_PAST_32BITS,
            size: ram_size - MEM_32BIT_GAP_START,
            type_: E820_RAM,
        });
    }
    debug_assert!(entries.len() <= E820_MAX_ENTRIES);

    // The table is a u32 entry count followed by the entries.
    let table = GuestAddress(E820_MAP_START);
    mem.write_obj_at_addr(entries.len() as u32, table)
        .map_err(Error::GuestMemory)?;
    let mut addr = table.unchecked_add(4);
    for entry in &entries {
        mem.write_obj_at_addr(*entry, addr)
            .map_err(Error::GuestMemory)?;
        addr = addr.unchecked_add(std::mem::size_of::<E820Entry>() as u64);
    }
    Ok(())
}

/// Reads the table back, for diagnostics and tests.
pub fn read_e820(mem: &GuestMemory) -> Result<Vec<E820Entry>> {
    let table = GuestAddress(E820_MAP_START);
    let count: u32 = mem.read_obj_from_addr(table).map_err(Error::GuestMemory)?;
    let mut entries = Vec::with_capacity(count as usize);
    let mut addr = table.unchecked_add(4);
    for _ in 0..count.min(E820_MAX_ENTRIES as u32) {
        entries.push(
            mem.read_obj_from_addr(addr)
                .map_err(Error::GuestMemory)?,
        );
        addr = addr.unchecked_add(std::mem::size_of::<E820Entry>() as u64);
    }
    Ok(entries)
}

fn setup_vga_rom(mem: &GuestMemory) -> Result<()> {
    let mut oem = [0u8; VGA_ROM_OEM_STRING_SIZE as usize];
    let name = b"Broiler VESA";
    oem[..name.len()].copy_from_slice(name);
    mem.write_all_at_addr(&oem, GuestAddress(VGA_ROM_OEM_STRING))
        .map_err(Error::GuestMemory)?;
    // Supported mode list, terminated by 0xffff.
    mem.write_obj_at_addr(0x0112u16, GuestAddress(VGA_ROM_MODES))
        .map_err(Error::GuestMemory)?;
    mem.write_obj_at_addr(0xffffu16, GuestAddress(VGA_ROM_MODES + 2))
        .map_err(Error::GuestMemory)?;
    Ok(())
}

/// Sets up the whole legacy firmware environment: cleared BDA/EBDA/BIOS
/// and VGA windows, the ROM blob with its interrupt handlers wired into
/// the IVT, the E820 map, and the VGA mode stub.
pub fn setup_bios(mem: &GuestMemory, ram_size: u64) -> Result<()> {
    mem.write_zeroes_at_addr(GuestAddress(BDA_START), BDA_END - BDA_START)
        .map_err(Error::GuestMemory)?;
    mem.write_zeroes_at_addr(GuestAddress(EBDA_START), EBDA_END - EBDA_START)
        .map_err(Error::GuestMemory)?;
    mem.write_zeroes_at_addr(GuestAddress(BIOS_BEGIN), BIOS_END - BIOS_BEGIN)
        .map_err(Error::GuestMemory)?;
    mem.write_zeroes_at_addr(GuestAddress(VGA_ROM_BEGIN), VGA_ROM_END - VGA_ROM_BEGIN)
        .map_err(Error::GuestMemory)?;

    mem.write_all_at_addr(rom::BIOS_ROM, GuestAddress(BIOS_BEGIN))
        .map_err(Error::GuestMemory)?;

    setup_e820(mem, ram_size)?;
    setup_vga_rom(mem)?;

    // Point every vector at the do-nothing handler, then wire the
    // handlers the ROM actually implements.
    let fake = ivt_entry_for(BIOS_BEGIN + rom::OFFSET_INTFAKE);
    for vector in 0..256u64 {
        mem.write_obj_at_addr(fake, GuestAddress(REAL_MODE_IVT_BEGIN + vector * 4))
            .map_err(Error::GuestMemory)?;
    }
    for (vector, offset) in [(0x10u64, rom::OFFSET_INT10), (0x15, rom::OFFSET_INT15)] {
        mem.write_obj_at_addr(
            ivt_entry_for(BIOS_BEGIN + offset),
            GuestAddress(REAL_MODE_IVT_BEGIN + vector * 4),
        )
        .map_err(Error::GuestMemory)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e820_small_ram() {
        let ram_size = 128u64 << 20;
        let mem = GuestMemory::x86_layout(ram_size).unwrap();
        setup_bios(&mem, ram_size).unwrap();
        let entries = read_e820(&mem).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!({ entries[0].addr }, 0);
        assert_eq!({ entries[0].type_ }, E820_RAM);
        assert_eq!({ entries[1].type_ }, E820_RESERVED);
        assert_eq!({ entries[2].addr }, BIOS_BEGIN);
        assert_eq!({ entries[2].type_ }, E820_RESERVED);
        assert_eq!({ entries[3].addr }, BZ_KERNEL_START);
        assert_eq!({ entries[3].size }, ram_size - BZ_KERNEL_START);
        assert_eq!({ entries[3].type_ }, E820_RAM);
    }

    #[test]
    fn e820_splits_around_pci_hole() {
        let ram_size = 6144u64 << 20;
        let mem = GuestMemory::x86_layout(ram_size).unwrap();
        setup_bios(&mem, ram_size).unwrap();
        let entries = read_e820(&mem).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!({ entries[3].addr }, BZ_KERNEL_START);
        assert_eq!({ entries[3].size }, MEM_32BIT_GAP_START - BZ_KERNEL_START);
        assert_eq!({ entries[4].addr }, FIRST_ADDR_PAST_32BITS);
        assert_eq!({ entries[4].size }, ram_size - MEM_32BIT_GAP_START);
        assert_eq!({ entries[4].type_ }, E820_RAM);
    }

    #[test]
    fn vga_rom_contents() {
        let ram_size = 16u64 << 20;
        let mem = GuestMemory::x86_layout(ram_size).unwrap();
        setup_bios(&mem, ram_size).unwrap();
        let mut oem = [0u8; 12];
        mem.read_exact_at_addr(&mut oem, GuestAddress(VGA_ROM_OEM_STRING))
            .unwrap();
        assert_eq!(&oem, b"Broiler VESA");
        let mode: u16 = mem.read_obj_from_addr(GuestAddress(VGA_ROM_MODES)).unwrap();
        let term: u16 = mem
            .read_obj_from_addr(GuestAddress(VGA_ROM_MODES + 2))
            .unwrap();
        assert_eq!((mode, term), (0x0112, 0xffff));
    }

    #[test]
    fn ivt_points_into_bios() {
        let ram_size = 16u64 << 20;
        let mem = GuestMemory::x86_layout(ram_size).unwrap();
        setup_bios(&mem, ram_size).unwrap();
        let int10: IvtEntry = mem.read_obj_from_addr(GuestAddress(0x10 * 4)).unwrap();
        assert_eq!(int10.segment, 0xf000);
        assert_eq!(int10.offset, rom::OFFSET_INT10 as u16);
        // Unhandled vectors share the fake handler.
        let int13: IvtEntry = mem.read_obj_from_addr(GuestAddress(0x13 * 4)).unwrap();
        assert_eq!(int13.offset, rom::OFFSET_INTFAKE as u16);
    }
}
