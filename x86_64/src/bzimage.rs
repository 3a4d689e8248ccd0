// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Loader for the bzImage boot protocol. Only the header fields the
//! protocol obliges a loader to consume or fill are touched; see the
//! kernel's Documentation/x86/boot.rst for the full format.

use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;

use remain::sorted;
use thiserror::Error;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::BootParams;
use crate::BOOT_CMDLINE_OFFSET;
use crate::BOOT_LOADER_IP;
use crate::BOOT_LOADER_SELECTOR;
use crate::BOOT_LOADER_SP;
use crate::BZ_KERNEL_START;

const BZIMAGE_MAGIC: u32 = 0x5372_6448; // "HdrS"
const BOOT_PROTOCOL_REQUIRED: u16 = 0x0206;

/// Offset of the setup header within the boot sector.
const SETUP_HEADER_OFFSET: u64 = 0x1f1;

const LOADFLAGS_CAN_USE_HEAP: u8 = 0x80;
const TYPE_OF_LOADER_UNDEFINED: u8 = 0xff;
const HEAP_END: u16 = 0xfe00;

/// The real-mode entry point is 512 bytes into the setup image.
const SETUP_ENTRY_OFFSET: u16 = 0x200;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("kernel image is not a bzImage")]
    BadMagic,
    #[error("cmdline does not fit the kernel's limit of {0} bytes")]
    CmdlineTooLarge(u32),
    #[error("copying kernel into guest memory failed: {0}")]
    GuestMemory(vm_memory::GuestMemoryError),
    #[error("kernel protected-mode image does not fit in guest RAM")]
    KernelTooLarge,
    #[error("boot protocol {0:#x} is older than required {required:#x}", required = BOOT_PROTOCOL_REQUIRED)]
    OldProtocol(u16),
    #[error("reading kernel image failed: {0}")]
    ReadKernel(std::io::Error),
    #[error("seeking kernel image failed: {0}")]
    SeekKernel(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The part of the setup header this loader reads and patches, starting
/// at offset 0x1f1 of the boot sector.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct SetupHeader {
    pub setup_sects: u8,
    pub root_flags: u16,
    pub syssize: u32,
    pub ram_size: u16,
    pub vid_mode: u16,
    pub root_dev: u16,
    pub boot_flag: u16,
    pub jump: u16,
    pub header: u32,
    pub version: u16,
    pub realmode_swtch: u32,
    pub start_sys_seg: u16,
    pub kernel_version: u16,
    pub type_of_loader: u8,
    pub loadflags: u8,
    pub setup_move_size: u16,
    pub code32_start: u32,
    pub ramdisk_image: u32,
    pub ramdisk_size: u32,
    pub bootsect_kludge: u32,
    pub heap_end_ptr: u16,
    pub ext_loader_ver: u8,
    pub ext_loader_type: u8,
    pub cmd_line_ptr: u32,
    pub initrd_addr_max: u32,
    pub kernel_alignment: u32,
    pub relocatable_kernel: u8,
    pub min_alignment: u8,
    pub xloadflags: u16,
    pub cmdline_size: u32,
}

/// Loads a bzImage: setup code at `boot_loader_selector:0`, the
/// protected-mode image flat at 1 MiB, and the command line at its fixed
/// offset with the header patched to point at it.
pub fn load_bzimage<F: Read + Seek>(
    mem: &GuestMemory,
    kernel_image: &mut F,
    cmdline: &str,
) -> Result<BootParams> {
    kernel_image
        .seek(SeekFrom::Start(SETUP_HEADER_OFFSET))
        .map_err(Error::SeekKernel)?;
    let mut header = SetupHeader::new_zeroed();
    kernel_image
        .read_exact(header.as_bytes_mut())
        .map_err(Error::ReadKernel)?;

    if header.header != BZIMAGE_MAGIC {
        return Err(Error::BadMagic);
    }
    if header.version < BOOT_PROTOCOL_REQUIRED {
        return Err(Error::OldProtocol(header.version));
    }

    // Setup image: boot sector plus setup sectors.
    let setup_size = (header.setup_sects as usize + 1) * 512;
    let setup_addr = GuestAddress::from_real_mode(BOOT_LOADER_SELECTOR, BOOT_LOADER_IP);
    kernel_image
        .seek(SeekFrom::Start(0))
        .map_err(Error::SeekKernel)?;
    mem.read_to_memory(setup_addr, kernel_image, setup_size)
        .map_err(Error::GuestMemory)?;

    // The protected-mode image is everything after the setup sectors,
    // loaded flat at the traditional 1 MiB mark.
    let file_size = kernel_image
        .seek(SeekFrom::End(0))
        .map_err(Error::SeekKernel)?;
    let kernel_size = file_size
        .checked_sub(setup_size as u64)
        .ok_or(Error::BadMagic)? as usize;
    let kernel_end = BZ_KERNEL_START + kernel_size as u64;
    if kernel_end > mem.end_addr().offset() || !mem.address_in_range(GuestAddress(kernel_end - 1))
    {
        return Err(Error::KernelTooLarge);
    }
    kernel_image
        .seek(SeekFrom::Start(setup_size as u64))
        .map_err(Error::SeekKernel)?;
    mem.read_to_memory(GuestAddress(BZ_KERNEL_START), kernel_image, kernel_size)
        .map_err(Error::GuestMemory)?;

    // Command line, NUL terminated, clamped to the kernel's limit.
    let cmdline_len = cmdline.len() as u32 + 1;
    if header.cmdline_size != 0 && cmdline_len > header.cmdline_size {
        return Err(Error::CmdlineTooLarge(header.cmdline_size));
    }
    mem.write_zeroes_at_addr(GuestAddress(BOOT_CMDLINE_OFFSET), cmdline_len as u64)
        .map_err(Error::GuestMemory)?;
    mem.write_all_at_addr(cmdline.as_bytes(), GuestAddress(BOOT_CMDLINE_OFFSET))
        .map_err(Error::GuestMemory)?;

    // Patch the copy of the header now living in guest memory.
    header.type_of_loader = TYPE_OF_LOADER_UNDEFINED;
    header.heap_end_ptr = HEAP_END;
    header.loadflags |= LOADFLAGS_CAN_USE_HEAP;
    header.cmd_line_ptr = BOOT_CMDLINE_OFFSET as u32;
    header.vid_mode = 0;
    mem.write_obj_at_addr(header, setup_addr.unchecked_add(SETUP_HEADER_OFFSET))
        .map_err(Error::GuestMemory)?;

    Ok(BootParams {
        boot_selector: BOOT_LOADER_SELECTOR,
        boot_ip: BOOT_LOADER_IP + SETUP_ENTRY_OFFSET,
        boot_sp: BOOT_LOADER_SP,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A minimal, well-formed bzImage: one setup sector pair and a tiny
    /// protected-mode payload.
    fn fake_bzimage(version: u16, setup_sects: u8) -> Vec<u8> {
        let mut image = vec![0u8; (setup_sects as usize + 1) * 512 + 1024];
        let mut header = SetupHeader::new_zeroed();
        header.setup_sects = setup_sects;
        header.header = BZIMAGE_MAGIC;
        header.version = version;
        header.cmdline_size = 2048;
        image[SETUP_HEADER_OFFSET as usize..SETUP_HEADER_OFFSET as usize + header.as_bytes().len()]
            .copy_from_slice(header.as_bytes());
        // Recognizable first bytes of the protected-mode image.
        let pm = (setup_sects as usize + 1) * 512;
        image[pm..pm + 4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        image
    }

    #[test]
    fn loads_and_patches_header() {
        let mem = GuestMemory::x86_layout(16 << 20).unwrap();
        let mut image = Cursor::new(fake_bzimage(0x020f, 3));
        let params = load_bzimage(&mem, &mut image, "console=ttyS0").unwrap();
        assert_eq!(params.boot_selector, 0x1000);
        assert_eq!(params.boot_ip, 0x200);
        assert_eq!(params.boot_sp, 0x8000);

        // Protected-mode image landed at 1 MiB.
        let word: u32 = mem.read_obj_from_addr(GuestAddress(BZ_KERNEL_START)).unwrap();
        assert_eq!(word, 0xefbe_adde);

        // Header in guest memory was patched.
        let header: SetupHeader = mem
            .read_obj_from_addr(GuestAddress(0x10000 + SETUP_HEADER_OFFSET))
            .unwrap();
        assert_eq!(header.type_of_loader, 0xff);
        assert_eq!({ header.heap_end_ptr }, 0xfe00);
        assert_ne!(header.loadflags & LOADFLAGS_CAN_USE_HEAP, 0);
        assert_eq!({ header.cmd_line_ptr }, 0x20000);

        // Command line is where the header says, NUL terminated.
        let mut cmdline = [0u8; 14];
        mem.read_exact_at_addr(&mut cmdline, GuestAddress(0x20000))
            .unwrap();
        assert_eq!(&cmdline, b"console=ttyS0\0");
    }

    #[test]
    fn rejects_bad_magic() {
        let mem = GuestMemory::x86_layout(16 << 20).unwrap();
        let mut image = Cursor::new(vec![0u8; 8192]);
        assert!(matches!(
            load_bzimage(&mem, &mut image, ""),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn rejects_old_protocol() {
        let mem = GuestMemory::x86_layout(16 << 20).unwrap();
        let mut image = Cursor::new(fake_bzimage(0x0200, 1));
        assert!(matches!(
            load_bzimage(&mem, &mut image, ""),
            Err(Error::OldProtocol(0x0200))
        ));
    }
}
