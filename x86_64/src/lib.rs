// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! x86_64 guest setup: firmware layout, bzImage loading, BIOS and
//! MPTable construction, and initial vCPU state.

pub mod bios;
pub mod bzimage;
pub mod cpuid;
pub mod mptable;
pub mod regs;

use remain::sorted;
use thiserror::Error;

// Boot protocol entry points.
pub const BOOT_LOADER_SELECTOR: u16 = 0x1000;
pub const BOOT_LOADER_IP: u16 = 0x0000;
pub const BOOT_LOADER_SP: u16 = 0x8000;
pub const BZ_KERNEL_START: u64 = 0x100000;
pub const BOOT_CMDLINE_OFFSET: u64 = 0x20000;

// Real-mode firmware layout.
pub const REAL_MODE_IVT_BEGIN: u64 = 0x0000_0000;
pub const REAL_MODE_IVT_END: u64 = 0x0000_0400;
pub const BDA_START: u64 = 0x0000_0400;
pub const BDA_END: u64 = 0x0000_0500;
pub const EBDA_START: u64 = 0x0009_fc00;
pub const EBDA_END: u64 = 0x000a_0000;
pub const E820_MAP_START: u64 = EBDA_START;
pub const VGA_RAM_BEGIN: u64 = 0x000a_0000;
pub const VGA_ROM_BEGIN: u64 = 0x000c_0000;
pub const VGA_ROM_OEM_STRING: u64 = VGA_ROM_BEGIN;
pub const VGA_ROM_OEM_STRING_SIZE: u64 = 16;
pub const VGA_ROM_MODES: u64 = VGA_ROM_OEM_STRING + VGA_ROM_OEM_STRING_SIZE;
pub const VGA_ROM_END: u64 = 0x000c_8000;
pub const BIOS_BEGIN: u64 = 0x000f_0000;
pub const BIOS_END: u64 = 0x0010_0000;

/// Where the backend parks the (unused) three-page TSS region.
pub const KVM_TSS_ADDRESS: u32 = 0xfffb_d000;

// MMIO windows for the PCI subsystem, all inside the 32-bit PCI hole.
pub const PCI_MMCFG_START: u64 = 0xe000_0000;
pub const PCI_MMIO_ALLOC_BASE: u64 = 0xc100_0000;
pub const PCI_MMIO_ALLOC_SIZE: u64 = 0x1f00_0000;
pub const PCI_IOPORT_ALLOC_BASE: u64 = 0x6200;
pub const PCI_IOPORT_ALLOC_SIZE: u64 = 0x9e00;

pub const APIC_DEFAULT_PHYS_BASE: u32 = 0xfee0_0000;
pub const IO_APIC_DEFAULT_PHYS_BASE: u32 = 0xfec0_0000;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("BIOS setup failed: {0}")]
    Bios(bios::Error),
    #[error("CPUID setup failed: {0}")]
    Cpuid(cpuid::Error),
    #[error("loading kernel failed: {0}")]
    LoadKernel(bzimage::Error),
    #[error("MP table setup failed: {0}")]
    Mptable(mptable::Error),
    #[error("configuring vCPU registers failed: {0}")]
    SetupRegs(base::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The boot entry state handed to every vCPU at reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BootParams {
    pub boot_selector: u16,
    pub boot_ip: u16,
    pub boot_sp: u16,
}
