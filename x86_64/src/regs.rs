// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Initial register, FPU, MSR, and local APIC state for a vCPU entering
//! the 16-bit boot stub.

use kvm::Vcpu;
use kvm_sys::kvm_fpu;
use kvm_sys::kvm_msr_entry;
use kvm_sys::kvm_regs;

use crate::BootParams;

pub const MSR_IA32_SYSENTER_CS: u32 = 0x0000_0174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x0000_0175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x0000_0176;
pub const MSR_STAR: u32 = 0xc000_0081;
pub const MSR_LSTAR: u32 = 0xc000_0082;
pub const MSR_CSTAR: u32 = 0xc000_0083;
pub const MSR_SYSCALL_MASK: u32 = 0xc000_0084;
pub const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;
pub const MSR_IA32_TSC: u32 = 0x0000_0010;
pub const MSR_IA32_MISC_ENABLE: u32 = 0x0000_01a0;

pub const MSR_IA32_MISC_ENABLE_FAST_STRING: u64 = 1;

// Local APIC LVT registers and the delivery mode field within them.
const APIC_LVT_LINT0: usize = 0x350;
const APIC_LVT_LINT1: usize = 0x360;
const APIC_MODE_EXTINT: u32 = 0x7;
const APIC_MODE_NMI: u32 = 0x4;
const APIC_MODE_SHIFT: u32 = 8;
const APIC_MODE_MASK: u32 = 0x7 << APIC_MODE_SHIFT;

/// KVM on Intel requires a real-mode segment base to be selector * 16.
fn selector_to_base(selector: u16) -> u64 {
    (selector as u64) << 4
}

/// Points every segment at the boot selector and enters real mode.
pub fn setup_sregs(vcpu: &Vcpu, boot: &BootParams) -> base::Result<()> {
    let mut sregs = vcpu.get_sregs()?;
    for seg in [
        &mut sregs.cs,
        &mut sregs.ss,
        &mut sregs.ds,
        &mut sregs.es,
        &mut sregs.fs,
        &mut sregs.gs,
    ] {
        seg.selector = boot.boot_selector;
        seg.base = selector_to_base(boot.boot_selector);
    }
    vcpu.set_sregs(&sregs)
}

/// Instruction pointer and stack for the boot stub. Bit 1 of rflags is
/// the only architecturally-set bit at reset.
pub fn setup_regs(vcpu: &Vcpu, boot: &BootParams) -> base::Result<()> {
    let regs = kvm_regs {
        rflags: 0x2,
        rip: boot.boot_ip as u64,
        rsp: boot.boot_sp as u64,
        rbp: boot.boot_sp as u64,
        ..Default::default()
    };
    vcpu.set_regs(&regs)
}

/// x87 control word and MXCSR at their architectural reset values.
pub fn setup_fpu(vcpu: &Vcpu) -> base::Result<()> {
    let fpu = kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    };
    vcpu.set_fpu(&fpu)
}

/// Seeds the syscall/sysenter MSRs to zero and enables fast string
/// operations, the state Linux expects from firmware.
pub fn setup_msrs(vcpu: &Vcpu) -> base::Result<()> {
    let zeroed = [
        MSR_IA32_SYSENTER_CS,
        MSR_IA32_SYSENTER_ESP,
        MSR_IA32_SYSENTER_EIP,
        MSR_STAR,
        MSR_CSTAR,
        MSR_KERNEL_GS_BASE,
        MSR_SYSCALL_MASK,
        MSR_LSTAR,
        MSR_IA32_TSC,
    ];
    let mut entries: Vec<kvm_msr_entry> = zeroed
        .iter()
        .map(|index| kvm_msr_entry {
            index: *index,
            ..Default::default()
        })
        .collect();
    entries.push(kvm_msr_entry {
        index: MSR_IA32_MISC_ENABLE,
        data: MSR_IA32_MISC_ENABLE_FAST_STRING,
        ..Default::default()
    });
    vcpu.set_msrs(&entries)
}

fn set_lvt_mode(regs: &mut [u8; 1024], offset: usize, mode: u32) {
    let mut value = u32::from_le_bytes([
        regs[offset],
        regs[offset + 1],
        regs[offset + 2],
        regs[offset + 3],
    ]);
    value = (value & !APIC_MODE_MASK) | (mode << APIC_MODE_SHIFT);
    regs[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Routes LINT0 as external interrupt and LINT1 as NMI so the in-kernel
/// PIC can deliver through the local APIC.
pub fn setup_lint(vcpu: &Vcpu) -> base::Result<()> {
    let mut lapic = vcpu.get_lapic()?;
    set_lvt_mode(&mut lapic.regs, APIC_LVT_LINT0, APIC_MODE_EXTINT);
    set_lvt_mode(&mut lapic.regs, APIC_LVT_LINT1, APIC_MODE_NMI);
    vcpu.set_lapic(&lapic)
}

/// The whole reset sequence a vCPU runs before first entry.
pub fn reset_vcpu(
    kvm: &kvm::Kvm,
    vcpu: &Vcpu,
    cpu_id: usize,
    boot: &BootParams,
) -> crate::Result<()> {
    crate::cpuid::setup_cpuid(kvm, vcpu, cpu_id).map_err(crate::Error::Cpuid)?;
    setup_sregs(vcpu, boot).map_err(crate::Error::SetupRegs)?;
    setup_regs(vcpu, boot).map_err(crate::Error::SetupRegs)?;
    setup_fpu(vcpu).map_err(crate::Error::SetupRegs)?;
    setup_msrs(vcpu).map_err(crate::Error::SetupRegs)?;
    setup_lint(vcpu).map_err(crate::Error::SetupRegs)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_base_rule() {
        assert_eq!(selector_to_base(0x1000), 0x10000);
        assert_eq!(selector_to_base(0xf000), 0xf0000);
    }

    #[test]
    fn lvt_mode_update_preserves_other_bits() {
        let mut regs = [0u8; 1024];
        regs[APIC_LVT_LINT0] = 0xff;
        set_lvt_mode(&mut regs, APIC_LVT_LINT0, APIC_MODE_EXTINT);
        let value = u32::from_le_bytes([
            regs[APIC_LVT_LINT0],
            regs[APIC_LVT_LINT0 + 1],
            regs[APIC_LVT_LINT0 + 2],
            regs[APIC_LVT_LINT0 + 3],
        ]);
        assert_eq!((value >> 8) & 0x7, APIC_MODE_EXTINT);
        assert_eq!(value & 0xff, 0xff);
    }
}
