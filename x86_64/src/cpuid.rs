// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use kvm::CpuId;
use kvm::Kvm;
use kvm::Vcpu;
use kvm_sys::kvm_cpuid_entry2;
use remain::sorted;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("GetSupportedCpus ioctl failed: {0}")]
    GetSupportedCpusFailed(base::Error),
    #[error("SetSupportedCpus ioctl failed: {0}")]
    SetSupportedCpusFailed(base::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// CPUID bits in ebx, ecx, and edx.
const EBX_CPUID_SHIFT: u32 = 24; // Index of this CPU.
const ECX_HYPERVISOR_SHIFT: u32 = 31; // Flag set when running under a hypervisor.
const ECX_EPB_SHIFT: u32 = 3; // "Energy Performance Bias" bit.

// Leaf 0 vendor string.
const VENDOR_EBX: u32 = u32::from_le_bytes(*b"Bisc");
const VENDOR_EDX: u32 = u32::from_le_bytes(*b"uitO");
const VENDOR_ECX: u32 = u32::from_le_bytes(*b"S\0\0\0");

// Leaves 0x80000002..4 brand string.
const BRAND_0_EAX: u32 = u32::from_le_bytes(*b"Broi");
const BRAND_0_EBX: u32 = u32::from_le_bytes(*b"ler@");
const BRAND_0_ECX: u32 = u32::from_le_bytes(*b"16th");
const BRAND_0_EDX: u32 = u32::from_le_bytes(*b" Spe");
const BRAND_1_EAX: u32 = u32::from_le_bytes(*b" Int");
const BRAND_1_EBX: u32 = u32::from_le_bytes(*b"el(R");
const BRAND_1_ECX: u32 = u32::from_le_bytes(*b") @ ");
const BRAND_1_EDX: u32 = u32::from_le_bytes(*b"5.50");
const BRAND_2_EAX: u32 = u32::from_le_bytes(*b"GHz\0");

/// Adjusts one CPUID leaf the hypervisor offered so the guest sees this
/// monitor's identity and capabilities.
fn adjust_cpuid(entry: &mut kvm_cpuid_entry2, cpu_id: usize) {
    match entry.function {
        0 => {
            entry.ebx = VENDOR_EBX;
            entry.edx = VENDOR_EDX;
            entry.ecx = VENDOR_ECX;
        }
        1 => {
            // EBX bits 31..24 carry the initial APIC id.
            entry.ebx = (entry.ebx & !(0xff << EBX_CPUID_SHIFT))
                | ((cpu_id as u32) << EBX_CPUID_SHIFT);
            if entry.index == 0 {
                entry.ecx |= 1 << ECX_HYPERVISOR_SHIFT;
            }
        }
        6 => {
            // No frequency selection in the hypervisor.
            entry.ecx &= !(1 << ECX_EPB_SHIFT);
        }
        10 => {
            // Architectural performance monitoring: without version 2
            // and real counters from the kernel PMU, hide it entirely so
            // the guest never touches the MSRs.
            if entry.eax != 0 {
                let version_id = entry.eax & 0xff;
                let num_counters = (entry.eax >> 8) & 0xff;
                if version_id != 2 || num_counters == 0 {
                    entry.eax = 0;
                }
            }
        }
        0x8000_0002 => {
            entry.eax = BRAND_0_EAX;
            entry.ebx = BRAND_0_EBX;
            entry.ecx = BRAND_0_ECX;
            entry.edx = BRAND_0_EDX;
        }
        0x8000_0003 => {
            entry.eax = BRAND_1_EAX;
            entry.ebx = BRAND_1_EBX;
            entry.ecx = BRAND_1_ECX;
            entry.edx = BRAND_1_EDX;
        }
        0x8000_0004 => {
            entry.eax = BRAND_2_EAX;
            entry.ebx = 0;
            entry.ecx = 0;
            entry.edx = 0;
        }
        _ => (),
    }
}

fn filter_cpuid(cpuid: &mut CpuId, cpu_id: usize) {
    for entry in cpuid.entries_mut() {
        adjust_cpuid(entry, cpu_id);
    }
}

/// Sets up the CPUID leaves for the given vCPU from the host-supported
/// set, filtered through the monitor's identity adjustments.
pub fn setup_cpuid(kvm: &Kvm, vcpu: &Vcpu, cpu_id: usize) -> Result<()> {
    let mut cpuid = kvm
        .get_supported_cpuid()
        .map_err(Error::GetSupportedCpusFailed)?;
    filter_cpuid(&mut cpuid, cpu_id);
    vcpu.set_cpuid(&cpuid)
        .map_err(Error::SetSupportedCpusFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(function: u32, index: u32) -> kvm_cpuid_entry2 {
        kvm_cpuid_entry2 {
            function,
            index,
            ..Default::default()
        }
    }

    #[test]
    fn vendor_and_hypervisor_bits() {
        let mut leaf0 = entry(0, 0);
        adjust_cpuid(&mut leaf0, 0);
        assert_eq!(leaf0.ebx, u32::from_le_bytes(*b"Bisc"));

        let mut leaf1 = entry(1, 0);
        adjust_cpuid(&mut leaf1, 3);
        assert_eq!(leaf1.ebx >> 24, 3);
        assert_ne!(leaf1.ecx & (1 << 31), 0);
    }

    #[test]
    fn epb_cleared() {
        let mut leaf6 = entry(6, 0);
        leaf6.ecx = 0xffff_ffff;
        adjust_cpuid(&mut leaf6, 0);
        assert_eq!(leaf6.ecx & (1 << 3), 0);
    }

    #[test]
    fn pmu_leaf_squashed_without_counters() {
        let mut leaf = entry(10, 0);
        leaf.eax = 0x0000_0001; // version 1, no counters
        adjust_cpuid(&mut leaf, 0);
        assert_eq!(leaf.eax, 0);

        let mut leaf = entry(10, 0);
        leaf.eax = 0x0000_0402; // version 2, 4 counters
        adjust_cpuid(&mut leaf, 0);
        assert_eq!(leaf.eax, 0x0000_0402);
    }
}
