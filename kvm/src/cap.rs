// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use kvm_sys::*;

/// The KVM capabilities the monitor probes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Cap {
    Irqchip = KVM_CAP_IRQCHIP,
    Hlt = KVM_CAP_HLT,
    UserMemory = KVM_CAP_USER_MEMORY,
    SetTssAddr = KVM_CAP_SET_TSS_ADDR,
    ExtCpuid = KVM_CAP_EXT_CPUID,
    CoalescedMmio = KVM_CAP_COALESCED_MMIO,
    IrqRouting = KVM_CAP_IRQ_ROUTING,
    IrqInjectStatus = KVM_CAP_IRQ_INJECT_STATUS,
    Pit2 = KVM_CAP_PIT2,
    Ioeventfd = KVM_CAP_IOEVENTFD,
    SignalMsi = KVM_CAP_SIGNAL_MSI,
}

/// The extensions the monitor refuses to run without, with their names
/// for the startup error message.
pub fn required_extensions() -> &'static [(Cap, &'static str)] {
    &[
        (Cap::CoalescedMmio, "KVM_CAP_COALESCED_MMIO"),
        (Cap::SetTssAddr, "KVM_CAP_SET_TSS_ADDR"),
        (Cap::Pit2, "KVM_CAP_PIT2"),
        (Cap::UserMemory, "KVM_CAP_USER_MEMORY"),
        (Cap::IrqRouting, "KVM_CAP_IRQ_ROUTING"),
        (Cap::Irqchip, "KVM_CAP_IRQCHIP"),
        (Cap::Hlt, "KVM_CAP_HLT"),
        (Cap::IrqInjectStatus, "KVM_CAP_IRQ_INJECT_STATUS"),
        (Cap::ExtCpuid, "KVM_CAP_EXT_CPUID"),
    ]
}
