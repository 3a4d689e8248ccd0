// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use kvm::Cap;
use kvm::Vm;
use kvm_sys::kvm_irq_routing_entry;
use kvm_sys::kvm_msi;
use kvm_sys::KVM_IRQCHIP_IOAPIC;
use kvm_sys::KVM_IRQCHIP_PIC_MASTER;
use kvm_sys::KVM_IRQCHIP_PIC_SLAVE;
use kvm_sys::KVM_IRQ_ROUTING_IRQCHIP;
use kvm_sys::KVM_IRQ_ROUTING_MSI;
use sync::Mutex;

/// An MSI message: the write a device would perform to signal the
/// interrupt.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MsiMsg {
    pub address_lo: u32,
    pub address_hi: u32,
    pub data: u32,
}

/// GSI table growth granularity.
const GSI_BLOCK: usize = 32;

/// IOAPIC pin count on the emulated chipset.
const IOAPIC_PINS: u32 = 24;

struct RoutingTable {
    entries: Vec<kvm_irq_routing_entry>,
    /// Entries the backing storage is sized for; grows in blocks of 32.
    allocated: usize,
    next_gsi: u32,
}

impl RoutingTable {
    fn reserve_entry(&mut self) {
        if self.entries.len() < self.allocated {
            return;
        }
        let new_allocated = (self.entries.len() + GSI_BLOCK) / GSI_BLOCK * GSI_BLOCK;
        self.entries.reserve_exact(new_allocated - self.entries.len());
        self.allocated = new_allocated;
    }

    fn add_irqchip(&mut self, gsi: u32, irqchip: u32, pin: u32) {
        self.reserve_entry();
        let mut entry = kvm_irq_routing_entry {
            gsi,
            type_: KVM_IRQ_ROUTING_IRQCHIP,
            ..Default::default()
        };
        entry.u.irqchip.irqchip = irqchip;
        entry.u.irqchip.pin = pin;
        self.entries.push(entry);
    }

    fn add_msi(&mut self, gsi: u32, msg: MsiMsg) {
        self.reserve_entry();
        let mut entry = kvm_irq_routing_entry {
            gsi,
            type_: KVM_IRQ_ROUTING_MSI,
            ..Default::default()
        };
        entry.u.msi.address_lo = msg.address_lo;
        entry.u.msi.address_hi = msg.address_hi;
        entry.u.msi.data = msg.data;
        self.entries.push(entry);
    }
}

/// The interrupt plane: the GSI routing table plus line and MSI
/// signalling services over the in-kernel irqchip.
pub struct IrqRouting {
    vm: Arc<Vm>,
    table: Mutex<RoutingTable>,
    can_signal_msi: bool,
}

impl IrqRouting {
    /// Builds the fixed chipset wiring and pushes it to the kernel.
    ///
    /// GSIs 0..7 except 2 go to the matching master PIC pin, GSIs 8..15
    /// to slave pins 0..7, and GSIs 0..23 to the IOAPIC with the timer
    /// remap: pin 2 carries GSI 0 and no pin carries GSI 2.
    pub fn new(vm: Arc<Vm>) -> base::Result<IrqRouting> {
        let mut table = RoutingTable {
            entries: Vec::new(),
            allocated: 0,
            next_gsi: 0,
        };

        for gsi in 0..8 {
            if gsi != 2 {
                table.add_irqchip(gsi, KVM_IRQCHIP_PIC_MASTER, gsi);
            }
        }
        for gsi in 8..16 {
            table.add_irqchip(gsi, KVM_IRQCHIP_PIC_SLAVE, gsi - 8);
        }
        for gsi in 0..IOAPIC_PINS {
            match gsi {
                0 => table.add_irqchip(0, KVM_IRQCHIP_IOAPIC, 2),
                2 => (),
                _ => table.add_irqchip(gsi, KVM_IRQCHIP_IOAPIC, gsi),
            }
        }
        table.next_gsi = IOAPIC_PINS;

        vm.set_gsi_routing(&table.entries)?;
        let can_signal_msi = vm.check_extension(Cap::SignalMsi);
        Ok(IrqRouting {
            vm,
            table: Mutex::new(table),
            can_signal_msi,
        })
    }

    /// Sets the level of `irq`.
    pub fn line(&self, irq: u32, level: bool) -> base::Result<()> {
        self.vm.set_irq_line(irq, level)
    }

    /// Pulses `irq` high then low, for edge-style device interrupts.
    pub fn trigger(&self, irq: u32) -> base::Result<()> {
        self.line(irq, true)?;
        self.line(irq, false)
    }

    /// Whether MSIs can be injected directly, without a routing entry.
    pub fn can_signal_msi(&self) -> bool {
        self.can_signal_msi
    }

    /// Appends an MSI route for `msg`, pushes the table, and returns the
    /// allocated GSI.
    pub fn add_msix_route(&self, msg: MsiMsg, _device_id: u32) -> base::Result<u32> {
        let mut table = self.table.lock();
        let gsi = table.next_gsi;
        table.add_msi(gsi, msg);
        if let Err(e) = self.vm.set_gsi_routing(&table.entries) {
            table.entries.pop();
            return Err(e);
        }
        table.next_gsi += 1;
        Ok(gsi)
    }

    /// Rewrites the message of the MSI route bound to `gsi`. The table is
    /// pushed only if the message actually changed.
    pub fn update_msix_route(&self, gsi: u32, msg: MsiMsg) -> base::Result<()> {
        let mut table = self.table.lock();
        let entry = match table
            .entries
            .iter_mut()
            .find(|e| e.gsi == gsi && e.type_ == KVM_IRQ_ROUTING_MSI)
        {
            Some(entry) => entry,
            None => return Ok(()),
        };
        // Safe because the entry was created with the msi arm.
        let current = unsafe { entry.u.msi };
        if (current.address_lo, current.address_hi, current.data)
            == (msg.address_lo, msg.address_hi, msg.data)
        {
            return Ok(());
        }
        entry.u.msi.address_lo = msg.address_lo;
        entry.u.msi.address_hi = msg.address_hi;
        entry.u.msi.data = msg.data;
        self.vm.set_gsi_routing(&table.entries)
    }

    /// Injects the MSI described by `msg`.
    pub fn signal_msi(&self, msg: MsiMsg) -> base::Result<()> {
        let msi = kvm_msi {
            address_lo: msg.address_lo,
            address_hi: msg.address_hi,
            data: msg.data,
            ..Default::default()
        };
        self.vm.signal_msi(&msi)
    }
}
