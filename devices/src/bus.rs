// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use kvm::Vm;
use remain::sorted;
use resources::AddressRange;
use resources::RangeMap;
use sync::Mutex;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to register coalesced MMIO zone: {0}")]
    CoalescedZone(base::Error),
    #[error("no device registered at {0:#x}")]
    Empty(u64),
    #[error("device registration rejected: {0}")]
    Insert(resources::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which of the two disjoint I/O address spaces a bus serves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusType {
    /// x86 port I/O, 16-bit addresses.
    Io,
    /// Memory-mapped I/O, 64-bit addresses.
    Mmio,
}

/// Information about how a device was accessed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusAccessInfo {
    /// Offset from the start of the device's registered range.
    pub offset: u64,
    /// The absolute address of the access on its bus.
    pub address: u64,
    /// Index of the vCPU that performed the access.
    pub id: usize,
}

/// A device that responds to reads and writes on a range of a bus.
///
/// Handlers must not register or deregister ranges on the bus that is
/// dispatching to them; the bus lock is not held during the call, but a
/// handler removing itself would still deadlock on teardown ordering.
pub trait BusDevice: Send {
    /// A label for the device used in debug output.
    fn debug_label(&self) -> String;

    /// Reads at `offset` within this device's registered range.
    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]);

    /// Writes at `offset` within this device's registered range.
    fn write(&mut self, info: BusAccessInfo, data: &[u8]);
}

struct BusEntry {
    device: Arc<Mutex<dyn BusDevice>>,
    coalesce: bool,
}

/// A registry of devices on one I/O address space with dispatch by range.
///
/// Registered ranges are disjoint. Dispatch takes the registry lock only
/// long enough to clone the entry's handle; the handler runs outside the
/// lock, so a concurrent `remove` (a PCI BAR move on another vCPU) only
/// drops the registry's reference and the entry is freed when the last
/// in-flight dispatch finishes with it.
pub struct Bus {
    type_: BusType,
    entries: Mutex<RangeMap<BusEntry>>,
    vm: Mutex<Option<Arc<Vm>>>,
}

impl Bus {
    /// Constructs an empty bus for the given address space.
    pub fn new(type_: BusType) -> Bus {
        Bus {
            type_,
            entries: Mutex::new(RangeMap::new()),
            vm: Mutex::new(None),
        }
    }

    pub fn bus_type(&self) -> BusType {
        self.type_
    }

    /// Attaches the VM so MMIO ranges registered with the coalesce hint
    /// can be mirrored into the kernel's coalesced-MMIO set.
    pub fn set_vm(&self, vm: Arc<Vm>) {
        *self.vm.lock() = Some(vm);
    }

    /// Puts `device` on the bus over `[base, base + len)`.
    pub fn insert(&self, device: Arc<Mutex<dyn BusDevice>>, base: u64, len: u64) -> Result<()> {
        self.insert_entry(device, base, len, false)
    }

    /// Like `insert`, and additionally asks the kernel to batch guest
    /// writes to the range into the coalesced-MMIO ring.
    pub fn insert_coalesced(
        &self,
        device: Arc<Mutex<dyn BusDevice>>,
        base: u64,
        len: u64,
    ) -> Result<()> {
        self.insert_entry(device, base, len, true)
    }

    fn insert_entry(
        &self,
        device: Arc<Mutex<dyn BusDevice>>,
        base: u64,
        len: u64,
        coalesce: bool,
    ) -> Result<()> {
        let range =
            AddressRange::from_start_and_len(base, len).ok_or(Error::Insert(resources::Error::InvalidRange))?;
        if coalesce && self.type_ == BusType::Mmio {
            if let Some(vm) = self.vm.lock().as_ref() {
                vm.register_coalesced_mmio(base, len)
                    .map_err(Error::CoalescedZone)?;
            }
        }
        let mut entries = self.entries.lock();
        entries
            .insert(range, BusEntry { device, coalesce })
            .map_err(|e| {
                // Unwind the kernel-side zone if the registry rejects.
                if coalesce && self.type_ == BusType::Mmio {
                    if let Some(vm) = self.vm.lock().as_ref() {
                        let _ = vm.unregister_coalesced_mmio(base, len);
                    }
                }
                Error::Insert(e)
            })?;
        Ok(())
    }

    /// Removes the entry containing `addr` from the bus.
    ///
    /// In-flight dispatches that already cloned the entry's handle finish
    /// against the removed device; its storage is dropped when the last
    /// handle goes away.
    pub fn remove(&self, addr: u64) -> Result<()> {
        let removed = self.entries.lock().remove(addr);
        match removed {
            Some((range, entry)) => {
                if entry.coalesce && self.type_ == BusType::Mmio {
                    if let Some(vm) = self.vm.lock().as_ref() {
                        let _ = vm.unregister_coalesced_mmio(range.start, range.len());
                    }
                }
                Ok(())
            }
            None => Err(Error::Empty(addr)),
        }
    }

    /// Returns whether any device claims `addr`.
    pub fn claims(&self, addr: u64) -> bool {
        self.entries.lock().find(addr).is_some()
    }

    fn get_device(&self, addr: u64, len: u64) -> Option<(u64, Arc<Mutex<dyn BusDevice>>)> {
        let range = AddressRange::from_start_and_len(addr, len)?;
        let entries = self.entries.lock();
        let (entry_range, entry) = entries.find_range(range)?;
        Some((entry_range.start, entry.device.clone()))
    }

    /// Dispatches a read at `addr`. An unclaimed address reads as zeros
    /// and reports `false`, matching what a legacy PC bus returns for an
    /// unpopulated port.
    pub fn read(&self, id: usize, addr: u64, data: &mut [u8]) -> bool {
        match self.get_device(addr, data.len() as u64) {
            Some((base, device)) => {
                device.lock().read(
                    BusAccessInfo {
                        offset: addr - base,
                        address: addr,
                        id,
                    },
                    data,
                );
                true
            }
            None => {
                data.fill(0);
                false
            }
        }
    }

    /// Dispatches a write at `addr`. Writes to unclaimed addresses are
    /// dropped and report `false`.
    pub fn write(&self, id: usize, addr: u64, data: &[u8]) -> bool {
        match self.get_device(addr, data.len() as u64) {
            Some((base, device)) => {
                device.lock().write(
                    BusAccessInfo {
                        offset: addr - base,
                        address: addr,
                        id,
                    },
                    data,
                );
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    /// Test device that records accesses and answers a constant byte.
    struct ConstantDevice {
        value: u8,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl ConstantDevice {
        fn new(value: u8) -> ConstantDevice {
            ConstantDevice {
                value,
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }
        }
    }

    impl BusDevice for ConstantDevice {
        fn debug_label(&self) -> String {
            "constant".to_string()
        }

        fn read(&mut self, _info: BusAccessInfo, data: &mut [u8]) {
            self.reads.fetch_add(1, Ordering::SeqCst);
            data.fill(self.value);
        }

        fn write(&mut self, _info: BusAccessInfo, _data: &[u8]) {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_hits_registered_range() {
        let bus = Bus::new(BusType::Io);
        let dev = Arc::new(Mutex::new(ConstantDevice::new(0xab)));
        bus.insert(dev.clone(), 0x3f8, 8).unwrap();

        let mut data = [0u8; 1];
        assert!(bus.read(0, 0x3f8, &mut data));
        assert_eq!(data[0], 0xab);
        assert!(bus.write(0, 0x3ff, &[0x1]));
        assert_eq!(dev.lock().writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unclaimed_reads_zero() {
        let bus = Bus::new(BusType::Io);
        let mut data = [0xffu8; 4];
        assert!(!bus.read(0, 0x80, &mut data));
        assert_eq!(data, [0u8; 4]);
        assert!(!bus.write(0, 0x80, &[1, 2, 3, 4]));
    }

    #[test]
    fn overlapping_insert_rejected() {
        let bus = Bus::new(BusType::Mmio);
        let dev = Arc::new(Mutex::new(ConstantDevice::new(0)));
        bus.insert(dev.clone(), 0x1000, 0x100).unwrap();
        assert!(bus.insert(dev.clone(), 0x10ff, 0x10).is_err());
        assert!(bus.insert(dev, 0x1100, 0x10).is_ok());
    }

    #[test]
    fn remove_then_lookup_misses() {
        let bus = Bus::new(BusType::Io);
        let dev = Arc::new(Mutex::new(ConstantDevice::new(0x55)));
        bus.insert(dev, 0x60, 1).unwrap();
        assert!(bus.claims(0x60));
        bus.remove(0x60).unwrap();
        assert!(!bus.claims(0x60));
        assert!(bus.remove(0x60).is_err());
    }

    #[test]
    fn inflight_handle_survives_remove() {
        // A dispatch that grabbed the device while another thread removes
        // the range must still complete against live storage.
        let bus = Arc::new(Bus::new(BusType::Io));
        let dev = Arc::new(Mutex::new(ConstantDevice::new(0x77)));
        bus.insert(dev.clone(), 0x200, 4).unwrap();

        let (base, handle) = bus.get_device(0x200, 1).unwrap();
        assert_eq!(base, 0x200);
        bus.remove(0x200).unwrap();
        drop(dev);

        // The registry reference and the caller's strong reference are
        // gone; only `handle` keeps the device alive.
        let mut data = [0u8; 1];
        handle.lock().read(
            BusAccessInfo {
                offset: 0,
                address: 0x200,
                id: 0,
            },
            &mut data,
        );
        assert_eq!(data[0], 0x77);
    }
}
