// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;

use base::error;
use base::warn;
use sync::Mutex;

use super::configuration::COMMAND_REG;
use super::configuration::NUM_BAR_REGS;
use super::PciBarType;
use super::PciConfiguration;
use super::PCI_CFG_SPACE_SIZE;
use super::PCI_FIRST_IRQ_LINE;
use crate::bus::Bus;
use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;

/// A single-function device living on the root bus.
///
/// The root owns the BAR lifecycle: it masks BAR writes, answers size
/// probes, and moves the device's bus registrations when the guest
/// reassigns a BAR or flips the decode-enable bits. Devices only see
/// configuration accesses that are neither command nor BAR registers.
pub trait PciDevice: Send {
    fn debug_label(&self) -> String;

    fn config(&self) -> &PciConfiguration;

    fn config_mut(&mut self) -> &mut PciConfiguration;

    /// Tells the device the INTx line and pin the root assigned to it.
    fn assign_irq(&mut self, line: u8, pin: u8) {
        let _ = (line, pin);
    }

    /// Configuration read; the default serves the configuration view.
    fn read_config_register(&self, reg_idx: usize) -> u32 {
        self.config().read_reg(reg_idx)
    }

    /// Configuration write for registers the root does not intercept.
    fn write_config_register(&mut self, reg_idx: usize, offset: u64, data: &[u8]) {
        self.config_mut()
            .write_bytes(reg_idx * 4 + offset as usize, data);
    }
}

struct RootEntry {
    device: Arc<Mutex<dyn PciDevice>>,
    bus_device: Arc<Mutex<dyn BusDevice>>,
}

/// Emulates the PCI root complex: the configuration address latch, per
/// device configuration dispatch, and BAR activation bookkeeping.
pub struct PciRoot {
    devices: BTreeMap<u8, RootEntry>,
    next_dev_num: u8,
    next_irq_line: u8,
    io_bus: Weak<Bus>,
    mmio_bus: Weak<Bus>,
}

impl PciRoot {
    pub fn new(io_bus: Weak<Bus>, mmio_bus: Weak<Bus>) -> PciRoot {
        PciRoot {
            devices: BTreeMap::new(),
            next_dev_num: 0,
            next_irq_line: PCI_FIRST_IRQ_LINE,
            io_bus,
            mmio_bus,
        }
    }

    /// Adds `device` to the root bus: assigns its device number and INTx
    /// line, and activates every implemented BAR whose decode space is
    /// enabled. Returns the assigned `(device number, irq line)`.
    pub fn add_device<D: PciDevice + BusDevice + 'static>(&mut self, device: D) -> (u8, u8) {
        let dev_num = self.next_dev_num;
        self.next_dev_num += 1;
        let irq_line = self.next_irq_line;
        self.next_irq_line += 1;

        let arc = Arc::new(Mutex::new(device));
        let entry = RootEntry {
            device: arc.clone() as Arc<Mutex<dyn PciDevice>>,
            bus_device: arc as Arc<Mutex<dyn BusDevice>>,
        };

        {
            // Single-function devices always get pin A.
            let mut dev = entry.device.lock();
            dev.assign_irq(irq_line, 1);
            dev.config_mut().set_irq(irq_line, 1);
        }

        for bar in 0..NUM_BAR_REGS {
            let (implemented, enabled) = {
                let dev = entry.device.lock();
                let cfg = dev.config();
                (cfg.bar_implemented(bar), cfg.bar_space_enabled(bar))
            };
            if implemented && enabled {
                if let Err(e) = self.activate_bar(&entry, bar) {
                    error!("failed to activate BAR {}: {}", bar, e);
                }
            }
        }

        self.devices.insert(dev_num, entry);
        (dev_num, irq_line)
    }

    fn bus_for(&self, type_: PciBarType) -> Option<Arc<Bus>> {
        match type_ {
            PciBarType::Io => self.io_bus.upgrade(),
            PciBarType::Memory => self.mmio_bus.upgrade(),
        }
    }

    fn activate_bar(&self, entry: &RootEntry, bar: usize) -> crate::bus::Result<()> {
        let (addr, size, type_, active) = {
            let dev = entry.device.lock();
            let cfg = dev.config();
            (
                cfg.bar_address(bar),
                cfg.bar_size(bar) as u64,
                cfg.bar_type(bar),
                cfg.bar_active(bar),
            )
        };
        if active || addr == 0 {
            return Ok(());
        }
        if let Some(bus) = self.bus_for(type_) {
            bus.insert(entry.bus_device.clone(), addr, size)?;
        }
        entry
            .device
            .lock()
            .config_mut()
            .set_bar_active(bar, Some(addr));
        Ok(())
    }

    fn deactivate_bar(&self, entry: &RootEntry, bar: usize) -> crate::bus::Result<()> {
        let (addr, type_) = {
            let dev = entry.device.lock();
            let cfg = dev.config();
            match cfg.bar_active_address(bar) {
                Some(addr) => (addr, cfg.bar_type(bar)),
                None => return Ok(()),
            }
        };
        if let Some(bus) = self.bus_for(type_) {
            bus.remove(addr)?;
        }
        entry.device.lock().config_mut().set_bar_active(bar, None);
        Ok(())
    }

    /// Activates or deactivates every active BAR of every device that
    /// overlaps `[start, start + size)`, except `skip`. Returns the set
    /// touched so a failed reassignment can be unwound.
    fn trigger_overlapping(
        &self,
        activate: bool,
        start: u64,
        size: u64,
        skip: (u8, usize),
    ) -> Result<Vec<(u8, usize)>, ()> {
        let mut touched = Vec::new();
        for (dev_num, entry) in &self.devices {
            for bar in 0..NUM_BAR_REGS {
                if (*dev_num, bar) == skip {
                    continue;
                }
                let (implemented, addr, bar_size, active) = {
                    let dev = entry.device.lock();
                    let cfg = dev.config();
                    (
                        cfg.bar_implemented(bar),
                        // The registered address wins over the config
                        // register while a size probe is outstanding.
                        cfg.bar_active_address(bar).unwrap_or_else(|| cfg.bar_address(bar)),
                        cfg.bar_size(bar) as u64,
                        cfg.bar_active(bar),
                    )
                };
                if !implemented {
                    continue;
                }
                let overlaps = addr < start + size && start < addr + bar_size;
                if !overlaps {
                    continue;
                }
                let r = if activate {
                    if active {
                        continue;
                    }
                    self.activate_bar(entry, bar)
                } else {
                    if !active {
                        continue;
                    }
                    self.deactivate_bar(entry, bar)
                };
                match r {
                    Ok(()) => touched.push((*dev_num, bar)),
                    Err(_) => return Err(()),
                }
            }
        }
        Ok(touched)
    }

    fn reactivate(&self, bars: &[(u8, usize)]) {
        for (dev_num, bar) in bars {
            if let Some(entry) = self.devices.get(dev_num) {
                if let Err(e) = self.activate_bar(entry, *bar) {
                    error!("failed to reactivate BAR {}: {}", bar, e);
                }
            }
        }
    }

    /// Handles a guest write to a BAR register.
    ///
    /// The all-ones size probe stores `!(size - 1)` in the maskable bits.
    /// A real reassignment runs deactivate(this) → deactivate(overlaps of
    /// the new range) → commit → activate(this) → reactivate(overlaps of
    /// the old range), unwinding to the last consistent activation when a
    /// step fails.
    fn config_bar_write(&mut self, dev_num: u8, bar: usize, value: u32) {
        let entry = match self.devices.get(&dev_num) {
            Some(entry) => entry,
            None => return,
        };
        let (old_reg, mask, size, space_enabled, old_active) = {
            let dev = entry.device.lock();
            let cfg = dev.config();
            if !cfg.bar_implemented(bar) {
                return;
            }
            (
                cfg.bar_reg(bar),
                cfg.bar_addr_mask(bar),
                cfg.bar_size(bar),
                cfg.bar_space_enabled(bar),
                cfg.bar_active_address(bar),
            )
        };

        if value == 0xffff_ffff {
            let probe = !(size - 1);
            let new_reg = (probe & mask) | (old_reg & !mask);
            entry.device.lock().config_mut().set_bar_reg(bar, new_reg);
            return;
        }

        let new_reg = (value & mask) | (old_reg & !mask);

        // With decode disabled there is nothing registered to move.
        if !space_enabled {
            entry.device.lock().config_mut().set_bar_reg(bar, new_reg);
            return;
        }

        // The registered location, not the register value, names what
        // must move; they diverge while a size probe is outstanding.
        let old_addr = old_active.unwrap_or((old_reg & mask) as u64);
        let new_addr = (new_reg & mask) as u64;
        let bar_size = size as u64;

        if self.deactivate_bar(entry, bar).is_err() {
            return;
        }
        let overlapped =
            match self.trigger_overlapping(false, new_addr, bar_size, (dev_num, bar)) {
                Ok(list) => list,
                Err(()) => {
                    // Keep the old BAR value and restore its emulation.
                    let entry = &self.devices[&dev_num];
                    if let Err(e) = self.activate_bar(entry, bar) {
                        error!("failed restoring BAR {} after aborted move: {}", bar, e);
                    }
                    return;
                }
            };
        {
            let entry = &self.devices[&dev_num];
            entry.device.lock().config_mut().set_bar_reg(bar, new_reg);
            if self.activate_bar(entry, bar).is_err() {
                self.reactivate(&overlapped);
                return;
            }
        }
        match self.trigger_overlapping(true, old_addr, bar_size, (dev_num, bar)) {
            Ok(_) => (),
            Err(()) => warn!("failed reactivating regions overlapped by old BAR address"),
        }
    }

    /// Handles a guest write to the command word, toggling BAR emulation
    /// as the IO/MEM decode-enable bits change.
    fn config_command_write(&mut self, dev_num: u8, command: u16) {
        let entry = match self.devices.get(&dev_num) {
            Some(entry) => entry,
            None => return,
        };
        let old_command = entry.device.lock().config().command();
        let io_toggled = (old_command ^ command) & super::configuration::COMMAND_IO_SPACE != 0;
        let mem_toggled =
            (old_command ^ command) & super::configuration::COMMAND_MEMORY_SPACE != 0;

        entry.device.lock().config_mut().set_command(command);

        for bar in 0..NUM_BAR_REGS {
            let (implemented, type_) = {
                let dev = entry.device.lock();
                let cfg = dev.config();
                (cfg.bar_implemented(bar), cfg.bar_type(bar))
            };
            if !implemented {
                continue;
            }
            let (toggled, now_enabled) = match type_ {
                PciBarType::Io => (io_toggled, command & super::configuration::COMMAND_IO_SPACE != 0),
                PciBarType::Memory => (
                    mem_toggled,
                    command & super::configuration::COMMAND_MEMORY_SPACE != 0,
                ),
            };
            if !toggled {
                continue;
            }
            let r = if now_enabled {
                self.activate_bar(entry, bar)
            } else {
                self.deactivate_bar(entry, bar)
            };
            if let Err(e) = r {
                error!("failed toggling BAR {} emulation: {}", bar, e);
            }
        }
    }

    /// Reads `data.len()` bytes of device `dev_num`'s configuration space
    /// at `offset`. Absent devices read as all-ones.
    pub fn config_read(&self, bus: u8, dev_num: u8, function: u8, offset: u64, data: &mut [u8]) {
        if bus != 0 || function != 0 {
            data.fill(0xff);
            return;
        }
        let entry = match self.devices.get(&dev_num) {
            Some(entry) => entry,
            None => {
                data.fill(0xff);
                return;
            }
        };
        let dev = entry.device.lock();
        for (i, b) in data.iter_mut().enumerate() {
            let pos = offset as usize + i;
            if pos >= PCI_CFG_SPACE_SIZE {
                *b = 0xff;
                continue;
            }
            let value = dev.read_config_register(pos / 4);
            *b = (value >> ((pos % 4) * 8)) as u8;
        }
    }

    /// Applies a guest write to device `dev_num`'s configuration space.
    pub fn config_write(&mut self, bus: u8, dev_num: u8, function: u8, offset: u64, data: &[u8]) {
        if bus != 0 || function != 0 || !self.devices.contains_key(&dev_num) {
            return;
        }
        if data.is_empty() || offset as usize + data.len() > PCI_CFG_SPACE_SIZE {
            return;
        }
        let reg_idx = offset as usize / 4;
        let reg_offset = offset & 3;

        if reg_idx == COMMAND_REG && reg_offset == 0 && data.len() >= 2 {
            let command = u16::from_le_bytes([data[0], data[1]]);
            self.config_command_write(dev_num, command);
            return;
        }

        if (4..4 + NUM_BAR_REGS).contains(&reg_idx) {
            let value = {
                let entry = &self.devices[&dev_num];
                let old = entry.device.lock().config().read_reg(reg_idx);
                merge_into(old, reg_offset as usize, data)
            };
            self.config_bar_write(dev_num, reg_idx - 4, value);
            return;
        }

        let entry = &self.devices[&dev_num];
        entry
            .device
            .lock()
            .write_config_register(reg_idx, reg_offset, data);
    }
}

/// Merges a sub-dword write into an existing register value.
fn merge_into(old: u32, offset: usize, data: &[u8]) -> u32 {
    let mut value = old;
    for (i, b) in data.iter().enumerate().take(4 - offset) {
        let shift = (offset + i) * 8;
        value = (value & !(0xffu32 << shift)) | ((*b as u32) << shift);
    }
    value
}

/// Decoded form of the 0xCF8 configuration address word.
#[derive(Copy, Clone, Debug, Default)]
struct ConfigAddress {
    enabled: bool,
    bus: u8,
    device: u8,
    function: u8,
    register: u8,
}

impl ConfigAddress {
    fn from_word(word: u32) -> ConfigAddress {
        ConfigAddress {
            enabled: word & 0x8000_0000 != 0,
            bus: (word >> 16) as u8,
            device: ((word >> 11) & 0x1f) as u8,
            function: ((word >> 8) & 0x7) as u8,
            register: ((word >> 2) & 0x3f) as u8,
        }
    }
}

/// The legacy 0xCF8/0xCFC dword window pair.
pub struct PciConfigIo {
    root: Arc<Mutex<PciRoot>>,
    config_address: u32,
}

impl PciConfigIo {
    pub fn new(root: Arc<Mutex<PciRoot>>) -> PciConfigIo {
        PciConfigIo {
            root,
            config_address: 0,
        }
    }
}

impl BusDevice for PciConfigIo {
    fn debug_label(&self) -> String {
        "pci config io".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        match info.offset {
            0..=3 => {
                // Address latch readback.
                for (i, b) in data.iter_mut().enumerate() {
                    let pos = info.offset as usize + i;
                    *b = if pos < 4 {
                        (self.config_address >> (pos * 8)) as u8
                    } else {
                        0xff
                    };
                }
            }
            4..=7 => {
                let addr = ConfigAddress::from_word(self.config_address);
                if !addr.enabled {
                    data.fill(0xff);
                    return;
                }
                let offset = (addr.register as u64) * 4 + (info.offset - 4);
                self.root
                    .lock()
                    .config_read(addr.bus, addr.device, addr.function, offset, data);
            }
            _ => data.fill(0xff),
        }
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        match info.offset {
            0..=3 => {
                for (i, b) in data.iter().enumerate() {
                    let pos = info.offset as usize + i;
                    if pos < 4 {
                        self.config_address = (self.config_address & !(0xffu32 << (pos * 8)))
                            | ((*b as u32) << (pos * 8));
                    }
                }
            }
            4..=7 => {
                let addr = ConfigAddress::from_word(self.config_address);
                if !addr.enabled {
                    return;
                }
                let offset = (addr.register as u64) * 4 + (info.offset - 4);
                self.root
                    .lock()
                    .config_write(addr.bus, addr.device, addr.function, offset, data);
            }
            _ => (),
        }
    }
}

/// The flat memory-mapped configuration window; the offset within the
/// window encodes `{register, function, device, bus}` with the same bit
/// layout as the 0xCF8 address word.
pub struct PciConfigMmio {
    root: Arc<Mutex<PciRoot>>,
}

impl PciConfigMmio {
    pub fn new(root: Arc<Mutex<PciRoot>>) -> PciConfigMmio {
        PciConfigMmio { root }
    }

    fn decode(offset: u64) -> (ConfigAddress, u64) {
        let addr = ConfigAddress::from_word(offset as u32 | 0x8000_0000);
        (addr, offset & 3)
    }
}

impl BusDevice for PciConfigMmio {
    fn debug_label(&self) -> String {
        "pci config mmio".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        let len = std::cmp::min(data.len(), 4);
        let (addr, reg_offset) = PciConfigMmio::decode(info.offset);
        let offset = (addr.register as u64) * 4 + reg_offset;
        self.root
            .lock()
            .config_read(addr.bus, addr.device, addr.function, offset, &mut data[..len]);
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        let len = std::cmp::min(data.len(), 4);
        let (addr, reg_offset) = PciConfigMmio::decode(info.offset);
        let offset = (addr.register as u64) * 4 + reg_offset;
        self.root
            .lock()
            .config_write(addr.bus, addr.device, addr.function, offset, &data[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusType;

    struct StubDevice {
        config: PciConfiguration,
    }

    impl StubDevice {
        fn new() -> StubDevice {
            let mut config = PciConfiguration::new(0x1af4, 0x1001, 0x018000, 0x1af4, 2);
            config.set_bar(0, 0x6200, 0x100, PciBarType::Io);
            config.set_bar(1, 0xc100_0000, 0x1000, PciBarType::Memory);
            StubDevice { config }
        }
    }

    impl PciDevice for StubDevice {
        fn debug_label(&self) -> String {
            "stub".to_string()
        }

        fn config(&self) -> &PciConfiguration {
            &self.config
        }

        fn config_mut(&mut self) -> &mut PciConfiguration {
            &mut self.config
        }
    }

    impl BusDevice for StubDevice {
        fn debug_label(&self) -> String {
            "stub".to_string()
        }

        fn read(&mut self, _info: BusAccessInfo, data: &mut [u8]) {
            data.fill(0x5a);
        }

        fn write(&mut self, _info: BusAccessInfo, _data: &[u8]) {}
    }

    fn root_with_device() -> (Arc<Bus>, Arc<Bus>, Arc<Mutex<PciRoot>>) {
        let io_bus = Arc::new(Bus::new(BusType::Io));
        let mmio_bus = Arc::new(Bus::new(BusType::Mmio));
        let root = Arc::new(Mutex::new(PciRoot::new(
            Arc::downgrade(&io_bus),
            Arc::downgrade(&mmio_bus),
        )));
        root.lock().add_device(StubDevice::new());
        (io_bus, mmio_bus, root)
    }

    #[test]
    fn device_bars_activated_on_add() {
        let (io_bus, mmio_bus, _root) = root_with_device();
        assert!(io_bus.claims(0x6200));
        assert!(mmio_bus.claims(0xc100_0000));
    }

    #[test]
    fn config_read_via_ports() {
        let (_io, _mmio, root) = root_with_device();
        let mut ports = PciConfigIo::new(root);
        // Select bus 0, device 0, register 0.
        ports.write(
            BusAccessInfo {
                offset: 0,
                address: 0xcf8,
                id: 0,
            },
            &0x8000_0000u32.to_le_bytes(),
        );
        let mut data = [0u8; 4];
        ports.read(
            BusAccessInfo {
                offset: 4,
                address: 0xcfc,
                id: 0,
            },
            &mut data,
        );
        assert_eq!(u32::from_le_bytes(data), 0x1001_1af4);
        // Absent device reads all ones.
        ports.write(
            BusAccessInfo {
                offset: 0,
                address: 0xcf8,
                id: 0,
            },
            &(0x8000_0000u32 | (3 << 11)).to_le_bytes(),
        );
        ports.read(
            BusAccessInfo {
                offset: 4,
                address: 0xcfc,
                id: 0,
            },
            &mut data,
        );
        assert_eq!(u32::from_le_bytes(data), 0xffff_ffff);
    }

    fn config_write_dword(root: &Arc<Mutex<PciRoot>>, offset: u64, value: u32) {
        root.lock()
            .config_write(0, 0, 0, offset, &value.to_le_bytes());
    }

    fn config_read_dword(root: &Arc<Mutex<PciRoot>>, offset: u64) -> u32 {
        let mut data = [0u8; 4];
        root.lock().config_read(0, 0, 0, offset, &mut data);
        u32::from_le_bytes(data)
    }

    #[test]
    fn bar_size_probe() {
        let (io_bus, _mmio, root) = root_with_device();
        config_write_dword(&root, 0x10, 0xffff_ffff);
        let value = config_read_dword(&root, 0x10);
        // Size 0x100 IO BAR: ~(size - 1) in the maskable bits, IO bit
        // preserved.
        assert_eq!(value, (!(0x100u32 - 1) & 0xffff_fffc) | 0x1);
        // The probe does not move the live registration.
        assert!(io_bus.claims(0x6200));
        // Writing the address back restores the register and keeps the
        // registration where it was.
        config_write_dword(&root, 0x10, 0x6200);
        assert_eq!(config_read_dword(&root, 0x10), 0x6200 | 0x1);
        assert!(io_bus.claims(0x6200));
    }

    #[test]
    fn bar_reassignment_moves_registration() {
        let (io_bus, _mmio, root) = root_with_device();
        assert!(io_bus.claims(0x6200));
        config_write_dword(&root, 0x10, 0x7000);
        assert!(!io_bus.claims(0x6200));
        assert!(io_bus.claims(0x7000));
        // And back again.
        config_write_dword(&root, 0x10, 0x6200);
        assert!(io_bus.claims(0x6200));
        assert!(!io_bus.claims(0x7000));
    }

    #[test]
    fn command_toggles_bar_emulation() {
        let (io_bus, mmio_bus, root) = root_with_device();
        // Clear the IO enable bit; the IO BAR goes away, memory stays.
        config_write_dword(&root, 0x4, 0x0002);
        assert!(!io_bus.claims(0x6200));
        assert!(mmio_bus.claims(0xc100_0000));
        // Restore it.
        config_write_dword(&root, 0x4, 0x0003);
        assert!(io_bus.claims(0x6200));
    }

    #[test]
    fn mmconfig_window_decodes_device() {
        let (_io, _mmio, root) = root_with_device();
        let mut window = PciConfigMmio::new(root);
        let mut data = [0u8; 4];
        window.read(
            BusAccessInfo {
                offset: 0,
                address: 0xe000_0000,
                id: 0,
            },
            &mut data,
        );
        assert_eq!(u32::from_le_bytes(data), 0x1001_1af4);
    }
}
