// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use base::error;
use base::warn;
use base::Event;
use kvm::IoEventAddress;
use resources::AddressAllocator;
use sync::Mutex;
use vm_memory::GuestMemory;

use super::interrupt::InterruptState;
use super::interrupt::VIRTIO_MSI_NO_VECTOR;
use super::Interrupt;
use super::Queue;
use super::VirtioDevice;
use super::VIRTIO_CONFIG_S_DRIVER_OK;
use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;
use crate::ioevent::IoEventPump;
use crate::irq::IrqRouting;
use crate::pci::PciBarType;
use crate::pci::PciConfiguration;
use crate::pci::PciDevice;
use crate::pci::MSIX_CAP_REG;
use crate::pci::PCI_CLASS_STORAGE_OTHER;
use crate::pci::PCI_SUBSYS_VENDOR_ID_REDHAT_QUMRANET;
use crate::pci::PCI_VENDOR_ID_REDHAT_QUMRANET;

// Legacy virtio-pci register map, mirrored in the PIO and MMIO BARs.
const VIRTIO_PCI_HOST_FEATURES: u64 = 0;
const VIRTIO_PCI_GUEST_FEATURES: u64 = 4;
const VIRTIO_PCI_QUEUE_PFN: u64 = 8;
const VIRTIO_PCI_QUEUE_NUM: u64 = 12;
const VIRTIO_PCI_QUEUE_SEL: u64 = 14;
const VIRTIO_PCI_QUEUE_NOTIFY: u64 = 16;
const VIRTIO_PCI_STATUS: u64 = 18;
const VIRTIO_PCI_ISR: u64 = 19;
const VIRTIO_MSI_CONFIG_VECTOR: u64 = 20;
const VIRTIO_MSI_QUEUE_VECTOR: u64 = 22;

/// Device-specific config starts here; MSI-X presence shifts it up.
const VIRTIO_PCI_CONFIG_OFF: u64 = 20;
const VIRTIO_PCI_CONFIG_OFF_MSIX: u64 = 24;

const PCI_IO_BAR_SIZE: u32 = 0x100;

/// One vector per possible queue plus the config change vector.
pub const VIRTIO_PCI_MAX_VQ: usize = 32;
pub const VIRTIO_PCI_MAX_CONFIG: usize = 1;
const VIRTIO_NR_MSIX: u16 = (VIRTIO_PCI_MAX_VQ + VIRTIO_PCI_MAX_CONFIG) as u16;
const VIRTIO_MSIX_TABLE_SIZE: u32 = VIRTIO_NR_MSIX as u32 * 16;
/// Table then PBA, padded out to a power of two.
const VIRTIO_MSIX_BAR_SIZE: u32 = 0x400;

const BAR_LEGACY_PIO: usize = 0;
const BAR_LEGACY_MMIO: usize = 1;
const BAR_MSIX: usize = 2;

/// A virtio device bound to the legacy virtio-pci transport with MSI-X.
///
/// BAR0 carries the legacy register window on the PIO bus and BAR1
/// mirrors it over MMIO; BAR2 holds the MSI-X table and PBA. Queue
/// doorbells are additionally wired as ioeventfds so the hot path skips
/// the register emulation entirely.
pub struct VirtioPciDevice {
    config_regs: PciConfiguration,
    device: Box<dyn VirtioDevice>,
    device_activated: bool,
    queues: Vec<Queue>,
    queue_evts: Vec<Event>,
    queue_selector: u16,
    mem: GuestMemory,
    irq: Arc<IrqRouting>,
    pump: Arc<IoEventPump>,
    interrupt_state: Arc<Mutex<InterruptState>>,
    status: u8,
    acked_features: u64,
}

impl VirtioPciDevice {
    /// Builds the transport for `device`, carving its three BARs out of
    /// the given allocator pools.
    pub fn new(
        mem: GuestMemory,
        device: Box<dyn VirtioDevice>,
        irq: Arc<IrqRouting>,
        pump: Arc<IoEventPump>,
        pio_alloc: &mut AddressAllocator,
        mmio_alloc: &mut AddressAllocator,
    ) -> base::Result<VirtioPciDevice> {
        let num_queues = device.queue_max_sizes().len();
        assert!(num_queues <= VIRTIO_PCI_MAX_VQ);

        let nospc = |_| base::Error::new(libc::ENOSPC);
        let pio_base = pio_alloc
            .allocate(PCI_IO_BAR_SIZE as u64, PCI_IO_BAR_SIZE as u64)
            .map_err(nospc)?;
        let mmio_base = mmio_alloc
            .allocate_naturally_aligned(PCI_IO_BAR_SIZE as u64)
            .map_err(nospc)?;
        let msix_base = mmio_alloc
            .allocate_naturally_aligned(VIRTIO_MSIX_BAR_SIZE as u64)
            .map_err(nospc)?;

        // Transitional device id: 0x1000 + (type - 1).
        let device_id = 0x0fff + device.device_type() as u16;
        let mut config_regs = PciConfiguration::new(
            PCI_VENDOR_ID_REDHAT_QUMRANET,
            device_id,
            PCI_CLASS_STORAGE_OTHER,
            PCI_SUBSYS_VENDOR_ID_REDHAT_QUMRANET,
            device.device_type() as u16,
        );
        config_regs.set_bar(
            BAR_LEGACY_PIO,
            pio_base as u32,
            PCI_IO_BAR_SIZE,
            PciBarType::Io,
        );
        config_regs.set_bar(
            BAR_LEGACY_MMIO,
            mmio_base as u32,
            PCI_IO_BAR_SIZE,
            PciBarType::Memory,
        );
        config_regs.set_bar(
            BAR_MSIX,
            msix_base as u32,
            VIRTIO_MSIX_BAR_SIZE,
            PciBarType::Memory,
        );
        config_regs.add_msix_capability(
            VIRTIO_NR_MSIX,
            BAR_MSIX as u8,
            0,
            VIRTIO_MSIX_TABLE_SIZE,
        );

        let queues = device
            .queue_max_sizes()
            .iter()
            .map(|max| Queue::new(*max))
            .collect();
        let mut queue_evts = Vec::with_capacity(num_queues);
        for _ in 0..num_queues {
            queue_evts.push(Event::new()?);
        }

        Ok(VirtioPciDevice {
            config_regs,
            device,
            device_activated: false,
            queues,
            queue_evts,
            queue_selector: 0,
            mem,
            irq,
            pump,
            interrupt_state: Arc::new(Mutex::new(InterruptState::new(
                VIRTIO_NR_MSIX,
                num_queues,
            ))),
            status: 0,
            acked_features: 0,
        })
    }

    fn msix_enabled(&self) -> bool {
        self.interrupt_state.lock().msix.enabled()
    }

    fn pio_bar_base(&self) -> u64 {
        self.config_regs.bar_address(BAR_LEGACY_PIO)
    }

    fn mmio_bar_base(&self) -> u64 {
        self.config_regs.bar_address(BAR_LEGACY_MMIO)
    }

    /// Arms the two doorbell ioeventfds for queue `index` at the current
    /// BAR addresses. The pump runs the wakeup itself, so a kick reaches
    /// the device worker without a vCPU exit.
    fn setup_ioevents(&self, index: usize) {
        let wakeup = match self.queue_evts[index].try_clone() {
            Ok(evt) => evt,
            Err(e) => {
                error!("failed to clone queue event: {}", e);
                return;
            }
        };
        let callback: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if let Err(e) = wakeup.write(1) {
                error!("failed to wake queue worker: {}", e);
            }
        });

        for (addr, doorbell) in [
            (
                IoEventAddress::Pio(self.pio_bar_base() + VIRTIO_PCI_QUEUE_NOTIFY),
                Event::new(),
            ),
            (
                IoEventAddress::Mmio(self.mmio_bar_base() + VIRTIO_PCI_QUEUE_NOTIFY),
                Event::new(),
            ),
        ] {
            let doorbell = match doorbell {
                Ok(evt) => evt,
                Err(e) => {
                    error!("failed to create doorbell event: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.pump.add(
                doorbell,
                addr,
                2,
                Some(index as u64),
                true,
                callback.clone(),
            ) {
                warn!("failed to register ioeventfd for queue {}: {}", index, e);
            }
        }
    }

    fn teardown_ioevents(&self, index: usize) {
        let _ = self.pump.del(
            IoEventAddress::Pio(self.pio_bar_base() + VIRTIO_PCI_QUEUE_NOTIFY),
            Some(index as u64),
        );
        let _ = self.pump.del(
            IoEventAddress::Mmio(self.mmio_bar_base() + VIRTIO_PCI_QUEUE_NOTIFY),
            Some(index as u64),
        );
    }

    fn queues_ready(&self) -> bool {
        self.queues.iter().all(|q| q.ready())
    }

    fn maybe_activate(&mut self) {
        if self.device_activated
            || self.status & VIRTIO_CONFIG_S_DRIVER_OK == 0
            || !self.queues_ready()
        {
            return;
        }
        let mut queue_evts = Vec::with_capacity(self.queue_evts.len());
        for evt in &self.queue_evts {
            match evt.try_clone() {
                Ok(evt) => queue_evts.push(evt),
                Err(e) => {
                    error!("failed to clone queue event for activate: {}", e);
                    return;
                }
            }
        }
        self.device.activate(
            self.mem.clone(),
            Interrupt::new(self.irq.clone(), self.interrupt_state.clone()),
            self.queues.clone(),
            queue_evts,
        );
        self.device_activated = true;
    }

    /// Full transport reset, triggered by a zero status write. The
    /// driver's ring endianness would be resampled here; this monitor
    /// only runs little-endian x86_64 guests, which match the host.
    fn reset_device(&mut self) {
        if self.device_activated {
            self.device.reset();
            self.device_activated = false;
        }
        for index in 0..self.queues.len() {
            if self.queues[index].ready() {
                self.teardown_ioevents(index);
            }
            self.queues[index].reset();
        }
        let mut state = self.interrupt_state.lock();
        state.isr = 0;
        self.status = 0;
        self.acked_features = 0;
    }

    fn queue_pfn_write(&mut self, pfn: u32) {
        let index = self.queue_selector as usize;
        if index >= self.queues.len() {
            return;
        }
        if pfn != 0 {
            self.setup_ioevents(index);
            self.queues[index].activate(pfn, self.acked_features);
            self.maybe_activate();
        } else {
            self.teardown_ioevents(index);
            self.queues[index].reset();
        }
    }

    fn device_config_offset(&self) -> u64 {
        if self.msix_enabled() {
            VIRTIO_PCI_CONFIG_OFF_MSIX
        } else {
            VIRTIO_PCI_CONFIG_OFF
        }
    }

    fn legacy_read(&mut self, offset: u64, data: &mut [u8]) {
        match offset {
            VIRTIO_PCI_HOST_FEATURES => {
                write_le32(data, self.device.features() as u32);
            }
            VIRTIO_PCI_GUEST_FEATURES => {
                write_le32(data, self.acked_features as u32);
            }
            VIRTIO_PCI_QUEUE_PFN => {
                let pfn = self
                    .queues
                    .get(self.queue_selector as usize)
                    .map_or(0, |q| q.pfn());
                write_le32(data, pfn);
            }
            VIRTIO_PCI_QUEUE_NUM => {
                let size = self
                    .queues
                    .get(self.queue_selector as usize)
                    .map_or(0, |q| q.max_size());
                write_le16(data, size);
            }
            VIRTIO_PCI_QUEUE_SEL => {
                write_le16(data, self.queue_selector);
            }
            VIRTIO_PCI_STATUS => {
                if !data.is_empty() {
                    data[0] = self.status;
                }
            }
            VIRTIO_PCI_ISR => {
                // Read-and-acknowledge: clear the status and drop the
                // INTx line.
                let mut state = self.interrupt_state.lock();
                if !data.is_empty() {
                    data[0] = state.isr;
                }
                state.isr = 0;
                let line = state.legacy_irq_line;
                drop(state);
                if let Err(e) = self.irq.line(line, false) {
                    error!("failed to lower INTx line: {}", e);
                }
            }
            VIRTIO_MSI_CONFIG_VECTOR if self.msix_enabled() => {
                write_le16(data, self.interrupt_state.lock().config_vector);
            }
            VIRTIO_MSI_QUEUE_VECTOR if self.msix_enabled() => {
                let vector = self
                    .interrupt_state
                    .lock()
                    .queue_vectors
                    .get(self.queue_selector as usize)
                    .copied()
                    .unwrap_or(VIRTIO_MSI_NO_VECTOR);
                write_le16(data, vector);
            }
            offset if offset >= self.device_config_offset() => {
                self.device.read_config(offset - self.device_config_offset(), data);
            }
            _ => data.fill(0),
        }
    }

    fn add_vector_route(&self, vector: u16) -> Option<u32> {
        if vector == VIRTIO_MSI_NO_VECTOR {
            return None;
        }
        let msg = self.interrupt_state.lock().msix.msg(vector as usize);
        match self.irq.add_msix_route(msg, 0) {
            Ok(gsi) => Some(gsi),
            Err(e) => {
                error!("failed to add MSI-X route for vector {}: {}", vector, e);
                None
            }
        }
    }

    fn legacy_write(&mut self, offset: u64, data: &[u8]) {
        match offset {
            VIRTIO_PCI_GUEST_FEATURES => {
                let features = read_le32(data) as u64;
                self.acked_features = features;
                self.device.ack_features(features);
            }
            VIRTIO_PCI_QUEUE_PFN => {
                self.queue_pfn_write(read_le32(data));
            }
            VIRTIO_PCI_QUEUE_SEL => {
                self.queue_selector = read_le16(data);
            }
            VIRTIO_PCI_QUEUE_NOTIFY => {
                // Slow-path kick for drivers that trapped instead of
                // hitting the armed ioeventfd.
                let index = read_le16(data) as usize;
                if let Some(evt) = self.queue_evts.get(index) {
                    if let Err(e) = evt.write(1) {
                        error!("failed to kick queue {}: {}", index, e);
                    }
                }
            }
            VIRTIO_PCI_STATUS => {
                let status = data.first().copied().unwrap_or(0);
                if status == 0 {
                    self.reset_device();
                } else {
                    self.status = status;
                    if status & VIRTIO_CONFIG_S_DRIVER_OK != 0 {
                        self.maybe_activate();
                    }
                }
            }
            VIRTIO_MSI_CONFIG_VECTOR if self.msix_enabled() => {
                let vector = read_le16(data);
                let gsi = self.add_vector_route(vector);
                let mut state = self.interrupt_state.lock();
                state.config_vector = vector;
                if gsi.is_some() {
                    state.config_gsi = gsi;
                }
            }
            VIRTIO_MSI_QUEUE_VECTOR if self.msix_enabled() => {
                let vector = read_le16(data);
                let index = self.queue_selector as usize;
                let gsi = self.add_vector_route(vector);
                let mut state = self.interrupt_state.lock();
                if index < state.queue_vectors.len() {
                    state.queue_vectors[index] = vector;
                    if gsi.is_some() {
                        state.queue_gsis[index] = gsi;
                    }
                }
            }
            offset if offset >= self.device_config_offset() => {
                self.device
                    .write_config(offset - self.device_config_offset(), data);
            }
            _ => (),
        }
    }

    fn msix_bar_read(&mut self, offset: u64, data: &mut [u8]) {
        let state = self.interrupt_state.lock();
        if offset < VIRTIO_MSIX_TABLE_SIZE as u64 {
            state.msix.read_table(offset, data);
        } else {
            state.msix.read_pba(offset - VIRTIO_MSIX_TABLE_SIZE as u64, data);
        }
    }

    fn msix_bar_write(&mut self, offset: u64, data: &[u8]) {
        if offset >= VIRTIO_MSIX_TABLE_SIZE as u64 {
            // The PBA is read-only to the guest.
            return;
        }
        let (changed_vector, unmasked_pending) = {
            let mut state = self.interrupt_state.lock();
            let changed = state.msix.write_table(offset, data);
            let vector = (offset as usize) / 16;
            let unmasked_pending = !state.msix.vector_masked(vector)
                && state.msix.take_pba_bit(vector);
            (changed, unmasked_pending)
        };
        if let Some(vector) = changed_vector {
            let (gsi, msg) = {
                let state = self.interrupt_state.lock();
                (
                    state.gsi_for_vector(vector as u16),
                    state.msix.msg(vector),
                )
            };
            if let Some(gsi) = gsi {
                if let Err(e) = self.irq.update_msix_route(gsi, msg) {
                    error!("failed to update MSI-X route for GSI {}: {}", gsi, e);
                }
            }
        }
        if unmasked_pending {
            let vector = (offset as usize) / 16;
            Interrupt::new(self.irq.clone(), self.interrupt_state.clone())
                .deliver_pending(vector as u16);
        }
    }

    /// Figures out which BAR an absolute address landed in.
    fn bar_for(&self, address: u64) -> Option<usize> {
        for bar in [BAR_LEGACY_PIO, BAR_LEGACY_MMIO, BAR_MSIX] {
            let base = self.config_regs.bar_address(bar);
            let size = self.config_regs.bar_size(bar) as u64;
            if base != 0 && address >= base && address < base + size {
                return Some(bar);
            }
        }
        None
    }
}

impl BusDevice for VirtioPciDevice {
    fn debug_label(&self) -> String {
        format!("virtio-pci ({})", self.device.debug_label())
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        match self.bar_for(info.address) {
            Some(BAR_LEGACY_PIO) | Some(BAR_LEGACY_MMIO) => self.legacy_read(info.offset, data),
            Some(BAR_MSIX) => self.msix_bar_read(info.offset, data),
            _ => data.fill(0),
        }
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        match self.bar_for(info.address) {
            Some(BAR_LEGACY_PIO) | Some(BAR_LEGACY_MMIO) => self.legacy_write(info.offset, data),
            Some(BAR_MSIX) => self.msix_bar_write(info.offset, data),
            _ => (),
        }
    }
}

impl PciDevice for VirtioPciDevice {
    fn debug_label(&self) -> String {
        format!("virtio-pci ({})", self.device.debug_label())
    }

    fn config(&self) -> &PciConfiguration {
        &self.config_regs
    }

    fn config_mut(&mut self) -> &mut PciConfiguration {
        &mut self.config_regs
    }

    fn assign_irq(&mut self, line: u8, _pin: u8) {
        // The OS may scribble over the INTERRUPT_LINE byte, so the line
        // used for signalling is kept privately.
        self.interrupt_state.lock().legacy_irq_line = line as u32;
    }

    fn write_config_register(&mut self, reg_idx: usize, offset: u64, data: &[u8]) {
        self.config_regs.write_bytes(reg_idx * 4 + offset as usize, data);
        if reg_idx == MSIX_CAP_REG {
            // Mirror the message-control word into the live MSI-X state.
            let ctl = self.config_regs.msix_ctrl();
            self.interrupt_state.lock().msix.set_msg_ctl(ctl);
        }
    }
}

fn write_le16(data: &mut [u8], value: u16) {
    let bytes = value.to_le_bytes();
    let len = std::cmp::min(data.len(), 2);
    data[..len].copy_from_slice(&bytes[..len]);
}

fn write_le32(data: &mut [u8], value: u32) {
    let bytes = value.to_le_bytes();
    let len = std::cmp::min(data.len(), 4);
    data[..len].copy_from_slice(&bytes[..len]);
}

fn read_le16(data: &[u8]) -> u16 {
    let mut bytes = [0u8; 2];
    let len = std::cmp::min(data.len(), 2);
    bytes[..len].copy_from_slice(&data[..len]);
    u16::from_le_bytes(bytes)
}

fn read_le32(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let len = std::cmp::min(data.len(), 4);
    bytes[..len].copy_from_slice(&data[..len]);
    u32::from_le_bytes(bytes)
}
