// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtio devices and the legacy virtio-pci transport.

mod block;
mod interrupt;
mod queue;
mod virtio_pci_device;

pub use block::Block;
pub use interrupt::Interrupt;
pub use queue::DescriptorChain;
pub use queue::Queue;
pub use virtio_pci_device::VirtioPciDevice;

use base::Event;
use vm_memory::GuestMemory;

/// Virtio device type ids.
pub const TYPE_BLOCK: u32 = 2;

// Device status bits, in the order the driver moves through them.
pub const VIRTIO_CONFIG_S_ACKNOWLEDGE: u8 = 1;
pub const VIRTIO_CONFIG_S_DRIVER: u8 = 2;
pub const VIRTIO_CONFIG_S_DRIVER_OK: u8 = 4;
pub const VIRTIO_CONFIG_S_FEATURES_OK: u8 = 8;
pub const VIRTIO_CONFIG_S_FAILED: u8 = 0x80;

// Transport-independent feature bits.
pub const VIRTIO_RING_F_INDIRECT_DESC: u32 = 28;
pub const VIRTIO_RING_F_EVENT_IDX: u32 = 29;

/// Trait for virtio devices behind a transport.
///
/// The transport owns queue discovery and configuration; the device gets
/// the negotiated queues, their wakeup events, and an interrupt handle
/// when the driver flips `DRIVER_OK`.
pub trait VirtioDevice: Send {
    fn debug_label(&self) -> String;

    /// The virtio device type id exposed through the PCI subsystem id.
    fn device_type(&self) -> u32;

    /// Maximum size of each of the device's queues.
    fn queue_max_sizes(&self) -> &[u16];

    /// The feature bits offered to the guest.
    fn features(&self) -> u64;

    /// Accepts the features the guest acknowledged.
    fn ack_features(&mut self, value: u64);

    /// Reads from the device-specific configuration space.
    fn read_config(&self, offset: u64, data: &mut [u8]);

    /// Writes to the device-specific configuration space. Most devices
    /// have nothing writable.
    fn write_config(&mut self, offset: u64, data: &[u8]) {
        let _ = (offset, data);
    }

    /// Starts the device with its negotiated queues. `queue_evts` are
    /// written by the transport (or the host kernel, via ioeventfd) when
    /// the guest kicks the matching queue.
    fn activate(
        &mut self,
        mem: GuestMemory,
        interrupt: Interrupt,
        queues: Vec<Queue>,
        queue_evts: Vec<Event>,
    );

    /// Stops the device and drops queue state, returning it to the
    /// pre-activate state. Returns false if the device had trouble
    /// stopping cleanly.
    fn reset(&mut self) -> bool {
        false
    }
}

/// Copies between a device configuration space and an access's buffer,
/// clamping the transfer to the valid window.
pub fn copy_config(dst: &mut [u8], dst_offset: u64, src: &[u8], src_offset: u64) {
    if let Some(src_slice) = src.get(src_offset as usize..) {
        if let Some(dst_slice) = dst.get_mut(dst_offset as usize..) {
            let len = std::cmp::min(src_slice.len(), dst_slice.len());
            dst_slice[..len].copy_from_slice(&src_slice[..len]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_config_clamps() {
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 2];
        copy_config(&mut dst, 0, &src, 2);
        assert_eq!(dst, [3, 4]);
        // Out of window reads copy nothing.
        let mut dst = [0u8; 2];
        copy_config(&mut dst, 0, &src, 8);
        assert_eq!(dst, [0, 0]);
    }
}
