// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stub handlers for the legacy motherboard ports the guest kernel pokes
//! during early boot.

use std::sync::Arc;

use sync::Mutex;

use crate::bus::Bus;
use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;

/// Absorbs writes and reads as zero.
struct NullDevice;

impl BusDevice for NullDevice {
    fn debug_label(&self) -> String {
        "null-port".to_string()
    }

    fn read(&mut self, _info: BusAccessInfo, data: &mut [u8]) {
        data.fill(0);
    }

    fn write(&mut self, _info: BusAccessInfo, _data: &[u8]) {}
}

/// The "fast A20 gate" at port 0x92. A20 is always enabled.
struct Ps2Control;

impl BusDevice for Ps2Control {
    fn debug_label(&self) -> String {
        "ps2-control".to_string()
    }

    fn read(&mut self, _info: BusAccessInfo, data: &mut [u8]) {
        if let Some(first) = data.first_mut() {
            *first = 0x02;
        }
    }

    fn write(&mut self, _info: BusAccessInfo, _data: &[u8]) {}
}

/// Registers stubs for the DMA controllers, PIC and PIT data ports, math
/// coprocessor, printer and CRT control ports, the BIOS debug/delay
/// ports, and the A20 gate.
pub fn register_legacy_stub_ports(io_bus: &Bus) -> crate::bus::Result<()> {
    // (base, length) pairs of the stubbed ranges.
    const STUB_RANGES: &[(u64, u64)] = &[
        (0x0000, 32),  // DMA1 controller
        (0x0020, 2),   // 8259A PIC 1
        (0x0040, 4),   // PIT
        (0x00a0, 2),   // 8259A PIC 2
        (0x00c0, 32),  // DMA2 controller
        (0x00e0, 1),   // motherboard debug port
        (0x00ed, 1),   // delay port
        (0x00f0, 2),   // math coprocessor
        (0x0278, 3),   // parallel printer port
        (0x0378, 3),   // parallel printer port
        (0x03d4, 1),   // CRT control registers
        (0x03d5, 1),
        (0x0402, 1),
        (0x0510, 2),   // BIOS configuration register
    ];

    let null_dev = Arc::new(Mutex::new(NullDevice));
    for (base, len) in STUB_RANGES {
        io_bus.insert(null_dev.clone(), *base, *len)?;
    }
    io_bus.insert(Arc::new(Mutex::new(Ps2Control)), 0x92, 1)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusType;

    #[test]
    fn a20_gate_reads_enabled() {
        let bus = Bus::new(BusType::Io);
        register_legacy_stub_ports(&bus).unwrap();
        let mut data = [0u8; 1];
        assert!(bus.read(0, 0x92, &mut data));
        assert_eq!(data[0], 0x02);
    }

    #[test]
    fn stub_ports_claimed_and_quiet() {
        let bus = Bus::new(BusType::Io);
        register_legacy_stub_ports(&bus).unwrap();
        let mut data = [0xffu8; 1];
        assert!(bus.read(0, 0x40, &mut data));
        assert_eq!(data[0], 0);
        assert!(bus.write(0, 0x20, &[0x11]));
    }
}
