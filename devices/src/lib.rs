// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emulates virtual hardware: the I/O dispatch buses, the interrupt
//! plane, the ioeventfd pump, the PCI root with its devices, and the
//! legacy PC chipset pieces.

mod bus;
mod cmos;
mod i8042;
mod ioevent;
mod irq;
mod legacy;
pub mod pci;
mod serial;
pub mod virtio;

pub use crate::bus::Bus;
pub use crate::bus::BusAccessInfo;
pub use crate::bus::BusDevice;
pub use crate::bus::BusType;
pub use crate::bus::Error as BusError;
pub use crate::cmos::Cmos;
pub use crate::cmos::RTC_BASE_ADDRESS;
pub use crate::cmos::RTC_LENGTH;
pub use crate::i8042::I8042Device;
pub use crate::i8042::I8042_COMMAND_PORT;
pub use crate::i8042::I8042_DATA_PORT;
pub use crate::ioevent::IoEventPump;
pub use crate::irq::IrqRouting;
pub use crate::irq::MsiMsg;
pub use crate::legacy::register_legacy_stub_ports;
pub use crate::serial::Serial;
pub use crate::serial::SERIAL_ADDR;
pub use crate::serial::SERIAL_IRQS;
