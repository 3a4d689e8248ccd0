// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use base::error;

use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;
use crate::irq::IrqRouting;

/// Base ports of the four standard COM devices.
pub const SERIAL_ADDR: [u64; 4] = [0x3f8, 0x2f8, 0x3e8, 0x2e8];
/// Interrupt lines paired with `SERIAL_ADDR`.
pub const SERIAL_IRQS: [u32; 4] = [4, 3, 4, 3];

const DATA: u64 = 0;
const IER: u64 = 1;
const IIR: u64 = 2;
const LCR: u64 = 3;
const MCR: u64 = 4;
const LSR: u64 = 5;
const MSR: u64 = 6;
const SCR: u64 = 7;

const IER_RECV_BIT: u8 = 0x1;
const IER_THR_BIT: u8 = 0x2;
const IER_MASK: u8 = 0x0f;

const IIR_NONE_BIT: u8 = 0x1;
const IIR_THR_BIT: u8 = 0x2;
const IIR_RECV_BIT: u8 = 0x4;

const LCR_DLAB_BIT: u8 = 0x80;

const LSR_DATA_BIT: u8 = 0x1;
const LSR_EMPTY_BIT: u8 = 0x20;
const LSR_IDLE_BIT: u8 = 0x40;

const MCR_LOOP_BIT: u8 = 0x10;

const DEFAULT_BAUD_DIVISOR: u16 = 12; // 9600 bps

/// An 8250-style UART.
///
/// Output lands in the attached sink; input bytes are queued by the host
/// side with `queue_input_bytes`. Interrupts are edge pulses through the
/// interrupt plane, the way the rest of this chipset signals.
pub struct Serial {
    interrupt_enable: u8,
    interrupt_identification: u8,
    line_control: u8,
    line_status: u8,
    modem_control: u8,
    modem_status: u8,
    scratch: u8,
    baud_divisor: u16,
    in_buffer: VecDeque<u8>,
    out: Option<Box<dyn io::Write + Send>>,
    irq: Arc<IrqRouting>,
    irq_line: u32,
}

impl Serial {
    pub fn new(
        irq: Arc<IrqRouting>,
        irq_line: u32,
        out: Option<Box<dyn io::Write + Send>>,
    ) -> Serial {
        Serial {
            interrupt_enable: 0,
            interrupt_identification: IIR_NONE_BIT,
            line_control: 0x3, // 8n1
            line_status: LSR_EMPTY_BIT | LSR_IDLE_BIT,
            modem_control: 0x8,
            modem_status: 0xb0,
            scratch: 0,
            baud_divisor: DEFAULT_BAUD_DIVISOR,
            in_buffer: VecDeque::new(),
            out,
            irq,
            irq_line,
        }
    }

    fn dlab_set(&self) -> bool {
        self.line_control & LCR_DLAB_BIT != 0
    }

    /// Queues bytes for the guest to read, raising the receive interrupt
    /// if the driver asked for it.
    pub fn queue_input_bytes(&mut self, bytes: &[u8]) {
        self.in_buffer.extend(bytes);
        self.line_status |= LSR_DATA_BIT;
        if self.interrupt_enable & IER_RECV_BIT != 0 {
            self.interrupt_identification = IIR_RECV_BIT;
            self.pulse_interrupt();
        }
    }

    fn pulse_interrupt(&self) {
        if let Err(e) = self.irq.trigger(self.irq_line) {
            error!("serial: failed to pulse irq {}: {}", self.irq_line, e);
        }
    }

    fn handle_write(&mut self, offset: u64, value: u8) {
        match offset {
            DATA if self.dlab_set() => {
                self.baud_divisor = (self.baud_divisor & 0xff00) | value as u16;
            }
            IER if self.dlab_set() => {
                self.baud_divisor = (self.baud_divisor & 0x00ff) | ((value as u16) << 8);
            }
            DATA => {
                if self.modem_control & MCR_LOOP_BIT != 0 {
                    self.in_buffer.push_back(value);
                    self.line_status |= LSR_DATA_BIT;
                } else if let Some(out) = self.out.as_mut() {
                    if out.write_all(&[value]).and_then(|_| out.flush()).is_err() {
                        // Sink trouble is not the guest's problem.
                    }
                }
                if self.interrupt_enable & IER_THR_BIT != 0 {
                    self.interrupt_identification = IIR_THR_BIT;
                    self.pulse_interrupt();
                }
            }
            IER => self.interrupt_enable = value & IER_MASK,
            LCR => self.line_control = value,
            MCR => self.modem_control = value,
            SCR => self.scratch = value,
            _ => (),
        }
    }

    fn handle_read(&mut self, offset: u64) -> u8 {
        match offset {
            DATA if self.dlab_set() => self.baud_divisor as u8,
            IER if self.dlab_set() => (self.baud_divisor >> 8) as u8,
            DATA => {
                let byte = self.in_buffer.pop_front().unwrap_or(0);
                if self.in_buffer.is_empty() {
                    self.line_status &= !LSR_DATA_BIT;
                }
                byte
            }
            IER => self.interrupt_enable,
            IIR => {
                let value = self.interrupt_identification;
                self.interrupt_identification = IIR_NONE_BIT;
                value
            }
            LCR => self.line_control,
            MCR => self.modem_control,
            LSR => self.line_status,
            MSR => self.modem_status,
            SCR => self.scratch,
            _ => 0,
        }
    }
}

impl BusDevice for Serial {
    fn debug_label(&self) -> String {
        "serial".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if data.len() != 1 {
            data.fill(0);
            return;
        }
        data[0] = self.handle_read(info.offset);
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if data.len() != 1 {
            return;
        }
        self.handle_write(info.offset, data[0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm::Vm;

    // IrqRouting needs a live VM; these tests only exercise register
    // state, so build a loopback-only serial with a routing stub when
    // KVM is present and skip interrupt assertions otherwise.
    fn test_irq() -> Option<Arc<IrqRouting>> {
        if !std::path::Path::new("/dev/kvm").exists() {
            return None;
        }
        let kvm = kvm::Kvm::new().ok()?;
        let mem = vm_memory::GuestMemory::x86_layout(1 << 20).ok()?;
        let vm = Arc::new(Vm::new(&kvm, mem).ok()?);
        vm.create_irq_chip().ok()?;
        IrqRouting::new(vm).ok().map(Arc::new)
    }

    #[test]
    fn loopback_echoes() {
        let irq = match test_irq() {
            Some(irq) => irq,
            None => return,
        };
        let mut serial = Serial::new(irq, 4, None);
        let info = |offset| BusAccessInfo {
            offset,
            address: 0x3f8 + offset,
            id: 0,
        };
        serial.write(info(MCR), &[MCR_LOOP_BIT]);
        serial.write(info(DATA), &[0x42]);
        let mut data = [0u8; 1];
        serial.read(info(LSR), &mut data);
        assert_ne!(data[0] & LSR_DATA_BIT, 0);
        serial.read(info(DATA), &mut data);
        assert_eq!(data[0], 0x42);
    }

    #[test]
    fn divisor_behind_dlab() {
        let irq = match test_irq() {
            Some(irq) => irq,
            None => return,
        };
        let mut serial = Serial::new(irq, 4, None);
        let info = |offset| BusAccessInfo {
            offset,
            address: 0x3f8 + offset,
            id: 0,
        };
        serial.write(info(LCR), &[LCR_DLAB_BIT]);
        serial.write(info(DATA), &[0x0c]);
        serial.write(info(IER), &[0x00]);
        let mut data = [0u8; 1];
        serial.read(info(DATA), &mut data);
        assert_eq!(data[0], 0x0c);
        serial.write(info(LCR), &[0x3]);
        serial.read(info(IER), &mut data);
        assert_eq!(data[0], 0);
    }
}
