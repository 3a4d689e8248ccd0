// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::sync::Arc;

use base::error;

use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;
use crate::irq::IrqRouting;

pub const I8042_DATA_PORT: u64 = 0x60;
pub const I8042_COMMAND_PORT: u64 = 0x64;

const KBD_IRQ: u32 = 1;
const AUX_IRQ: u32 = 12;

// Status register bits.
const STR_OBF: u8 = 0x01;
const STR_CMDDAT: u8 = 0x08;
const STR_KEYLOCK: u8 = 0x10;
const STR_AUXDATA: u8 = 0x20;
const STR_MUXERR: u8 = 0x40;

// Controller commands (port 0x64).
const CMD_CTL_RCTR: u8 = 0x20;
const CMD_CTL_WCTR: u8 = 0x60;
const CMD_AUX_DISABLE: u8 = 0xa7;
const CMD_AUX_ENABLE: u8 = 0xa8;
const CMD_AUX_TEST: u8 = 0xa9;
const CMD_SELF_TEST: u8 = 0xaa;
const CMD_KBD_TEST: u8 = 0xab;
const CMD_AUX_SEND: u8 = 0xd4;

// Controller mode bits.
const MODE_KBD_INT: u8 = 0x01;
const MODE_SYS: u8 = 0x02;
const MODE_DISABLE_AUX: u8 = 0x20;

const RESPONSE_ACK: u8 = 0xfa;
const SELF_TEST_OK: u8 = 0x55;
const RESET_OK: u8 = 0xaa;

const QUEUE_SIZE: usize = 128;

/// PS/2 keyboard and mouse controller.
///
/// Bytes queued for the guest raise IRQ 1 or 12 as level lines; the
/// keyboard queue has priority over the mouse queue, matching the
/// hardware arbitration.
pub struct I8042Device {
    irq: Arc<IrqRouting>,
    status: u8,
    mode: u8,
    /// Pending controller command awaiting its data byte on port 0x60.
    write_command: u8,
    kbd_queue: VecDeque<u8>,
    aux_queue: VecDeque<u8>,
}

impl I8042Device {
    pub fn new(irq: Arc<IrqRouting>) -> I8042Device {
        I8042Device {
            irq,
            status: STR_MUXERR | STR_CMDDAT | STR_KEYLOCK,
            mode: MODE_KBD_INT | MODE_SYS,
            write_command: 0,
            kbd_queue: VecDeque::new(),
            aux_queue: VecDeque::new(),
        }
    }

    fn set_line(&self, irq: u32, level: bool) {
        if let Err(e) = self.irq.line(irq, level) {
            error!("i8042: failed setting irq {}: {}", irq, e);
        }
    }

    /// Recomputes the output-buffer status bits and drives both lines.
    fn update_irq(&mut self) {
        self.status &= !(STR_OBF | STR_AUXDATA);
        let mut kbd_level = false;
        let mut aux_level = false;
        if !self.kbd_queue.is_empty() {
            self.status |= STR_OBF;
            kbd_level = true;
        }
        if !kbd_level && !self.aux_queue.is_empty() {
            self.status |= STR_OBF | STR_AUXDATA;
            aux_level = true;
        }
        self.set_line(KBD_IRQ, kbd_level && self.mode & MODE_KBD_INT != 0);
        self.set_line(AUX_IRQ, aux_level);
    }

    fn kbd_queue_push(&mut self, byte: u8) {
        if self.kbd_queue.len() < QUEUE_SIZE {
            self.kbd_queue.push_back(byte);
        }
        self.update_irq();
    }

    fn aux_queue_push(&mut self, byte: u8) {
        if self.aux_queue.len() < QUEUE_SIZE {
            self.aux_queue.push_back(byte);
        }
        self.update_irq();
    }

    /// Host-side injection of a keyboard scancode.
    pub fn queue_scancode(&mut self, byte: u8) {
        self.kbd_queue_push(byte);
    }

    fn read_data(&mut self) -> u8 {
        let byte = if !self.kbd_queue.is_empty() {
            self.kbd_queue.pop_front().unwrap_or(0)
        } else {
            self.aux_queue.pop_front().unwrap_or(0)
        };
        self.update_irq();
        byte
    }

    fn write_command_port(&mut self, value: u8) {
        match value {
            CMD_CTL_RCTR => {
                let mode = self.mode;
                self.kbd_queue_push(mode);
            }
            CMD_CTL_WCTR | CMD_AUX_SEND => {
                self.write_command = value;
            }
            CMD_AUX_DISABLE => self.mode |= MODE_DISABLE_AUX,
            CMD_AUX_ENABLE => self.mode &= !MODE_DISABLE_AUX,
            CMD_AUX_TEST => self.kbd_queue_push(0),
            CMD_SELF_TEST => self.kbd_queue_push(SELF_TEST_OK),
            CMD_KBD_TEST => self.kbd_queue_push(0),
            _ => (),
        }
    }

    fn write_data_port(&mut self, value: u8) {
        match self.write_command {
            CMD_CTL_WCTR => {
                self.write_command = 0;
                self.mode = value;
                self.update_irq();
            }
            CMD_AUX_SEND => {
                self.write_command = 0;
                // The only aux device command answers the monitor needs
                // are an ACK, plus the reset completion code.
                self.aux_queue_push(RESPONSE_ACK);
                if value == 0xff {
                    self.aux_queue_push(RESET_OK);
                }
            }
            _ => {
                // A device command for the keyboard itself.
                self.kbd_queue_push(RESPONSE_ACK);
                if value == 0xff {
                    self.kbd_queue_push(RESET_OK);
                }
            }
        }
    }
}

impl BusDevice for I8042Device {
    fn debug_label(&self) -> String {
        "i8042".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if data.len() != 1 {
            data.fill(0);
            return;
        }
        data[0] = match info.address {
            I8042_COMMAND_PORT => self.status,
            I8042_DATA_PORT => self.read_data(),
            _ => 0,
        };
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if data.len() != 1 {
            return;
        }
        match info.address {
            I8042_COMMAND_PORT => self.write_command_port(data[0]),
            I8042_DATA_PORT => self.write_data_port(data[0]),
            _ => (),
        }
    }
}
