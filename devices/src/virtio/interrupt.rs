// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use base::error;
use sync::Mutex;

use crate::irq::IrqRouting;
use crate::pci::MsixConfig;

/// Vector value a driver writes to leave a queue without MSI-X.
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

/// The transport-side interrupt state of one virtio-pci device, shared
/// between the vCPU-facing register emulation and the device's worker
/// thread.
pub struct InterruptState {
    pub msix: MsixConfig,
    pub isr: u8,
    pub legacy_irq_line: u32,
    pub config_vector: u16,
    pub config_gsi: Option<u32>,
    pub queue_vectors: Vec<u16>,
    pub queue_gsis: Vec<Option<u32>>,
}

impl InterruptState {
    pub fn new(num_msix_vectors: u16, num_queues: usize) -> InterruptState {
        InterruptState {
            msix: MsixConfig::new(num_msix_vectors),
            isr: 0,
            legacy_irq_line: 0,
            config_vector: VIRTIO_MSI_NO_VECTOR,
            config_gsi: None,
            queue_vectors: vec![VIRTIO_MSI_NO_VECTOR; num_queues],
            queue_gsis: vec![None; num_queues],
        }
    }

    /// Resolves the GSI backing `vector`, whether it serves the config
    /// change interrupt or a queue.
    pub fn gsi_for_vector(&self, vector: u16) -> Option<u32> {
        if vector == self.config_vector {
            return self.config_gsi;
        }
        self.queue_vectors
            .iter()
            .position(|v| *v == vector)
            .and_then(|q| self.queue_gsis[q])
    }
}

/// Handle device workers use to raise guest interrupts through the
/// transport's rules.
#[derive(Clone)]
pub struct Interrupt {
    irq: Arc<IrqRouting>,
    state: Arc<Mutex<InterruptState>>,
}

impl Interrupt {
    pub fn new(irq: Arc<IrqRouting>, state: Arc<Mutex<InterruptState>>) -> Interrupt {
        Interrupt { irq, state }
    }

    /// Signals the vector assigned to queue `queue_index`, applying the
    /// MSI-X mask/pending rules, and falling back to the INTx line when
    /// MSI-X is disabled or the queue has no vector.
    pub fn signal_used_queue(&self, queue_index: usize) {
        let vector = {
            let state = self.state.lock();
            state.queue_vectors.get(queue_index).copied()
        };
        match vector {
            Some(vector) => self.signal(vector),
            None => error!("signal for unknown queue {}", queue_index),
        }
    }

    /// Signals the configuration-change vector.
    pub fn signal_config_changed(&self) {
        let vector = self.state.lock().config_vector;
        self.signal(vector);
    }

    fn signal(&self, vector: u16) {
        let mut state = self.state.lock();
        if state.msix.enabled() && vector != VIRTIO_MSI_NO_VECTOR {
            let vector = vector as usize;
            if state.msix.vector_masked(vector) {
                state.msix.set_pba_bit(vector);
                return;
            }
            let msg = state.msix.msg(vector);
            if self.irq.can_signal_msi() {
                if let Err(e) = self.irq.signal_msi(msg) {
                    error!("failed to inject MSI: {}", e);
                }
            } else if let Some(gsi) = state.gsi_for_vector(vector as u16) {
                if let Err(e) = self.irq.trigger(gsi) {
                    error!("failed to pulse GSI {}: {}", gsi, e);
                }
            }
        } else {
            state.isr |= 0x1;
            if let Err(e) = self.irq.line(state.legacy_irq_line, true) {
                error!("failed to raise INTx line: {}", e);
            }
        }
    }

    /// Delivers a vector that was pending in the PBA and has just been
    /// unmasked.
    pub fn deliver_pending(&self, vector: u16) {
        self.signal(vector);
    }
}
