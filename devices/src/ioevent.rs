// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use base::error;
use base::Event;
use base::EventToken;
use base::WaitContext;
use kvm::IoEventAddress;
use kvm::Vm;
use sync::Mutex;

/// Token space for the pump's epoll set: the stop event plus one slot per
/// registered ioevent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Token {
    Stop,
    Ioevent(u64),
}

impl EventToken for Token {
    fn as_raw_token(&self) -> u64 {
        match self {
            Token::Stop => u64::MAX,
            Token::Ioevent(slot) => *slot,
        }
    }

    fn from_raw_token(data: u64) -> Self {
        if data == u64::MAX {
            Token::Stop
        } else {
            Token::Ioevent(data)
        }
    }
}

struct PumpEntry {
    event: Event,
    addr: IoEventAddress,
    len: u32,
    datamatch: Option<u64>,
    user_poll: bool,
    callback: Arc<dyn Fn() + Send + Sync>,
}

struct PumpShared {
    vm: Arc<Vm>,
    wait_ctx: WaitContext<Token>,
    entries: Mutex<BTreeMap<u64, PumpEntry>>,
    next_slot: Mutex<u64>,
    stop_evt: Event,
}

/// Translates guest doorbell writes into host-side callbacks.
///
/// Every registered event is installed in the kernel with
/// `KVM_IOEVENTFD`, so a matching guest access writes the eventfd without
/// a userspace exit. Events registered with `user_poll` additionally join
/// this pump's epoll set, and the pump thread drains them and runs their
/// callback; without `user_poll` some other consumer owns the eventfd.
pub struct IoEventPump {
    shared: Arc<PumpShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IoEventPump {
    /// Creates the pump and starts its polling thread.
    pub fn new(vm: Arc<Vm>) -> base::Result<IoEventPump> {
        let wait_ctx = WaitContext::new()?;
        let stop_evt = Event::new()?;
        wait_ctx.add(&stop_evt, Token::Stop)?;
        let shared = Arc::new(PumpShared {
            vm,
            wait_ctx,
            entries: Mutex::new(BTreeMap::new()),
            next_slot: Mutex::new(0),
            stop_evt,
        });
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("ioeventfd-worker".to_string())
            .spawn(move || pump_thread(thread_shared))
            .map_err(|_| base::Error::new(libc::EAGAIN))?;
        Ok(IoEventPump {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Registers `event` to fire on guest writes matching `(addr, len,
    /// datamatch)`. With `user_poll` the pump also waits on the event and
    /// invokes `callback` each time it fires.
    pub fn add(
        &self,
        event: Event,
        addr: IoEventAddress,
        len: u32,
        datamatch: Option<u64>,
        user_poll: bool,
        callback: Arc<dyn Fn() + Send + Sync>,
    ) -> base::Result<()> {
        self.shared
            .vm
            .register_ioevent(&event, addr, len, datamatch)?;
        let slot = {
            let mut next = self.shared.next_slot.lock();
            let slot = *next;
            *next += 1;
            slot
        };
        if user_poll {
            if let Err(e) = self.shared.wait_ctx.add(&event, Token::Ioevent(slot)) {
                let _ = self.shared.vm.unregister_ioevent(&event, addr, len, datamatch);
                return Err(e);
            }
        }
        self.shared.entries.lock().insert(
            slot,
            PumpEntry {
                event,
                addr,
                len,
                datamatch,
                user_poll,
                callback,
            },
        );
        Ok(())
    }

    /// Removes the ioevent registered for `(addr, datamatch)`, deassigning
    /// it from the kernel and dropping its eventfd.
    pub fn del(&self, addr: IoEventAddress, datamatch: Option<u64>) -> base::Result<()> {
        let mut entries = self.shared.entries.lock();
        let slot = entries
            .iter()
            .find(|(_, e)| e.addr == addr && e.datamatch == datamatch)
            .map(|(slot, _)| *slot)
            .ok_or(base::Error::new(libc::ENOENT))?;
        let entry = entries.remove(&slot).expect("slot found above");
        drop(entries);
        let _ = self
            .shared
            .vm
            .unregister_ioevent(&entry.event, entry.addr, entry.len, entry.datamatch);
        if entry.user_poll {
            let _ = self.shared.wait_ctx.delete(&entry.event);
        }
        Ok(())
    }

    /// Stops the pump thread. Called once at teardown; later calls are
    /// no-ops.
    pub fn stop(&self) {
        if let Some(thread) = self.thread.lock().take() {
            let _ = self.shared.stop_evt.write(1);
            let _ = thread.join();
        }
    }
}

impl Drop for IoEventPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_thread(shared: Arc<PumpShared>) {
    loop {
        let events = match shared.wait_ctx.wait() {
            Ok(events) => events,
            Err(e) => {
                error!("ioeventfd pump failed waiting: {}", e);
                return;
            }
        };
        for event in events.iter().filter(|e| e.is_readable) {
            match event.token {
                Token::Stop => {
                    let _ = shared.stop_evt.read();
                    return;
                }
                Token::Ioevent(slot) => {
                    let callback = {
                        let entries = shared.entries.lock();
                        match entries.get(&slot) {
                            Some(entry) => {
                                if entry.event.read().is_err() {
                                    error!("failed draining ioeventfd for slot {}", slot);
                                    continue;
                                }
                                entry.callback.clone()
                            }
                            // Raced with `del`; the eventfd is gone.
                            None => continue,
                        }
                    };
                    callback();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        assert_eq!(Token::from_raw_token(Token::Stop.as_raw_token()), Token::Stop);
        assert_eq!(
            Token::from_raw_token(Token::Ioevent(7).as_raw_token()),
            Token::Ioevent(7)
        );
    }
}
