// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::mem;

use crate::errno_result;
use crate::AsRawDescriptor;
use crate::FromRawDescriptor;
use crate::RawDescriptor;
use crate::Result;
use crate::SafeDescriptor;

/// A safe wrapper around a Linux eventfd.
///
/// An eventfd holds a 64-bit counter. `write` adds to the counter and
/// `read` blocks until it is nonzero, then returns it and resets it to
/// zero. This is the basic wakeup primitive used between guest traps,
/// device workers and the hypervisor's ioeventfd/irqfd machinery.
#[derive(Debug)]
pub struct Event(SafeDescriptor);

impl Event {
    /// Creates a new eventfd with an initial value of 0.
    pub fn new() -> Result<Event> {
        // Safe because eventfd merely allocates a descriptor which we
        // immediately take ownership of.
        let ret = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if ret < 0 {
            return errno_result();
        }
        // Safe because we verified the descriptor is valid and own it.
        Ok(Event(unsafe { SafeDescriptor::from_raw_descriptor(ret) }))
    }

    /// Adds `v` to the eventfd's counter, waking any waiter.
    pub fn write(&self, v: u64) -> Result<()> {
        // Safe because the descriptor is valid and we pass a buffer of the
        // size the kernel expects.
        let ret = unsafe {
            libc::write(
                self.as_raw_descriptor(),
                &v as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret <= 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Blocks until the counter is nonzero, then returns and clears it.
    pub fn read(&self) -> Result<u64> {
        let mut v = 0u64;
        // Safe because the descriptor is valid and the buffer is sized for
        // the kernel's write.
        let ret = unsafe {
            libc::read(
                self.as_raw_descriptor(),
                &mut v as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret <= 0 {
            return errno_result();
        }
        Ok(v)
    }

    /// Clones the eventfd; both ends share the same counter.
    pub fn try_clone(&self) -> Result<Event> {
        self.0.try_clone().map(Event)
    }
}

impl AsRawDescriptor for Event {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.0.as_raw_descriptor()
    }
}

impl FromRawDescriptor for Event {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self {
        Event(SafeDescriptor::from_raw_descriptor(descriptor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let evt = Event::new().unwrap();
        evt.write(3).unwrap();
        evt.write(4).unwrap();
        assert_eq!(evt.read().unwrap(), 7);
    }

    #[test]
    fn clone_shares_counter() {
        let evt = Event::new().unwrap();
        let clone = evt.try_clone().unwrap();
        clone.write(1).unwrap();
        assert_eq!(evt.read().unwrap(), 1);
    }
}
