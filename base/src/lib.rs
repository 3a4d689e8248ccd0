// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Safe, small wrappers over the host OS facilities the monitor needs:
//! errno capture, eventfds, epoll, mmap, and ioctl plumbing.

mod descriptor;
mod errno;
mod event;
#[macro_use]
pub mod ioctl;
pub mod mmap;
pub mod syslog;
mod wait_context;

pub use crate::descriptor::AsRawDescriptor;
pub use crate::descriptor::FromRawDescriptor;
pub use crate::descriptor::IntoRawDescriptor;
pub use crate::descriptor::RawDescriptor;
pub use crate::descriptor::SafeDescriptor;
pub use crate::errno::errno_result;
pub use crate::errno::Error;
pub use crate::errno::Result;
pub use crate::event::Event;
pub use crate::ioctl::ioctl;
pub use crate::ioctl::ioctl_with_mut_ref;
pub use crate::ioctl::ioctl_with_ptr;
pub use crate::ioctl::ioctl_with_ref;
pub use crate::ioctl::ioctl_with_val;
pub use crate::ioctl::IoctlNr;
pub use crate::mmap::MemoryMapping;
pub use crate::wait_context::EventToken;
pub use crate::wait_context::TriggeredEvent;
pub use crate::wait_context::WaitContext;

pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::warn;

/// Returns the number of online logical cores on the host.
pub fn number_of_logical_cores() -> Result<usize> {
    // Safe because we check the return value.
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 0 {
        return errno_result();
    }
    Ok(ret as usize)
}

/// Round `v` up to the next multiple of `align`, which must be a power of
/// two.
pub fn align_up(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

/// Sets the name of the calling thread as shown by the kernel.
pub fn set_thread_name(name: &str) {
    if let Ok(name) = std::ffi::CString::new(name) {
        // Safe because the string is NUL terminated and PR_SET_NAME copies
        // at most 16 bytes from it.
        unsafe {
            libc::prctl(libc::PR_SET_NAME, name.as_ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_values() {
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_up(1, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x100), 0x1100);
    }
}
