// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::marker::PhantomData;

/// A bounded view of guest memory that may be concurrently modified by the
/// guest. All accesses go through raw pointer copies; holding one never
/// creates a Rust reference to the underlying bytes.
#[derive(Copy, Clone, Debug)]
pub struct VolatileSlice<'a> {
    addr: *mut u8,
    size: usize,
    phantom: PhantomData<&'a mut [u8]>,
}

// Safe because the slice only hands out data via copies and the backing
// guest mapping outlives all slices ('a is tied to the GuestMemory).
unsafe impl<'a> Send for VolatileSlice<'a> {}
unsafe impl<'a> Sync for VolatileSlice<'a> {}

impl<'a> VolatileSlice<'a> {
    /// # Safety
    /// `addr` must be valid for reads and writes of `size` bytes for the
    /// lifetime `'a`.
    pub unsafe fn from_raw_parts(addr: *mut u8, size: usize) -> VolatileSlice<'a> {
        VolatileSlice {
            addr,
            size,
            phantom: PhantomData,
        }
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Represents the slice as an iovec for vectored I/O directly in and
    /// out of guest memory.
    pub fn as_iovec(&self) -> libc::iovec {
        libc::iovec {
            iov_base: self.addr as *mut libc::c_void,
            iov_len: self.size,
        }
    }

    /// Returns the subslice `[offset, offset + len)` of this slice.
    pub fn sub_slice(&self, offset: usize, len: usize) -> Option<VolatileSlice<'a>> {
        let end = offset.checked_add(len)?;
        if end > self.size {
            return None;
        }
        // Safe because the range stays within this slice.
        Some(unsafe { VolatileSlice::from_raw_parts(self.addr.add(offset), len) })
    }

    /// Copies as many bytes as fit from the slice into `buf`, returning
    /// the number copied.
    pub fn copy_to_slice(&self, buf: &mut [u8]) -> usize {
        let count = std::cmp::min(self.size, buf.len());
        // Safe because both regions were bounds checked and a guest
        // mapping never overlaps a host buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr, buf.as_mut_ptr(), count);
        }
        count
    }

    /// Copies as many bytes as fit from `buf` into the slice, returning
    /// the number copied.
    pub fn copy_from_slice(&self, buf: &[u8]) -> usize {
        let count = std::cmp::min(self.size, buf.len());
        // Safe because both regions were bounds checked.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.addr, count);
        }
        count
    }

    /// Fills the slice with `value`.
    pub fn write_bytes(&self, value: u8) {
        // Safe because the slice bounds its own region.
        unsafe {
            std::ptr::write_bytes(self.addr, value, self.size);
        }
    }
}
