// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::ptr::null_mut;

use remain::sorted;
use thiserror::Error;

use crate::AsRawDescriptor;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("madvise failed: {0}")]
    Madvise(crate::Error),
    #[error("mmap failed: {0}")]
    Mmap(crate::Error),
    #[error("mprotect failed: {0}")]
    Mprotect(crate::Error),
    #[error("requested range at {0:#x} of {1:#x} bytes is outside the mapping")]
    OutOfRange(usize, usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An anonymous or descriptor-backed memory mapping, unmapped on drop.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// Safe because the pointer and size describe an owned region that is valid
// for the life of the mapping regardless of which thread touches it.
unsafe impl Send for MemoryMapping {}
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    /// Creates a private anonymous read/write mapping of `size` bytes.
    pub fn new(size: usize) -> Result<MemoryMapping> {
        // Safe because we request an anonymous mapping and check the result.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Mmap(crate::Error::last()));
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    /// Maps `size` bytes of `descriptor` starting at `offset`, shared.
    ///
    /// This is how the per-vCPU run-state page is mapped.
    pub fn from_descriptor_offset<F: AsRawDescriptor>(
        descriptor: &F,
        size: usize,
        offset: u64,
    ) -> Result<MemoryMapping> {
        // Safe because the descriptor is valid and we check the result.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                descriptor.as_raw_descriptor(),
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Mmap(crate::Error::last()));
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Removes all access from `[offset, offset + len)` within the mapping.
    pub fn protect_none(&self, offset: usize, len: usize) -> Result<()> {
        self.range_check(offset, len)?;
        // Safe because the range was checked against the owned mapping.
        let ret = unsafe {
            libc::mprotect(
                self.addr.add(offset) as *mut libc::c_void,
                len,
                libc::PROT_NONE,
            )
        };
        if ret < 0 {
            return Err(Error::Mprotect(crate::Error::last()));
        }
        Ok(())
    }

    /// Marks the whole mapping as a candidate for same-page merging.
    pub fn advise_mergeable(&self) -> Result<()> {
        // Safe because the range is the owned mapping.
        let ret = unsafe {
            libc::madvise(
                self.addr as *mut libc::c_void,
                self.size,
                libc::MADV_MERGEABLE,
            )
        };
        if ret < 0 {
            return Err(Error::Madvise(crate::Error::last()));
        }
        Ok(())
    }

    /// Copies `buf` into the mapping at `offset`.
    pub fn write_slice(&self, buf: &[u8], offset: usize) -> Result<()> {
        self.range_check(offset, buf.len())?;
        // Safe because the range was checked and the regions cannot overlap
        // (`buf` is not derived from this mapping).
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.addr.add(offset), buf.len());
        }
        Ok(())
    }

    /// Copies from the mapping at `offset` into `buf`.
    pub fn read_slice(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        self.range_check(offset, buf.len())?;
        // Safe because the range was checked.
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Zero-fills `[offset, offset + len)`.
    pub fn write_zeroes(&self, offset: usize, len: usize) -> Result<()> {
        self.range_check(offset, len)?;
        // Safe because the range was checked.
        unsafe {
            std::ptr::write_bytes(self.addr.add(offset), 0, len);
        }
        Ok(())
    }

    fn range_check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfRange(offset, len)),
        }
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // Safe because this mapping is owned and the pointer/size came from
        // a successful mmap.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_roundtrip() {
        let m = MemoryMapping::new(0x1000).unwrap();
        m.write_slice(&[1, 2, 3, 4], 0x10).unwrap();
        let mut buf = [0u8; 4];
        m.read_slice(&mut buf, 0x10).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_range_rejected() {
        let m = MemoryMapping::new(0x1000).unwrap();
        assert!(m.write_slice(&[0u8; 8], 0xffc).is_err());
        assert!(m.read_slice(&mut [0u8; 1], 0x1000).is_err());
    }

    #[test]
    fn protect_hole() {
        let m = MemoryMapping::new(0x3000).unwrap();
        m.protect_none(0x1000, 0x1000).unwrap();
        // The surrounding pages stay accessible.
        m.write_slice(&[0xa5], 0xfff).unwrap();
        m.write_slice(&[0xa5], 0x2000).unwrap();
    }
}
