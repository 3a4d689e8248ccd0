// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::IntoRawFd;
use std::os::unix::io::RawFd;

use crate::errno_result;
use crate::Result;

/// Raw file descriptor alias used throughout the tree.
pub type RawDescriptor = RawFd;

/// Trait for forfeiting ownership of the current raw descriptor and
/// returning it.
pub trait IntoRawDescriptor {
    fn into_raw_descriptor(self) -> RawDescriptor;
}

/// Trait for returning the underlying raw descriptor without affecting
/// ownership.
pub trait AsRawDescriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor;
}

/// Trait for constructing a wrapper from a raw descriptor, taking
/// ownership of it.
pub trait FromRawDescriptor {
    /// # Safety
    /// The caller must guarantee that the descriptor is valid and that
    /// ownership may be transferred.
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self;
}

/// Wraps a raw descriptor, closing it on drop.
#[derive(Debug, PartialEq, Eq)]
pub struct SafeDescriptor {
    descriptor: RawDescriptor,
}

impl SafeDescriptor {
    /// Clones this descriptor, internally creating a new descriptor.
    pub fn try_clone(&self) -> Result<SafeDescriptor> {
        // Safe because this duplicates a descriptor we own.
        let descriptor = unsafe { libc::fcntl(self.descriptor, libc::F_DUPFD_CLOEXEC, 0) };
        if descriptor < 0 {
            return errno_result();
        }
        Ok(SafeDescriptor { descriptor })
    }
}

impl Drop for SafeDescriptor {
    fn drop(&mut self) {
        // Safe because this descriptor is owned and not used after close.
        let _ = unsafe { libc::close(self.descriptor) };
    }
}

impl AsRawDescriptor for SafeDescriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.descriptor
    }
}

impl IntoRawDescriptor for SafeDescriptor {
    fn into_raw_descriptor(self) -> RawDescriptor {
        let descriptor = self.descriptor;
        std::mem::forget(self);
        descriptor
    }
}

impl FromRawDescriptor for SafeDescriptor {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self {
        SafeDescriptor { descriptor }
    }
}

impl From<File> for SafeDescriptor {
    fn from(f: File) -> SafeDescriptor {
        SafeDescriptor {
            descriptor: f.into_raw_fd(),
        }
    }
}

impl AsRawDescriptor for File {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.as_raw_fd()
    }
}

impl AsRawDescriptor for std::io::Stdin {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.as_raw_fd()
    }
}
