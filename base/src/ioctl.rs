// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Macros and wrappers for making ioctls. The `ioctl_*_nr!` macros mirror
//! the kernel's `_IO`, `_IOR`, `_IOW` and `_IOWR` macros.

use libc::c_int;
use libc::c_ulong;
use libc::c_void;

use crate::AsRawDescriptor;

/// The type of the argument identifying the ioctl request.
pub type IoctlNr = c_ulong;

const IOC_NRBITS: c_ulong = 8;
const IOC_TYPEBITS: c_ulong = 8;
const IOC_SIZEBITS: c_ulong = 14;

const IOC_NRSHIFT: c_ulong = 0;
const IOC_TYPESHIFT: c_ulong = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: c_ulong = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: c_ulong = IOC_SIZESHIFT + IOC_SIZEBITS;

pub const IOC_NONE: c_ulong = 0;
pub const IOC_WRITE: c_ulong = 1;
pub const IOC_READ: c_ulong = 2;

/// Builds an ioctl request number from its components, the same way the
/// kernel's `_IOC` macro does.
pub const fn ioctl_expr(dir: c_ulong, ty: c_ulong, nr: c_ulong, size: c_ulong) -> IoctlNr {
    (dir << IOC_DIRSHIFT) | (ty << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT) | (size << IOC_SIZESHIFT)
}

/// Declares an ioctl with no argument, like the kernel's `_IO`.
#[macro_export]
macro_rules! ioctl_io_nr {
    ($name:ident, $ty:expr, $nr:expr) => {
        pub const $name: $crate::IoctlNr =
            $crate::ioctl::ioctl_expr($crate::ioctl::IOC_NONE, $ty, $nr, 0);
    };
}

/// Declares an ioctl that reads data from the kernel, like `_IOR`.
#[macro_export]
macro_rules! ioctl_ior_nr {
    ($name:ident, $ty:expr, $nr:expr, $size:ty) => {
        pub const $name: $crate::IoctlNr = $crate::ioctl::ioctl_expr(
            $crate::ioctl::IOC_READ,
            $ty,
            $nr,
            std::mem::size_of::<$size>() as libc::c_ulong,
        );
    };
}

/// Declares an ioctl that writes data to the kernel, like `_IOW`.
#[macro_export]
macro_rules! ioctl_iow_nr {
    ($name:ident, $ty:expr, $nr:expr, $size:ty) => {
        pub const $name: $crate::IoctlNr = $crate::ioctl::ioctl_expr(
            $crate::ioctl::IOC_WRITE,
            $ty,
            $nr,
            std::mem::size_of::<$size>() as libc::c_ulong,
        );
    };
}

/// Declares an ioctl that transfers data both ways, like `_IOWR`.
#[macro_export]
macro_rules! ioctl_iowr_nr {
    ($name:ident, $ty:expr, $nr:expr, $size:ty) => {
        pub const $name: $crate::IoctlNr = $crate::ioctl::ioctl_expr(
            $crate::ioctl::IOC_READ | $crate::ioctl::IOC_WRITE,
            $ty,
            $nr,
            std::mem::size_of::<$size>() as libc::c_ulong,
        );
    };
}

/// Runs an ioctl with no arguments.
///
/// # Safety
/// The caller must ensure the ioctl is valid for the descriptor and takes
/// no argument.
pub unsafe fn ioctl<F: AsRawDescriptor>(descriptor: &F, nr: IoctlNr) -> c_int {
    libc::ioctl(descriptor.as_raw_descriptor(), nr, 0)
}

/// Runs an ioctl with a single value argument.
///
/// # Safety
/// The caller must ensure the ioctl is valid for the descriptor and
/// expects an immediate argument.
pub unsafe fn ioctl_with_val<F: AsRawDescriptor>(
    descriptor: &F,
    nr: IoctlNr,
    arg: c_ulong,
) -> c_int {
    libc::ioctl(descriptor.as_raw_descriptor(), nr, arg)
}

/// Runs an ioctl with an immutable reference.
///
/// # Safety
/// The caller must ensure the ioctl is valid for the descriptor and only
/// reads from the pointed-to data.
pub unsafe fn ioctl_with_ref<F: AsRawDescriptor, T>(descriptor: &F, nr: IoctlNr, arg: &T) -> c_int {
    libc::ioctl(
        descriptor.as_raw_descriptor(),
        nr,
        arg as *const T as *const c_void,
    )
}

/// Runs an ioctl with a mutable reference.
///
/// # Safety
/// The caller must ensure the ioctl is valid for the descriptor and the
/// kernel's writes stay within `T`.
pub unsafe fn ioctl_with_mut_ref<F: AsRawDescriptor, T>(
    descriptor: &F,
    nr: IoctlNr,
    arg: &mut T,
) -> c_int {
    libc::ioctl(
        descriptor.as_raw_descriptor(),
        nr,
        arg as *mut T as *mut c_void,
    )
}

/// Runs an ioctl with a raw pointer.
///
/// # Safety
/// The caller must ensure the ioctl is valid for the descriptor and the
/// pointer is valid for the access the kernel performs.
pub unsafe fn ioctl_with_ptr<F: AsRawDescriptor, T>(
    descriptor: &F,
    nr: IoctlNr,
    arg: *const T,
) -> c_int {
    libc::ioctl(descriptor.as_raw_descriptor(), nr, arg as *const c_void)
}

#[cfg(test)]
mod tests {
    ioctl_io_nr!(KVMIO_TEST, 0xAE, 0x01);
    ioctl_iow_nr!(KVMIO_TEST_W, 0xAE, 0x46, u64);

    #[test]
    fn ioctl_numbers_match_kernel_encoding() {
        assert_eq!(KVMIO_TEST, 0xAE01);
        // _IOW(KVMIO, 0x46, u64) == 0x4008AE46
        assert_eq!(KVMIO_TEST_W, 0x4008_AE46);
    }
}
