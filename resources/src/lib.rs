// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Manages address intervals and allocations for the VM: the half-open
//! `AddressRange` key type, the `RangeMap` ordered interval container the
//! I/O registries and the memory map are built on, and simple bump
//! allocators for PCI BAR blocks.

mod address_allocator;
mod address_range;
mod range_map;

pub use crate::address_allocator::AddressAllocator;
pub use crate::address_range::AddressRange;
pub use crate::range_map::RangeMap;

use remain::sorted;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("allocation of size {0:#x} would exhaust the pool")]
    ExhaustedPool(u64),
    #[error("address range is empty")]
    InvalidRange,
    #[error("range [{0:#x}, {1:#x}) overlaps an existing entry")]
    Overlap(u64, u64),
}

pub type Result<T> = std::result::Result<T, Error>;
