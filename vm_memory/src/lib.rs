// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Types for tracking and translating the guest's physical address space.

mod guest_address;
mod guest_memory;
mod volatile_slice;

pub use crate::guest_address::GuestAddress;
pub use crate::guest_memory::Error as GuestMemoryError;
pub use crate::guest_memory::GuestMemory;
pub use crate::guest_memory::MemoryRegion;
pub use crate::guest_memory::MemoryType;
pub use crate::guest_memory::Result;
pub use crate::volatile_slice::VolatileSlice;

/// Start of the 32-bit PCI hole carved out of guest RAM.
pub const MEM_32BIT_GAP_START: u64 = 3 << 30;
/// Size of the PCI hole; RAM above it resumes at 4 GiB.
pub const MEM_32BIT_GAP_SIZE: u64 = 1 << 30;
/// First address past the hole.
pub const FIRST_ADDR_PAST_32BITS: u64 = 4 << 30;
