// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Represents an address in the guest's physical address space.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct GuestAddress(pub u64);

impl GuestAddress {
    /// Builds the flat address for a real-mode `segment:offset` pair.
    pub fn from_real_mode(segment: u16, offset: u16) -> GuestAddress {
        GuestAddress(((segment as u64) << 4) + offset as u64)
    }

    /// Returns the offset from this address to `other`, or `None` if
    /// `other` is below this address.
    pub fn offset_from(self, other: GuestAddress) -> Option<u64> {
        self.0.checked_sub(other.0)
    }

    /// Gets the raw value of this address.
    pub fn offset(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: u64) -> Option<GuestAddress> {
        self.0.checked_add(other).map(GuestAddress)
    }

    /// Adds `other` to this address, panicking on overflow. For use with
    /// layout constants that cannot overflow.
    pub fn unchecked_add(self, other: u64) -> GuestAddress {
        GuestAddress(self.0 + other)
    }
}

impl fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_mode_compose() {
        assert_eq!(GuestAddress::from_real_mode(0x1000, 0x0), GuestAddress(0x10000));
        assert_eq!(
            GuestAddress::from_real_mode(0xf000, 0xfff0),
            GuestAddress(0xffff0)
        );
    }

    #[test]
    fn offset_from() {
        assert_eq!(GuestAddress(0x110).offset_from(GuestAddress(0x100)), Some(0x10));
        assert_eq!(GuestAddress(0x100).offset_from(GuestAddress(0x110)), None);
    }
}
