// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use serde::Deserialize;
use serde::Serialize;

/// A half-open range of addresses `[start, end)`.
///
/// Ordered by `start` first, which gives the lowest-`start` interval on
/// ties when searching an ordered container.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    /// Creates the range `[start, start + len)`. Returns `None` for a zero
    /// length or on overflow, both of which make an I/O op invalid.
    pub fn from_start_and_len(start: u64, len: u64) -> Option<AddressRange> {
        if len == 0 {
            return None;
        }
        start.checked_add(len).map(|end| AddressRange { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Returns whether `addr` falls within the range.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Returns whether any address is in both `self` and `other`.
    pub fn overlaps(&self, other: AddressRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_half_open() {
        let r = AddressRange::from_start_and_len(0x100, 0x10).unwrap();
        assert!(r.contains(0x100));
        assert!(r.contains(0x10f));
        assert!(!r.contains(0x110));
        assert!(!r.contains(0xff));
    }

    #[test]
    fn zero_len_and_overflow_rejected() {
        assert_eq!(AddressRange::from_start_and_len(0x100, 0), None);
        assert_eq!(AddressRange::from_start_and_len(u64::MAX, 2), None);
    }

    #[test]
    fn overlap_cases() {
        let r = AddressRange::from_start_and_len(0x100, 0x100).unwrap();
        assert!(r.overlaps(AddressRange::from_start_and_len(0x1ff, 1).unwrap()));
        assert!(r.overlaps(AddressRange::from_start_and_len(0x0, 0x101).unwrap()));
        assert!(!r.overlaps(AddressRange::from_start_and_len(0x200, 1).unwrap()));
        assert!(!r.overlaps(AddressRange::from_start_and_len(0x0, 0x100).unwrap()));
    }
}
