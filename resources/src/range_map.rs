// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;

use crate::AddressRange;
use crate::Error;
use crate::Result;

/// An ordered map from disjoint half-open address ranges to values.
///
/// The map owns its values; callers hold the `AddressRange` key as the
/// handle for an entry. Lookups by point or by range return the entry with
/// the lowest start among candidates, and insertion rejects any overlap
/// with an existing entry. All lookups are O(log n) on the underlying
/// B-tree.
#[derive(Debug, Default)]
pub struct RangeMap<V> {
    entries: BTreeMap<AddressRange, V>,
}

impl<V> RangeMap<V> {
    pub fn new() -> RangeMap<V> {
        RangeMap {
            entries: BTreeMap::new(),
        }
    }

    /// Inserts `value` under `range`, failing if `range` is empty or
    /// overlaps any existing entry.
    pub fn insert(&mut self, range: AddressRange, value: V) -> Result<()> {
        if range.is_empty() {
            return Err(Error::InvalidRange);
        }
        if let Some((overlap, _)) = self.find_range(range) {
            return Err(Error::Overlap(overlap.start, overlap.end));
        }
        self.entries.insert(range, value);
        Ok(())
    }

    /// Removes and returns the entry whose range contains `addr`.
    pub fn remove(&mut self, addr: u64) -> Option<(AddressRange, V)> {
        let range = *self.find(addr)?.0;
        self.entries.remove(&range).map(|v| (range, v))
    }

    /// Finds the entry whose range contains the point `addr`.
    pub fn find(&self, addr: u64) -> Option<(&AddressRange, &V)> {
        // Candidate ranges start at or below `addr`; the closest one below
        // is the only one that can contain the point since entries are
        // disjoint.
        self.entries
            .range(
                ..=AddressRange {
                    start: addr,
                    end: u64::MAX,
                },
            )
            .next_back()
            .filter(|(range, _)| range.contains(addr))
    }

    /// Finds the lowest entry overlapping any part of `range`.
    pub fn find_range(&self, range: AddressRange) -> Option<(&AddressRange, &V)> {
        if range.is_empty() {
            return None;
        }
        // An overlapping entry either contains range.start or begins
        // inside [range.start, range.end).
        if let Some(hit) = self.find(range.start) {
            return Some(hit);
        }
        self.entries
            .range(
                AddressRange {
                    start: range.start,
                    end: 0,
                }..AddressRange {
                    start: range.end,
                    end: 0,
                },
            )
            .next()
    }

    /// Iterates entries in ascending range order.
    pub fn iter(&self) -> impl Iterator<Item = (&AddressRange, &V)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry, yielding them in ascending order. Teardown
    /// safe: values are dropped one by one as the iterator advances.
    pub fn drain(&mut self) -> impl Iterator<Item = (AddressRange, V)> {
        std::mem::take(&mut self.entries).into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, len: u64) -> AddressRange {
        AddressRange::from_start_and_len(start, len).unwrap()
    }

    #[test]
    fn insert_and_point_lookup() {
        let mut map = RangeMap::new();
        map.insert(range(0x1000, 0x100), "a").unwrap();
        map.insert(range(0x2000, 0x100), "b").unwrap();
        assert_eq!(map.find(0x1000).unwrap().1, &"a");
        assert_eq!(map.find(0x10ff).unwrap().1, &"a");
        assert!(map.find(0x1100).is_none());
        assert_eq!(map.find(0x2050).unwrap().1, &"b");
    }

    #[test]
    fn insert_rejects_overlap() {
        let mut map = RangeMap::new();
        map.insert(range(0x1000, 0x100), ()).unwrap();
        assert_eq!(
            map.insert(range(0x10ff, 0x10), ()),
            Err(Error::Overlap(0x1000, 0x1100))
        );
        assert_eq!(
            map.insert(range(0xf00, 0x101), ()),
            Err(Error::Overlap(0x1000, 0x1100))
        );
        // Adjacent ranges are fine.
        map.insert(range(0x1100, 0x100), ()).unwrap();
        map.insert(range(0xf00, 0x100), ()).unwrap();
    }

    #[test]
    fn range_lookup_returns_lowest() {
        let mut map = RangeMap::new();
        map.insert(range(0x1000, 0x100), "lo").unwrap();
        map.insert(range(0x1200, 0x100), "hi").unwrap();
        // A probe spanning both should return the lower entry.
        let (r, v) = map.find_range(range(0x10f0, 0x200)).unwrap();
        assert_eq!(r.start, 0x1000);
        assert_eq!(v, &"lo");
        // A probe strictly between the two misses.
        assert!(map.find_range(range(0x1100, 0x100)).is_none());
    }

    #[test]
    fn remove_then_miss() {
        let mut map = RangeMap::new();
        map.insert(range(0x1000, 0x100), 7).unwrap();
        let (r, v) = map.remove(0x1080).unwrap();
        assert_eq!((r.start, v), (0x1000, 7));
        assert!(map.find(0x1000).is_none());
        assert!(map.remove(0x1000).is_none());
    }

    #[test]
    fn drain_is_ordered() {
        let mut map = RangeMap::new();
        map.insert(range(0x3000, 0x10), 3).unwrap();
        map.insert(range(0x1000, 0x10), 1).unwrap();
        map.insert(range(0x2000, 0x10), 2).unwrap();
        let order: Vec<i32> = map.drain().map(|(_, v)| v).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(map.is_empty());
    }
}
