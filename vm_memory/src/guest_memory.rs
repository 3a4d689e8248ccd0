// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Read;
use std::sync::Arc;

use base::MemoryMapping;
use remain::sorted;
use resources::AddressRange;
use resources::RangeMap;
use thiserror::Error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::GuestAddress;
use crate::VolatileSlice;
use crate::FIRST_ADDR_PAST_32BITS;
use crate::MEM_32BIT_GAP_SIZE;
use crate::MEM_32BIT_GAP_START;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid guest address {0}")]
    InvalidGuestAddress(GuestAddress),
    #[error("failed to map guest memory: {0}")]
    MemoryMappingFailed(base::mmap::Error),
    #[error("guest regions overlap: {0}")]
    MemoryRegionOverlap(resources::Error),
    #[error("access at {0} of {1:#x} bytes crosses the region boundary")]
    OutOfRegionBounds(GuestAddress, u64),
    #[error("failed reading image into guest memory: {0}")]
    ReadToMemory(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a region of guest physical address space holds. Only RAM regions
/// are backed here; the others exist so callers can describe holes and
/// firmware windows uniformly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryType {
    Ram,
    Device,
    Reserved,
    ReadOnly,
}

/// A contiguous `[guest_base, guest_base + size)` range of guest physical
/// memory and where it lives inside the backing host mapping.
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    pub guest_base: GuestAddress,
    pub size: u64,
    /// Byte offset of this region within the backing mapping.
    pub mapping_offset: u64,
    pub type_: MemoryType,
}

struct GuestMemoryInner {
    mapping: MemoryMapping,
    regions: RangeMap<MemoryRegion>,
}

/// The guest's RAM: one host mapping carved into registered regions.
///
/// Cheap to clone; clones share the same backing. The region table is
/// immutable after construction, so translation needs no locking.
#[derive(Clone)]
pub struct GuestMemory {
    inner: Arc<GuestMemoryInner>,
}

impl GuestMemory {
    /// Builds guest RAM from explicit `(guest address, size, mapping
    /// offset)` banks over a single anonymous mapping of `mapping_size`
    /// bytes. Banks must not overlap.
    pub fn new(mapping_size: u64, banks: &[(GuestAddress, u64, u64)]) -> Result<GuestMemory> {
        let mapping =
            MemoryMapping::new(mapping_size as usize).map_err(Error::MemoryMappingFailed)?;
        let mut regions = RangeMap::new();
        for &(guest_base, size, mapping_offset) in banks {
            let range = AddressRange::from_start_and_len(guest_base.offset(), size)
                .ok_or(Error::InvalidGuestAddress(guest_base))?;
            regions
                .insert(
                    range,
                    MemoryRegion {
                        guest_base,
                        size,
                        mapping_offset,
                        type_: MemoryType::Ram,
                    },
                )
                .map_err(Error::MemoryRegionOverlap)?;
        }
        Ok(GuestMemory {
            inner: Arc::new(GuestMemoryInner { mapping, regions }),
        })
    }

    /// Builds the x86 layout for `ram_size` bytes of guest RAM.
    ///
    /// Below the start of the PCI hole this is a single bank. Above it,
    /// the mapping grows by the hole size, the hole window loses all
    /// access, and RAM is split into `[0, 3G)` and `[4G, 4G + rest)`.
    pub fn x86_layout(ram_size: u64) -> Result<GuestMemory> {
        let mem = if ram_size <= MEM_32BIT_GAP_START {
            GuestMemory::new(ram_size, &[(GuestAddress(0), ram_size, 0)])?
        } else {
            let mem = GuestMemory::new(
                ram_size + MEM_32BIT_GAP_SIZE,
                &[
                    (GuestAddress(0), MEM_32BIT_GAP_START, 0),
                    (
                        GuestAddress(FIRST_ADDR_PAST_32BITS),
                        ram_size - MEM_32BIT_GAP_START,
                        FIRST_ADDR_PAST_32BITS,
                    ),
                ],
            )?;
            mem.inner
                .mapping
                .protect_none(MEM_32BIT_GAP_START as usize, MEM_32BIT_GAP_SIZE as usize)
                .map_err(Error::MemoryMappingFailed)?;
            mem
        };
        mem.inner
            .mapping
            .advise_mergeable()
            .map_err(Error::MemoryMappingFailed)?;
        Ok(mem)
    }

    /// Iterates the registered regions in ascending guest address order.
    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.inner.regions.iter().map(|(_, region)| region)
    }

    /// Total bytes of registered guest RAM.
    pub fn memory_size(&self) -> u64 {
        self.regions().map(|r| r.size).sum()
    }

    /// Returns the address one past the highest registered byte.
    pub fn end_addr(&self) -> GuestAddress {
        self.regions()
            .last()
            .map(|r| r.guest_base.unchecked_add(r.size))
            .unwrap_or(GuestAddress(0))
    }

    /// Returns whether `addr` falls inside a registered region.
    pub fn address_in_range(&self, addr: GuestAddress) -> bool {
        self.inner.regions.find(addr.offset()).is_some()
    }

    /// Returns the host virtual address of `addr`.
    ///
    /// The translation is `region.host_base + (addr - region.guest_base)`;
    /// unmapped addresses report `InvalidGuestAddress`.
    pub fn get_host_address(&self, addr: GuestAddress) -> Result<*mut u8> {
        let slice = self.get_slice(addr, 1)?;
        Ok(slice.as_mut_ptr())
    }

    /// Returns a bounded view of `[addr, addr + len)`, which must lie
    /// within a single region.
    pub fn get_slice(&self, addr: GuestAddress, len: u64) -> Result<VolatileSlice> {
        let (_, region) = self
            .inner
            .regions
            .find(addr.offset())
            .ok_or(Error::InvalidGuestAddress(addr))?;
        let offset_in_region = addr.offset() - region.guest_base.offset();
        if offset_in_region
            .checked_add(len)
            .map_or(true, |end| end > region.size)
        {
            return Err(Error::OutOfRegionBounds(addr, len));
        }
        let mapping_offset = (region.mapping_offset + offset_in_region) as usize;
        // Safe because the range was checked against the region, regions
        // were checked against the mapping at construction, and the
        // mapping lives as long as `self`.
        Ok(unsafe {
            VolatileSlice::from_raw_parts(
                self.inner.mapping.as_ptr().add(mapping_offset),
                len as usize,
            )
        })
    }

    /// Reads an object from guest memory at `addr`.
    pub fn read_obj_from_addr<T: FromBytes>(&self, addr: GuestAddress) -> Result<T> {
        let slice = self.get_slice(addr, std::mem::size_of::<T>() as u64)?;
        let mut obj = std::mem::MaybeUninit::<T>::zeroed();
        // Safe because T is FromBytes and the slice covers size_of::<T>().
        unsafe {
            std::ptr::copy_nonoverlapping(
                slice.as_mut_ptr(),
                obj.as_mut_ptr() as *mut u8,
                std::mem::size_of::<T>(),
            );
            Ok(obj.assume_init())
        }
    }

    /// Writes an object into guest memory at `addr`.
    pub fn write_obj_at_addr<T: AsBytes>(&self, val: T, addr: GuestAddress) -> Result<()> {
        self.write_all_at_addr(val.as_bytes(), addr)
    }

    /// Writes all of `buf` into guest memory at `addr`.
    pub fn write_all_at_addr(&self, buf: &[u8], addr: GuestAddress) -> Result<()> {
        let slice = self.get_slice(addr, buf.len() as u64)?;
        slice.copy_from_slice(buf);
        Ok(())
    }

    /// Reads `buf.len()` bytes from guest memory at `addr`.
    pub fn read_exact_at_addr(&self, buf: &mut [u8], addr: GuestAddress) -> Result<()> {
        let slice = self.get_slice(addr, buf.len() as u64)?;
        slice.copy_to_slice(buf);
        Ok(())
    }

    /// Zero-fills `[addr, addr + len)`.
    pub fn write_zeroes_at_addr(&self, addr: GuestAddress, len: u64) -> Result<()> {
        self.get_slice(addr, len)?.write_bytes(0);
        Ok(())
    }

    /// Reads exactly `count` bytes from `src` into guest memory starting
    /// at `addr`. Used to load kernel and firmware images.
    pub fn read_to_memory<R: Read>(
        &self,
        addr: GuestAddress,
        src: &mut R,
        count: usize,
    ) -> Result<()> {
        let slice = self.get_slice(addr, count as u64)?;
        let mut offset = 0;
        let mut chunk = [0u8; 65536];
        while offset < count {
            let want = std::cmp::min(chunk.len(), count - offset);
            let got = src.read(&mut chunk[..want]).map_err(Error::ReadToMemory)?;
            if got == 0 {
                return Err(Error::ReadToMemory(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
            slice
                .sub_slice(offset, got)
                .expect("bounded by count")
                .copy_from_slice(&chunk[..got]);
            offset += got;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_within_region() {
        let mem = GuestMemory::x86_layout(8 << 20).unwrap();
        let base = mem.get_host_address(GuestAddress(0)).unwrap();
        let at_1m = mem.get_host_address(GuestAddress(1 << 20)).unwrap();
        assert_eq!(at_1m as usize - base as usize, 1 << 20);
    }

    #[test]
    fn unmapped_address_fails() {
        let mem = GuestMemory::x86_layout(8 << 20).unwrap();
        assert!(mem.get_host_address(GuestAddress(8 << 20)).is_err());
        assert!(!mem.address_in_range(GuestAddress(9 << 20)));
    }

    #[test]
    fn small_ram_is_single_bank() {
        let mem = GuestMemory::x86_layout(128 << 20).unwrap();
        let regions: Vec<_> = mem.regions().collect();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].guest_base, GuestAddress(0));
        assert_eq!(regions[0].size, 128 << 20);
        assert_eq!(mem.memory_size(), 128 << 20);
    }

    #[test]
    fn large_ram_splits_around_pci_hole() {
        let ram_size = 6u64 << 30;
        let mem = GuestMemory::x86_layout(ram_size).unwrap();
        let regions: Vec<_> = mem.regions().collect();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].guest_base, GuestAddress(0));
        assert_eq!(regions[0].size, MEM_32BIT_GAP_START);
        assert_eq!(regions[1].guest_base, GuestAddress(FIRST_ADDR_PAST_32BITS));
        assert_eq!(regions[1].size, ram_size - MEM_32BIT_GAP_START);
        // Nothing is mapped in the hole itself.
        assert!(!mem.address_in_range(GuestAddress(MEM_32BIT_GAP_START)));
        assert!(!mem.address_in_range(GuestAddress(FIRST_ADDR_PAST_32BITS - 1)));
        // The high bank translates to past-the-hole file offsets.
        let lo = mem.get_host_address(GuestAddress(0)).unwrap();
        let hi = mem
            .get_host_address(GuestAddress(FIRST_ADDR_PAST_32BITS))
            .unwrap();
        assert_eq!(hi as usize - lo as usize, FIRST_ADDR_PAST_32BITS as usize);
    }

    #[test]
    fn obj_roundtrip() {
        let mem = GuestMemory::x86_layout(4 << 20).unwrap();
        mem.write_obj_at_addr(0xdead_beef_u32, GuestAddress(0x1000))
            .unwrap();
        let val: u32 = mem.read_obj_from_addr(GuestAddress(0x1000)).unwrap();
        assert_eq!(val, 0xdead_beef);
    }

    #[test]
    fn cross_region_access_rejected() {
        let mem = GuestMemory::x86_layout(4 << 20).unwrap();
        assert!(mem.get_slice(GuestAddress((4 << 20) - 4), 8).is_err());
    }
}
