// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::num::Wrapping;
use std::sync::atomic::fence;
use std::sync::atomic::Ordering;

use base::error;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use vm_memory::VolatileSlice;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use super::VIRTIO_RING_F_EVENT_IDX;
use super::VIRTIO_RING_F_INDIRECT_DESC;

const VIRTQ_DESC_F_NEXT: u16 = 0x1;
const VIRTQ_DESC_F_WRITE: u16 = 0x2;
const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 0x1;

/// Legacy transports locate the whole ring from one page frame number.
pub const QUEUE_PFN_SHIFT: u32 = 12;
const QUEUE_ALIGN: u64 = 4096;

/// One descriptor table entry, as laid out in guest memory.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
struct Desc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

const DESC_SIZE: u64 = std::mem::size_of::<Desc>() as u64;

/// A guest-supplied buffer chain, flattened into its device-readable and
/// device-writable parts. Indirect chains are already inlined.
pub struct DescriptorChain<'a> {
    pub head_index: u16,
    pub readable: Vec<VolatileSlice<'a>>,
    pub writable: Vec<VolatileSlice<'a>>,
}

impl<'a> DescriptorChain<'a> {
    pub fn readable_bytes(&self) -> u64 {
        self.readable.iter().map(|s| s.size() as u64).sum()
    }

    pub fn writable_bytes(&self) -> u64 {
        self.writable.iter().map(|s| s.size() as u64).sum()
    }
}

/// A virtqueue over the legacy split-ring layout.
///
/// All ring accesses go through `GuestMemory` with explicit fences at the
/// producer/consumer edges; field values are used in native byte order,
/// which matches the guest on this little-endian-only monitor.
#[derive(Clone)]
pub struct Queue {
    max_size: u16,
    size: u16,
    pfn: u32,
    ready: bool,
    use_event_idx: bool,
    use_indirect: bool,
    desc_table: GuestAddress,
    avail_ring: GuestAddress,
    used_ring: GuestAddress,
    next_avail: Wrapping<u16>,
    last_used_signalled: Wrapping<u16>,
}

impl Queue {
    pub fn new(max_size: u16) -> Queue {
        assert!(max_size.is_power_of_two());
        Queue {
            max_size,
            size: max_size,
            pfn: 0,
            ready: false,
            use_event_idx: false,
            use_indirect: false,
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            next_avail: Wrapping(0),
            last_used_signalled: Wrapping(0),
        }
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn pfn(&self) -> u32 {
        self.pfn
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Locates the ring at `pfn << 12` using the legacy fixed layout:
    /// descriptor table, then the available ring, then the used ring
    /// aligned up to the ring alignment.
    pub fn activate(&mut self, pfn: u32, acked_features: u64) {
        let base = (pfn as u64) << QUEUE_PFN_SHIFT;
        let num = self.size as u64;
        let desc_table = base;
        let avail_ring = base + num * DESC_SIZE;
        // flags + idx + ring[num] + used_event
        let avail_end = avail_ring + 4 + num * 2 + 2;
        let used_ring = (avail_end + QUEUE_ALIGN - 1) & !(QUEUE_ALIGN - 1);

        self.pfn = pfn;
        self.desc_table = GuestAddress(desc_table);
        self.avail_ring = GuestAddress(avail_ring);
        self.used_ring = GuestAddress(used_ring);
        self.next_avail = Wrapping(0);
        self.last_used_signalled = Wrapping(0);
        self.use_event_idx = acked_features & (1 << VIRTIO_RING_F_EVENT_IDX) != 0;
        self.use_indirect = acked_features & (1 << VIRTIO_RING_F_INDIRECT_DESC) != 0;
        self.ready = true;
    }

    /// Forgets the ring location; the queue must be activated again
    /// before use.
    pub fn reset(&mut self) {
        *self = Queue::new(self.max_size);
    }

    fn avail_idx(&self, mem: &GuestMemory) -> Wrapping<u16> {
        // avail.idx lives after the 16-bit flags field.
        Wrapping(
            mem.read_obj_from_addr(self.avail_ring.unchecked_add(2))
                .unwrap_or(0),
        )
    }

    fn avail_flags(&self, mem: &GuestMemory) -> u16 {
        mem.read_obj_from_addr(self.avail_ring).unwrap_or(0)
    }

    fn used_idx(&self, mem: &GuestMemory) -> Wrapping<u16> {
        Wrapping(
            mem.read_obj_from_addr(self.used_ring.unchecked_add(2))
                .unwrap_or(0),
        )
    }

    fn set_used_idx(&self, mem: &GuestMemory, idx: u16) {
        let _ = mem.write_obj_at_addr(idx, self.used_ring.unchecked_add(2));
    }

    /// `used_event` is the trailing u16 of the available ring.
    fn used_event(&self, mem: &GuestMemory) -> Wrapping<u16> {
        let addr = self.avail_ring.unchecked_add(4 + self.size as u64 * 2);
        Wrapping(mem.read_obj_from_addr(addr).unwrap_or(0))
    }

    /// `avail_event` is the trailing u16 of the used ring; publishing our
    /// next read position lets the driver skip doorbell writes.
    fn set_avail_event(&self, mem: &GuestMemory, idx: u16) {
        let addr = self.used_ring.unchecked_add(4 + self.size as u64 * 8);
        let _ = mem.write_obj_at_addr(idx, addr);
    }

    /// Whether the guest has published descriptors we have not consumed.
    fn available(&self, mem: &GuestMemory) -> bool {
        if !self.ready {
            return false;
        }
        if self.use_event_idx {
            self.set_avail_event(mem, self.next_avail.0);
            // The driver re-reads avail_event after bumping avail.idx;
            // order our publication against the idx read below.
            fence(Ordering::SeqCst);
        }
        self.avail_idx(mem) != self.next_avail
    }

    /// Takes the next available descriptor chain, flattened.
    pub fn pop<'a>(&mut self, mem: &'a GuestMemory) -> Option<DescriptorChain<'a>> {
        if !self.available(mem) {
            return None;
        }
        // Pair with the guest's write of the ring entry before avail.idx.
        fence(Ordering::Acquire);

        let slot = self.next_avail.0 % self.size;
        let head: u16 = mem
            .read_obj_from_addr(self.avail_ring.unchecked_add(4 + slot as u64 * 2))
            .ok()?;
        self.next_avail += Wrapping(1);

        match self.walk_chain(mem, head) {
            Some(chain) => Some(chain),
            None => {
                error!("virtqueue: dropping malformed descriptor chain at head {}", head);
                None
            }
        }
    }

    fn read_desc(&self, mem: &GuestMemory, table: GuestAddress, index: u16) -> Option<Desc> {
        mem.read_obj_from_addr(table.unchecked_add(index as u64 * DESC_SIZE))
            .ok()
    }

    /// Walks the chain starting at `head`, inlining an indirect table if
    /// the head descriptor carries one, and bounding the walk by the
    /// table size so a cyclic chain cannot wedge the device.
    fn walk_chain<'a>(&self, mem: &'a GuestMemory, head: u16) -> Option<DescriptorChain<'a>> {
        let mut table = self.desc_table;
        let mut max = self.size;
        let mut index = head;

        if head >= self.size {
            return None;
        }

        let first = self.read_desc(mem, table, index)?;
        if self.use_indirect && first.flags & VIRTQ_DESC_F_INDIRECT != 0 {
            max = (first.len / DESC_SIZE as u32) as u16;
            table = GuestAddress(first.addr);
            index = 0;
            if max == 0 {
                return None;
            }
        }

        let mut chain = DescriptorChain {
            head_index: head,
            readable: Vec::new(),
            writable: Vec::new(),
        };
        let mut remaining = max;
        loop {
            if index >= max || remaining == 0 {
                return None;
            }
            remaining -= 1;
            let desc = self.read_desc(mem, table, index)?;
            let slice = mem.get_slice(GuestAddress(desc.addr), desc.len as u64).ok()?;
            if desc.flags & VIRTQ_DESC_F_WRITE != 0 {
                chain.writable.push(slice);
            } else {
                chain.readable.push(slice);
            }
            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            index = desc.next;
        }
        Some(chain)
    }

    /// Publishes a completed chain: stores the used element, then makes
    /// it visible by advancing `used.idx` behind a write barrier.
    pub fn add_used(&mut self, mem: &GuestMemory, head: u16, len: u32) {
        if head >= self.size {
            error!("virtqueue: used element id {} out of range", head);
            return;
        }
        let idx = self.used_idx(mem);
        let slot = idx.0 % self.size;
        let elem_addr = self.used_ring.unchecked_add(4 + slot as u64 * 8);
        let _ = mem.write_obj_at_addr(head as u32, elem_addr);
        let _ = mem.write_obj_at_addr(len, elem_addr.unchecked_add(4));
        // The element must be in place before the index moves.
        fence(Ordering::Release);
        self.set_used_idx(mem, (idx + Wrapping(1)).0);
    }

    /// Decides whether this completion round needs a guest interrupt.
    ///
    /// With EVENT_IDX the guest publishes the used index it wants to be
    /// woken at; otherwise the `NO_INTERRUPT` hint in the available
    /// ring's flags is honored.
    pub fn should_signal(&mut self, mem: &GuestMemory) -> bool {
        // Make sure the used.idx store is visible before the guest's
        // event-index value is sampled.
        fence(Ordering::SeqCst);

        if !self.use_event_idx {
            return self.avail_flags(mem) & VIRTQ_AVAIL_F_NO_INTERRUPT == 0;
        }

        let old = self.last_used_signalled;
        let new = self.used_idx(mem);
        let event = self.used_event(mem);
        if vring_need_event(event, new, old) {
            self.last_used_signalled = new;
            true
        } else {
            false
        }
    }
}

/// The event-index decision: signal only if `new` is the first index past
/// `event` since `old`, in modular u16 arithmetic.
fn vring_need_event(event: Wrapping<u16>, new: Wrapping<u16>, old: Wrapping<u16>) -> bool {
    (new - event - Wrapping(1)).0 < (new - old).0
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE_SIZE: u16 = 16;
    const RING_PFN: u32 = 0x10;

    /// Builds guest memory holding an empty ring at RING_PFN.
    fn ring_mem() -> GuestMemory {
        GuestMemory::x86_layout(1 << 20).unwrap()
    }

    struct GuestRing<'a> {
        mem: &'a GuestMemory,
        queue: Queue,
    }

    impl<'a> GuestRing<'a> {
        fn new(mem: &'a GuestMemory, features: u64) -> GuestRing<'a> {
            let mut queue = Queue::new(QUEUE_SIZE);
            queue.activate(RING_PFN, features);
            GuestRing { mem, queue }
        }

        fn base(&self) -> u64 {
            (RING_PFN as u64) << QUEUE_PFN_SHIFT
        }

        fn write_desc(&self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
            let desc = Desc {
                addr,
                len,
                flags,
                next,
            };
            self.mem
                .write_obj_at_addr(desc, GuestAddress(self.base() + index as u64 * 16))
                .unwrap();
        }

        fn publish_avail(&self, slot_entries: &[u16]) {
            let avail = self.base() + QUEUE_SIZE as u64 * 16;
            for (i, head) in slot_entries.iter().enumerate() {
                self.mem
                    .write_obj_at_addr(*head, GuestAddress(avail + 4 + i as u64 * 2))
                    .unwrap();
            }
            self.mem
                .write_obj_at_addr(slot_entries.len() as u16, GuestAddress(avail + 2))
                .unwrap();
        }

        fn set_used_event(&self, value: u16) {
            let avail = self.base() + QUEUE_SIZE as u64 * 16;
            self.mem
                .write_obj_at_addr(value, GuestAddress(avail + 4 + QUEUE_SIZE as u64 * 2))
                .unwrap();
        }

        fn used_idx(&self) -> u16 {
            self.queue.used_idx(self.mem).0
        }
    }

    #[test]
    fn ring_layout_offsets() {
        let mem = ring_mem();
        let ring = GuestRing::new(&mem, 0);
        assert_eq!(ring.queue.desc_table.offset(), 0x10000);
        assert_eq!(ring.queue.avail_ring.offset(), 0x10000 + 256);
        // Used ring is aligned up to the next 4k boundary.
        assert_eq!(ring.queue.used_ring.offset(), 0x11000);
    }

    #[test]
    fn pop_single_chain() {
        let mem = ring_mem();
        let mut ring = GuestRing::new(&mem, 0);
        ring.write_desc(0, 0x30000, 16, VIRTQ_DESC_F_NEXT, 1);
        ring.write_desc(1, 0x31000, 512, VIRTQ_DESC_F_WRITE, 0);
        ring.publish_avail(&[0]);

        let chain = ring.queue.pop(&mem).unwrap();
        assert_eq!(chain.head_index, 0);
        assert_eq!(chain.readable_bytes(), 16);
        assert_eq!(chain.writable_bytes(), 512);
        assert!(ring.queue.pop(&mem).is_none());
    }

    #[test]
    fn indirect_chain_is_inlined() {
        let mem = ring_mem();
        let mut ring = GuestRing::new(&mem, 1 << VIRTIO_RING_F_INDIRECT_DESC);
        // Indirect table with two descriptors at 0x40000.
        let table = 0x40000u64;
        mem.write_obj_at_addr(
            Desc {
                addr: 0x30000,
                len: 16,
                flags: VIRTQ_DESC_F_NEXT,
                next: 1,
            },
            GuestAddress(table),
        )
        .unwrap();
        mem.write_obj_at_addr(
            Desc {
                addr: 0x31000,
                len: 1,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            },
            GuestAddress(table + 16),
        )
        .unwrap();
        ring.write_desc(0, table, 32, VIRTQ_DESC_F_INDIRECT, 0);
        ring.publish_avail(&[0]);

        let chain = ring.queue.pop(&mem).unwrap();
        assert_eq!(chain.readable.len(), 1);
        assert_eq!(chain.writable.len(), 1);
        assert_eq!(chain.readable_bytes(), 16);
        assert_eq!(chain.writable_bytes(), 1);
    }

    #[test]
    fn cyclic_chain_rejected() {
        let mem = ring_mem();
        let mut ring = GuestRing::new(&mem, 0);
        ring.write_desc(0, 0x30000, 16, VIRTQ_DESC_F_NEXT, 1);
        ring.write_desc(1, 0x31000, 16, VIRTQ_DESC_F_NEXT, 0);
        ring.publish_avail(&[0]);
        assert!(ring.queue.pop(&mem).is_none());
    }

    #[test]
    fn add_used_advances_index() {
        let mem = ring_mem();
        let mut ring = GuestRing::new(&mem, 0);
        assert_eq!(ring.used_idx(), 0);
        ring.queue.add_used(&mem, 3, 512);
        assert_eq!(ring.used_idx(), 1);
        // The element landed in slot 0.
        let elem_addr = ring.queue.used_ring.unchecked_add(4);
        let id: u32 = mem.read_obj_from_addr(elem_addr).unwrap();
        let len: u32 = mem.read_obj_from_addr(elem_addr.unchecked_add(4)).unwrap();
        assert_eq!((id, len), (3, 512));
    }

    #[test]
    fn signal_honors_no_interrupt_flag() {
        let mem = ring_mem();
        let mut ring = GuestRing::new(&mem, 0);
        assert!(ring.queue.should_signal(&mem));
        mem.write_obj_at_addr(VIRTQ_AVAIL_F_NO_INTERRUPT, ring.queue.avail_ring)
            .unwrap();
        assert!(!ring.queue.should_signal(&mem));
    }

    #[test]
    fn event_idx_coalesces_interrupts() {
        let mem = ring_mem();
        let mut ring = GuestRing::new(&mem, 1 << VIRTIO_RING_F_EVENT_IDX);
        // Guest asks to be woken when index 5 is used.
        ring.set_used_event(5);
        let mut signals = 0;
        for i in 0..100u32 {
            ring.queue.add_used(&mem, (i % 16) as u16, 1);
            if ring.queue.should_signal(&mem) {
                signals += 1;
            }
        }
        // Exactly one interrupt for the crossing of index 5.
        assert_eq!(signals, 1);
    }

    #[test]
    fn vring_need_event_boundaries() {
        let w = Wrapping::<u16>;
        assert!(vring_need_event(w(0), w(1), w(0)));
        assert!(!vring_need_event(w(1), w(1), w(0)));
        assert!(vring_need_event(w(1), w(2), w(0)));
        // Wraparound.
        assert!(vring_need_event(w(0xffff), w(0), w(0xfffe)));
    }
}
