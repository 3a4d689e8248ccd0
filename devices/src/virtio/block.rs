// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::thread;

use base::error;
use base::info;
use base::warn;
use base::Event;
use base::EventToken;
use base::WaitContext;
use disk::DiskImage;
use vm_memory::GuestMemory;
use vm_memory::VolatileSlice;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use super::copy_config;
use super::DescriptorChain;
use super::Interrupt;
use super::Queue;
use super::VirtioDevice;
use super::TYPE_BLOCK;
use super::VIRTIO_RING_F_EVENT_IDX;
use super::VIRTIO_RING_F_INDIRECT_DESC;

const QUEUE_SIZE: u16 = 256;
const QUEUE_SIZES: &[u16] = &[QUEUE_SIZE];

// Feature bits.
const VIRTIO_BLK_F_SEG_MAX: u32 = 2;
const VIRTIO_BLK_F_RO: u32 = 5;
const VIRTIO_BLK_F_FLUSH: u32 = 9;

// Request types.
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

// Request status bytes.
const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

const VIRTIO_BLK_ID_BYTES: usize = 20;

/// The header and status descriptors take two of the ring's entries.
const SEG_MAX: u32 = QUEUE_SIZE as u32 - 2;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
struct virtio_blk_config {
    capacity: u64,
    size_max: u32,
    seg_max: u32,
    cylinders: u16,
    heads: u8,
    sectors: u8,
    blk_size: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
struct virtio_blk_req_header {
    req_type: u32,
    ioprio: u32,
    sector: u64,
}

/// A virtio block device over a raw disk image.
pub struct Block {
    disk: Option<DiskImage>,
    avail_features: u64,
    config: virtio_blk_config,
    kill_evt: Option<Event>,
    worker_thread: Option<thread::JoinHandle<()>>,
}

impl Block {
    pub fn new(disk: DiskImage) -> Block {
        let mut avail_features = 1u64 << VIRTIO_BLK_F_SEG_MAX
            | 1 << VIRTIO_BLK_F_FLUSH
            | 1 << VIRTIO_RING_F_EVENT_IDX
            | 1 << VIRTIO_RING_F_INDIRECT_DESC;
        if disk.read_only() {
            avail_features |= 1 << VIRTIO_BLK_F_RO;
        }
        let config = virtio_blk_config {
            capacity: disk.sectors(),
            seg_max: SEG_MAX,
            ..Default::default()
        };
        Block {
            disk: Some(disk),
            avail_features,
            config,
            kill_evt: None,
            worker_thread: None,
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(kill_evt) = self.kill_evt.take() {
            let _ = kill_evt.write(1);
        }
        if let Some(worker_thread) = self.worker_thread.take() {
            let _ = worker_thread.join();
        }
    }
}

impl VirtioDevice for Block {
    fn debug_label(&self) -> String {
        "virtio-blk".to_string()
    }

    fn device_type(&self) -> u32 {
        TYPE_BLOCK
    }

    fn queue_max_sizes(&self) -> &[u16] {
        QUEUE_SIZES
    }

    fn features(&self) -> u64 {
        self.avail_features
    }

    fn ack_features(&mut self, value: u64) {
        let unrequested = value & !self.avail_features;
        if unrequested != 0 {
            warn!("virtio-blk: driver acked unoffered features {:#x}", unrequested);
        }
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        copy_config(data, 0, self.config.as_bytes(), offset);
    }

    fn activate(
        &mut self,
        mem: GuestMemory,
        interrupt: Interrupt,
        mut queues: Vec<Queue>,
        mut queue_evts: Vec<Event>,
    ) {
        if queues.len() != 1 || queue_evts.len() != 1 {
            return;
        }
        let disk = match self.disk.take() {
            Some(disk) => disk,
            None => {
                error!("virtio-blk activated twice");
                return;
            }
        };
        let (self_kill_evt, kill_evt) = match Event::new().and_then(|e| Ok((e.try_clone()?, e))) {
            Ok(v) => v,
            Err(e) => {
                error!("virtio-blk: failed to create kill event pair: {}", e);
                return;
            }
        };
        self.kill_evt = Some(self_kill_evt);

        let queue = queues.remove(0);
        let queue_evt = queue_evts.remove(0);
        let worker_result = thread::Builder::new()
            .name("virtio-blk-io".to_string())
            .spawn(move || {
                let mut worker = Worker {
                    mem,
                    disk,
                    queue,
                    interrupt,
                };
                worker.run(queue_evt, kill_evt);
            });
        match worker_result {
            Ok(join_handle) => self.worker_thread = Some(join_handle),
            Err(e) => error!("virtio-blk: failed to spawn worker: {}", e),
        }
    }

    fn reset(&mut self) -> bool {
        if let Some(kill_evt) = self.kill_evt.take() {
            let _ = kill_evt.write(1);
        }
        if let Some(worker_thread) = self.worker_thread.take() {
            let _ = worker_thread.join();
        }
        // The disk stays with the worker once activated; a reset after
        // activation leaves the device inert until the VM restarts.
        info!("virtio-blk reset");
        true
    }
}

struct Worker {
    mem: GuestMemory,
    disk: DiskImage,
    queue: Queue,
    interrupt: Interrupt,
}

impl Worker {
    fn run(&mut self, queue_evt: Event, kill_evt: Event) {
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        enum Token {
            QueueAvailable,
            Kill,
        }

        impl EventToken for Token {
            fn as_raw_token(&self) -> u64 {
                match self {
                    Token::QueueAvailable => 0,
                    Token::Kill => 1,
                }
            }

            fn from_raw_token(data: u64) -> Self {
                match data {
                    0 => Token::QueueAvailable,
                    _ => Token::Kill,
                }
            }
        }

        let wait_ctx: WaitContext<Token> = match WaitContext::build_with(&[
            (&queue_evt, Token::QueueAvailable),
            (&kill_evt, Token::Kill),
        ]) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("virtio-blk: failed to build wait context: {}", e);
                return;
            }
        };

        'poll: loop {
            let events = match wait_ctx.wait() {
                Ok(events) => events,
                Err(e) => {
                    error!("virtio-blk: failed to wait for events: {}", e);
                    break;
                }
            };
            for event in events.iter().filter(|e| e.is_readable) {
                match event.token {
                    Token::QueueAvailable => {
                        if let Err(e) = queue_evt.read() {
                            error!("virtio-blk: failed to read queue event: {}", e);
                            break 'poll;
                        }
                        self.process_queue();
                    }
                    Token::Kill => break 'poll,
                }
            }
        }
    }

    /// Drains the queue, executing each request and publishing its
    /// completion in descriptor-head order.
    fn process_queue(&mut self) {
        while let Some(chain) = self.queue.pop(&self.mem) {
            let head = chain.head_index;
            let (status, len) = execute_request(&self.disk, &chain);
            if let Some(status_byte) = status_slice(&chain) {
                status_byte.copy_from_slice(&[status]);
            }
            self.queue.add_used(&self.mem, head, len);
            if self.queue.should_signal(&self.mem) {
                self.interrupt.signal_used_queue(0);
            }
        }
    }
}

/// Runs one request against the disk. Returns the status byte and the
/// byte count to publish in the used element.
fn execute_request(disk: &DiskImage, chain: &DescriptorChain) -> (u8, u32) {
    let mut header = virtio_blk_req_header::default();
    if read_from_slices(&chain.readable, 0, header.as_bytes_mut()) != 16 {
        warn!("virtio-blk: request too short for its header");
        return (VIRTIO_BLK_S_IOERR, 0);
    }
    let sector = header.sector;

    match header.req_type {
        VIRTIO_BLK_T_IN => {
            let mut iovecs = data_iovecs(&chain.writable, 0, true);
            match disk.read_vectored_at(&mut iovecs, sector) {
                Ok(len) => (VIRTIO_BLK_S_OK, len as u32),
                Err(e) => {
                    error!("virtio-blk: read at sector {} failed: {}", sector, e);
                    (VIRTIO_BLK_S_IOERR, 0)
                }
            }
        }
        VIRTIO_BLK_T_OUT => {
            let mut iovecs = data_iovecs(&chain.readable, 16, false);
            match disk.write_vectored_at(&mut iovecs, sector) {
                Ok(len) => (VIRTIO_BLK_S_OK, len as u32),
                Err(e) => {
                    error!("virtio-blk: write at sector {} failed: {}", sector, e);
                    (VIRTIO_BLK_S_IOERR, 0)
                }
            }
        }
        VIRTIO_BLK_T_FLUSH => match disk.flush() {
            Ok(()) => (VIRTIO_BLK_S_OK, 0),
            Err(e) => {
                error!("virtio-blk: flush failed: {}", e);
                (VIRTIO_BLK_S_IOERR, 0)
            }
        },
        VIRTIO_BLK_T_GET_ID => {
            let serial = disk.serial(VIRTIO_BLK_ID_BYTES);
            let copied = write_to_slices(&data_slices(&chain.writable, 0, true), &serial);
            (VIRTIO_BLK_S_OK, copied as u32)
        }
        other => {
            warn!("virtio-blk: unsupported request type {}", other);
            (VIRTIO_BLK_S_UNSUPP, 0)
        }
    }
}

/// The final writable byte of the chain carries the request status.
fn status_slice<'a>(chain: &DescriptorChain<'a>) -> Option<VolatileSlice<'a>> {
    for slice in chain.writable.iter().rev() {
        if slice.size() > 0 {
            return slice.sub_slice(slice.size() - 1, 1);
        }
    }
    None
}

/// Copies up to `buf.len()` bytes out of `slices` starting `skip` bytes
/// in, returning the amount copied.
fn read_from_slices(slices: &[VolatileSlice], mut skip: u64, buf: &mut [u8]) -> usize {
    let mut copied = 0;
    for slice in slices {
        let len = slice.size() as u64;
        if skip >= len {
            skip -= len;
            continue;
        }
        let sub = slice
            .sub_slice(skip as usize, (len - skip) as usize)
            .expect("bounds computed above");
        skip = 0;
        copied += sub.copy_to_slice(&mut buf[copied..]);
        if copied == buf.len() {
            break;
        }
    }
    copied
}

/// The data portion of a request: the chain's slices with the 16-byte
/// header skipped on the read side and the trailing status byte dropped
/// on the write side.
fn data_slices<'a>(
    slices: &[VolatileSlice<'a>],
    mut skip: u64,
    drop_status: bool,
) -> Vec<VolatileSlice<'a>> {
    let mut out = Vec::with_capacity(slices.len());
    for slice in slices {
        let len = slice.size() as u64;
        if skip >= len {
            skip -= len;
            continue;
        }
        let sub = slice
            .sub_slice(skip as usize, (len - skip) as usize)
            .expect("bounds computed above");
        skip = 0;
        out.push(sub);
    }
    if drop_status {
        // Trim one byte off the end, skipping empty trailing slices.
        while let Some(last) = out.last().copied() {
            if last.size() == 0 {
                out.pop();
                continue;
            }
            let trimmed = last
                .sub_slice(0, last.size() - 1)
                .expect("shrinking is in bounds");
            *out.last_mut().expect("checked non-empty") = trimmed;
            if trimmed.size() == 0 {
                out.pop();
            }
            break;
        }
    }
    out
}

fn data_iovecs(slices: &[VolatileSlice], skip: u64, drop_status: bool) -> Vec<libc::iovec> {
    data_slices(slices, skip, drop_status)
        .iter()
        .map(|s| s.as_iovec())
        .collect()
}

/// Copies `buf` into `slices`, returning the amount copied.
fn write_to_slices(slices: &[VolatileSlice], buf: &[u8]) -> usize {
    let mut copied = 0;
    for slice in slices {
        copied += slice.copy_from_slice(&buf[copied..]);
        if copied == buf.len() {
            break;
        }
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_disk(len: usize) -> (tempfile::NamedTempFile, DiskImage) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        f.flush().unwrap();
        let disk = DiskImage::open(f.path(), false).unwrap();
        (f, disk)
    }

    #[test]
    fn features_without_readonly() {
        let (_f, disk) = test_disk(1 << 20);
        let b = Block::new(disk);
        let features = b.features();
        assert_ne!(features & (1 << VIRTIO_BLK_F_SEG_MAX), 0);
        assert_ne!(features & (1 << VIRTIO_BLK_F_FLUSH), 0);
        assert_ne!(features & (1 << VIRTIO_RING_F_EVENT_IDX), 0);
        assert_ne!(features & (1 << VIRTIO_RING_F_INDIRECT_DESC), 0);
        assert_eq!(features & (1 << VIRTIO_BLK_F_RO), 0);
    }

    #[test]
    fn config_reports_capacity() {
        let (_f, disk) = test_disk(1 << 20);
        let b = Block::new(disk);
        let mut capacity = [0u8; 8];
        b.read_config(0, &mut capacity);
        assert_eq!(u64::from_le_bytes(capacity), 2048);
        let mut seg_max = [0u8; 4];
        b.read_config(12, &mut seg_max);
        assert_eq!(u32::from_le_bytes(seg_max), SEG_MAX);
    }

    #[test]
    fn config_read_past_end_is_empty() {
        let (_f, disk) = test_disk(4096);
        let b = Block::new(disk);
        let mut data = [0xaau8; 4];
        b.read_config(0x100, &mut data);
        assert_eq!(data, [0xaa; 4]);
    }

    // Guest-side ring driver for the end-to-end request tests below.
    struct RingDriver {
        mem: vm_memory::GuestMemory,
        queue: Queue,
        avail_count: u16,
    }

    const RING_BASE: u64 = 0x10000;
    const DATA_BASE: u64 = 0x30000;

    impl RingDriver {
        fn new() -> RingDriver {
            let mem = vm_memory::GuestMemory::x86_layout(1 << 20).unwrap();
            let mut queue = Queue::new(QUEUE_SIZE);
            queue.activate((RING_BASE >> 12) as u32, 0);
            RingDriver {
                mem,
                queue,
                avail_count: 0,
            }
        }

        fn write_desc(&self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
            #[repr(C)]
            #[derive(AsBytes, FromBytes, FromZeroes)]
            struct Desc {
                addr: u64,
                len: u32,
                flags: u16,
                next: u16,
            }
            self.mem
                .write_obj_at_addr(
                    Desc {
                        addr,
                        len,
                        flags,
                        next,
                    },
                    vm_memory::GuestAddress(RING_BASE + index as u64 * 16),
                )
                .unwrap();
        }

        /// Publishes a three-descriptor request: header, data, status.
        fn submit(&mut self, head: u16, req_type: u32, sector: u64, data_len: u32, write: bool) {
            let header = virtio_blk_req_header {
                req_type,
                ioprio: 0,
                sector,
            };
            let header_addr = DATA_BASE + head as u64 * 0x1000;
            let data_addr = header_addr + 16;
            let status_addr = data_addr + data_len as u64;
            self.mem
                .write_obj_at_addr(header, vm_memory::GuestAddress(header_addr))
                .unwrap();

            let data_flags = if write { 0x2 } else { 0 };
            if data_len > 0 {
                self.write_desc(head, header_addr, 16, 0x1, head + 1);
                self.write_desc(head + 1, data_addr, data_len, 0x1 | data_flags, head + 2);
                self.write_desc(head + 2, status_addr, 1, 0x2, 0);
            } else {
                self.write_desc(head, header_addr, 16, 0x1, head + 1);
                self.write_desc(head + 1, status_addr, 1, 0x2, 0);
            }

            let avail = RING_BASE + QUEUE_SIZE as u64 * 16;
            self.mem
                .write_obj_at_addr(
                    head,
                    vm_memory::GuestAddress(avail + 4 + self.avail_count as u64 * 2),
                )
                .unwrap();
            self.avail_count += 1;
            self.mem
                .write_obj_at_addr(self.avail_count, vm_memory::GuestAddress(avail + 2))
                .unwrap();
        }

        fn status_of(&self, head: u16) -> u8 {
            let data_len: u64 = 512;
            let addr = DATA_BASE + head as u64 * 0x1000 + 16 + data_len;
            self.mem
                .read_obj_from_addr::<u8>(vm_memory::GuestAddress(addr))
                .unwrap()
        }

        fn used_idx(&self) -> u16 {
            // Used ring follows the avail ring at the next page boundary.
            let avail_end = RING_BASE + QUEUE_SIZE as u64 * 16 + 4 + QUEUE_SIZE as u64 * 2 + 2;
            let used = (avail_end + 0xfff) & !0xfff;
            self.mem
                .read_obj_from_addr::<u16>(vm_memory::GuestAddress(used + 2))
                .unwrap()
        }
    }

    #[test]
    fn write_flush_read_smoke() {
        let (_f, disk) = test_disk(1 << 20);
        let mut driver = RingDriver::new();

        // Guest writes a pattern to sector 0.
        let pattern = [0xa5u8; 512];
        driver
            .mem
            .write_all_at_addr(&pattern, vm_memory::GuestAddress(DATA_BASE + 16))
            .unwrap();
        driver.submit(0, VIRTIO_BLK_T_OUT, 0, 512, false);
        driver.submit(4, VIRTIO_BLK_T_FLUSH, 0, 0, false);
        driver.submit(8, VIRTIO_BLK_T_IN, 0, 512, true);

        let mut completions = 0;
        while let Some(chain) = driver.queue.pop(&driver.mem) {
            let head = chain.head_index;
            let (status, len) = execute_request(&disk, &chain);
            if let Some(status_byte) = status_slice(&chain) {
                status_byte.copy_from_slice(&[status]);
            }
            driver.queue.add_used(&driver.mem, head, len);
            completions += 1;
        }
        assert_eq!(completions, 3);
        assert_eq!(driver.used_idx(), 3);
        assert_eq!(driver.status_of(0), VIRTIO_BLK_S_OK);
        assert_eq!(driver.status_of(8), VIRTIO_BLK_S_OK);

        // Readback is byte-identical.
        let mut readback = [0u8; 512];
        driver
            .mem
            .read_exact_at_addr(&mut readback, vm_memory::GuestAddress(DATA_BASE + 8 * 0x1000 + 16))
            .unwrap();
        assert_eq!(readback, pattern);
    }

    #[test]
    fn unsupported_request_reports_unsupp() {
        let (_f, disk) = test_disk(4096);
        let mut driver = RingDriver::new();
        driver.submit(0, 0x42, 0, 0, false);
        let chain = driver.queue.pop(&driver.mem).unwrap();
        let (status, len) = execute_request(&disk, &chain);
        assert_eq!(status, VIRTIO_BLK_S_UNSUPP);
        assert_eq!(len, 0);
    }

    #[test]
    fn get_id_writes_serial() {
        let (_f, disk) = test_disk(4096);
        let mut driver = RingDriver::new();
        driver.submit(0, VIRTIO_BLK_T_GET_ID, 0, 20, true);
        let chain = driver.queue.pop(&driver.mem).unwrap();
        let (status, len) = execute_request(&disk, &chain);
        assert_eq!(status, VIRTIO_BLK_S_OK);
        assert!(len > 0 && len <= 20);
        let mut id = vec![0u8; len as usize];
        driver
            .mem
            .read_exact_at_addr(&mut id, vm_memory::GuestAddress(DATA_BASE + 16))
            .unwrap();
        assert_eq!(id, disk.serial(20));
    }
}
