// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Raw file-backed disk images with vectored sector I/O.

use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use base::AsRawDescriptor;
use remain::sorted;
use thiserror::Error;

pub const SECTOR_SHIFT: u64 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("flush failed: {0}")]
    Flush(base::Error),
    #[error("opening disk image failed: {0}")]
    Open(std::io::Error),
    #[error("vectored read failed: {0}")]
    ReadingData(base::Error),
    #[error("disk write reached end of file")]
    WritePastEof,
    #[error("vectored write failed: {0}")]
    WritingData(base::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A raw disk image over a host file, addressed in 512-byte sectors.
#[derive(Debug)]
pub struct DiskImage {
    file: File,
    size: u64,
    read_only: bool,
}

impl DiskImage {
    /// Opens the image at `path`. A read-only image is advertised to the
    /// guest as such through the block device's feature bits.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<DiskImage> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(Error::Open)?;
        let size = file.metadata().map_err(Error::Open)?.len();
        Ok(DiskImage {
            file,
            size,
            read_only,
        })
    }

    /// Size of the image in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Capacity in 512-byte sectors.
    pub fn sectors(&self) -> u64 {
        self.size >> SECTOR_SHIFT
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Fills `iovecs` with data starting at `sector`, returning the bytes
    /// read. Short transfers, `EINTR` and `EAGAIN` are retried with the
    /// cursor advanced past what already completed.
    ///
    /// # Safety contract
    /// The iovecs must point at writable memory that outlives the call;
    /// the caller builds them from guest memory slices.
    pub fn read_vectored_at(&self, iovecs: &mut [libc::iovec], sector: u64) -> Result<i64> {
        let mut offset = (sector << SECTOR_SHIFT) as i64;
        let mut cursor = IovecCursor::new(iovecs);
        let mut total: i64 = 0;
        while !cursor.is_empty() {
            let (iov, cnt) = cursor.current();
            // Safe because the iovecs were built from live guest memory
            // and the count matches the slice.
            let nr = unsafe {
                libc::preadv(
                    self.file.as_raw_descriptor(),
                    iov,
                    cnt as libc::c_int,
                    offset,
                )
            };
            if nr < 0 {
                let err = base::Error::last();
                if err.errno() == libc::EINTR || err.errno() == libc::EAGAIN {
                    continue;
                }
                return Err(Error::ReadingData(err));
            }
            if nr == 0 {
                break;
            }
            cursor.advance(nr as usize);
            offset += nr as i64;
            total += nr as i64;
        }
        Ok(total)
    }

    /// Writes `iovecs` to the image starting at `sector`, returning the
    /// bytes written. Retries like `read_vectored_at`; running out of
    /// space mid-request is an error.
    pub fn write_vectored_at(&self, iovecs: &mut [libc::iovec], sector: u64) -> Result<i64> {
        let mut offset = (sector << SECTOR_SHIFT) as i64;
        let mut cursor = IovecCursor::new(iovecs);
        let mut total: i64 = 0;
        while !cursor.is_empty() {
            let (iov, cnt) = cursor.current();
            // Safe because the iovecs were built from live guest memory.
            let nr = unsafe {
                libc::pwritev(
                    self.file.as_raw_descriptor(),
                    iov,
                    cnt as libc::c_int,
                    offset,
                )
            };
            if nr < 0 {
                let err = base::Error::last();
                if err.errno() == libc::EINTR || err.errno() == libc::EAGAIN {
                    continue;
                }
                return Err(Error::WritingData(err));
            }
            if nr == 0 {
                return Err(Error::WritePastEof);
            }
            cursor.advance(nr as usize);
            offset += nr as i64;
            total += nr as i64;
        }
        Ok(total)
    }

    /// Commits all written data to the backing file.
    pub fn flush(&self) -> Result<()> {
        // Safe because the descriptor is valid.
        let ret = unsafe { libc::fsync(self.file.as_raw_descriptor()) };
        if ret < 0 {
            return Err(Error::Flush(base::Error::last()));
        }
        Ok(())
    }

    /// Derives a stable serial string from the backing inode, truncated
    /// to `max_len` bytes.
    pub fn serial(&self, max_len: usize) -> Vec<u8> {
        let serial = match self.file.metadata() {
            Ok(meta) => format!("{}{}{}", meta.dev(), meta.rdev(), meta.ino()),
            Err(_) => String::new(),
        };
        let mut bytes = serial.into_bytes();
        bytes.truncate(max_len);
        bytes
    }
}

/// Tracks partial progress through an iovec array across retried
/// `preadv`/`pwritev` calls.
struct IovecCursor<'a> {
    iovecs: &'a mut [libc::iovec],
    index: usize,
}

impl<'a> IovecCursor<'a> {
    fn new(iovecs: &'a mut [libc::iovec]) -> IovecCursor<'a> {
        IovecCursor { iovecs, index: 0 }
    }

    fn is_empty(&self) -> bool {
        self.iovecs[self.index..].iter().all(|iov| iov.iov_len == 0)
    }

    fn current(&mut self) -> (*const libc::iovec, usize) {
        let rest = &self.iovecs[self.index..];
        (rest.as_ptr(), rest.len())
    }

    /// Consumes `count` bytes from the front of the remaining iovecs.
    fn advance(&mut self, mut count: usize) {
        while count > 0 && self.index < self.iovecs.len() {
            let iov = &mut self.iovecs[self.index];
            let step = std::cmp::min(count, iov.iov_len);
            // Safe arithmetic: step is bounded by iov_len.
            iov.iov_base = unsafe { (iov.iov_base as *mut u8).add(step) } as *mut libc::c_void;
            iov.iov_len -= step;
            count -= step;
            if iov.iov_len == 0 {
                self.index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_disk(len: usize) -> (tempfile::NamedTempFile, DiskImage) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        f.flush().unwrap();
        let disk = DiskImage::open(f.path(), false).unwrap();
        (f, disk)
    }

    fn iovec_of(buf: &mut [u8]) -> libc::iovec {
        libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        }
    }

    #[test]
    fn size_in_sectors() {
        let (_f, disk) = temp_disk(1 << 20);
        assert_eq!(disk.size(), 1 << 20);
        assert_eq!(disk.sectors(), 2048);
    }

    #[test]
    fn write_read_roundtrip() {
        let (_f, disk) = temp_disk(1 << 20);
        let mut pattern = [0xa5u8; 512];
        let mut iov = [iovec_of(&mut pattern)];
        assert_eq!(disk.write_vectored_at(&mut iov, 0).unwrap(), 512);
        disk.flush().unwrap();

        let mut readback = [0u8; 512];
        let mut iov = [iovec_of(&mut readback)];
        assert_eq!(disk.read_vectored_at(&mut iov, 0).unwrap(), 512);
        assert_eq!(readback, [0xa5u8; 512]);
    }

    #[test]
    fn scattered_write() {
        let (_f, disk) = temp_disk(1 << 20);
        let mut a = [1u8; 256];
        let mut b = [2u8; 256];
        let mut iov = [iovec_of(&mut a), iovec_of(&mut b)];
        assert_eq!(disk.write_vectored_at(&mut iov, 4).unwrap(), 512);

        let mut readback = [0u8; 512];
        let mut iov = [iovec_of(&mut readback)];
        disk.read_vectored_at(&mut iov, 4).unwrap();
        assert_eq!(&readback[..256], &[1u8; 256][..]);
        assert_eq!(&readback[256..], &[2u8; 256][..]);
    }

    #[test]
    fn serial_is_truncated_and_stable() {
        let (_f, disk) = temp_disk(4096);
        let serial = disk.serial(20);
        assert!(serial.len() <= 20);
        assert_eq!(serial, disk.serial(20));
    }

    #[test]
    fn read_only_flag() {
        let (_f, disk) = {
            let mut f = tempfile::NamedTempFile::new().unwrap();
            f.write_all(&[0u8; 4096]).unwrap();
            let disk = DiskImage::open(f.path(), true).unwrap();
            (f, disk)
        };
        assert!(disk.read_only());
    }
}
