// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! The sack: a variable-record container over a seekable byte stream.
//!
//! A [`Sack`] owns a [`BuddyAllocator`](crate::alloc::BuddyAllocator) and a
//! [`CellDirectory`], and lets callers push/get/pop arbitrarily sized byte
//! records addressed by [`Descriptor`]. Records are framed with a 4-byte
//! little-endian length prefix; descriptors name a power-of-two block large
//! enough to hold that prefix plus the payload.
//!
//! On-disk layout:
//! ```text
//! [ 16-byte header: alloc_desc (8 BE) | cell_desc (8 BE) ]
//! [ data region: framed records addressed by descriptor offset ]
//! ```
//!
//! Each framed record is a 4-byte little-endian length prefix followed by
//! that many payload bytes; the header fields around it (descriptors,
//! counts) are big-endian, matching the rest of the on-disk format.

pub mod cell;
pub mod descriptor;
pub mod storage;

pub use cell::CellDirectory;
pub use descriptor::Descriptor;
pub use storage::{MmapStorage, Storage};

use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use crate::alloc::BuddyAllocator;
use crate::error::{Error, Result};
use crate::metrics::{Metric, MetricUnit, MetricsCollector};

const HEADER_SIZE: u64 = 16;
const LENGTH_PREFIX: u64 = 4;

/// How an existing file should be opened, or whether a new one should be
/// created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing sack for reading and writing.
    ReadWrite,
    /// Open an existing sack for reading only; mutating calls return
    /// [`Error::ReadOnly`].
    ReadOnly,
    /// Create a new sack, truncating anything already present.
    Create,
}

/// File-level open mode, matching spec's `r`/`w`/`c`/`n` modes one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpenMode {
    /// `r`: open an existing file read-only. Fails if the file is missing.
    Read,
    /// `w`: open an existing file read/write. Fails if the file is missing.
    Write,
    /// `c`: open read/write, creating a fresh sack of the given order if the
    /// file does not already exist.
    CreateIfMissing,
    /// `n`: always truncate and create a fresh sack of the given order.
    New,
}

impl Sack<File> {
    /// Opens (or creates) a file-backed sack per `mode`. `order` is required
    /// for [`FileOpenMode::CreateIfMissing`] (only when the file doesn't
    /// already exist) and [`FileOpenMode::New`]; it is ignored otherwise.
    pub fn open_file(path: impl AsRef<Path>, mode: FileOpenMode, order: Option<u8>) -> Result<Self> {
        let path = path.as_ref();
        match mode {
            FileOpenMode::Read => {
                let file = File::options().read(true).open(path)?;
                Sack::open(file, OpenMode::ReadOnly)
            }
            FileOpenMode::Write => {
                let file = File::options().read(true).write(true).open(path)?;
                Sack::open(file, OpenMode::ReadWrite)
            }
            FileOpenMode::CreateIfMissing => {
                let existed = path.exists();
                let file = File::options()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)?;
                if existed {
                    Sack::open(file, OpenMode::ReadWrite)
                } else {
                    let order = order.ok_or_else(|| {
                        Error::bad_argument("mode 'c' requires a capacity order to create a new file")
                    })?;
                    Sack::create(file, order)
                }
            }
            FileOpenMode::New => {
                let order = order
                    .ok_or_else(|| Error::bad_argument("mode 'n' requires a capacity order"))?;
                let file = File::options()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                Sack::create(file, order)
            }
        }
    }
}

/// A variable-record container addressed by [`Descriptor`].
pub struct Sack<S: Storage> {
    storage: S,
    alloc: BuddyAllocator,
    alloc_desc: Descriptor,
    cell: CellDirectory,
    cell_desc: Descriptor,
    read_only: bool,
}

impl<S: Storage> Sack<S> {
    /// Creates a fresh sack over `storage`, with an address space of
    /// `1 << order` bytes and an empty cell directory.
    pub fn create(mut storage: S, order: u8) -> Result<Self> {
        storage.write_at(0, &[0u8; HEADER_SIZE as usize])?;
        Ok(Self {
            storage,
            alloc: BuddyAllocator::new(order),
            alloc_desc: Descriptor::NONE,
            cell: CellDirectory::new(),
            cell_desc: Descriptor::NONE,
            read_only: false,
        })
    }

    /// Opens an existing sack, reading its header and restoring the
    /// allocator and cell directory from their persisted descriptors.
    pub fn open(mut storage: S, mode: OpenMode) -> Result<Self> {
        if matches!(mode, OpenMode::Create) {
            return Err(Error::bad_argument("use Sack::create for OpenMode::Create"));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        storage.read_at(0, &mut header)?;
        let alloc_desc = Descriptor::from_be_bytes(header[0..8].try_into().unwrap());
        let cell_desc = Descriptor::from_be_bytes(header[8..16].try_into().unwrap());

        if alloc_desc.is_none() {
            return Err(Error::corrupt("sack header names no allocator state"));
        }

        let mut sack = Self {
            storage,
            alloc: BuddyAllocator::new(0),
            alloc_desc,
            cell: CellDirectory::new(),
            cell_desc,
            read_only: matches!(mode, OpenMode::ReadOnly),
        };

        let alloc_bytes = sack.read_record(alloc_desc)?;
        sack.alloc = BuddyAllocator::load(Cursor::new(alloc_bytes))?;

        if !cell_desc.is_none() {
            let cell_bytes = sack.read_record(cell_desc)?;
            sack.cell = CellDirectory::load(&cell_bytes)?;
        }

        Ok(sack)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Unwraps the sack, handing back the underlying storage. Useful for
    /// reopening the same backing store as a fresh `Sack` (e.g. after a
    /// flush, to simulate a process restart in tests).
    pub fn into_storage(self) -> S {
        self.storage
    }

    pub fn cell(&self) -> &CellDirectory {
        &self.cell
    }

    pub fn cell_mut(&mut self) -> &mut CellDirectory {
        &mut self.cell
    }

    fn require_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn data_offset(&self, desc: Descriptor) -> u64 {
        HEADER_SIZE + desc.offset()
    }

    fn read_record(&mut self, desc: Descriptor) -> Result<Vec<u8>> {
        let offset = self.data_offset(desc);
        let mut len_buf = [0u8; 4];
        self.storage.read_at(offset, &mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut data = vec![0u8; len];
        self.storage.read_at(offset + LENGTH_PREFIX, &mut data)?;
        Ok(data)
    }

    /// Reads the record named by `desc`.
    pub fn get(&mut self, desc: Descriptor) -> Result<Vec<u8>> {
        if desc.is_none() {
            return Err(Error::bad_argument("cannot get the none descriptor"));
        }
        self.read_record(desc)
    }

    /// Writes `data`, reusing `previous` in place when it still fits;
    /// otherwise frees `previous` and allocates a new block. Returns the
    /// (possibly unchanged) descriptor for `data`.
    pub fn push(&mut self, data: &[u8], previous: Option<Descriptor>) -> Result<Descriptor> {
        self.require_writable()?;

        if let Some(desc) = previous.filter(|d| !d.is_none()) {
            if data.len() as u64 + LENGTH_PREFIX <= 1u64 << desc.order() {
                self.write_framed(self.data_offset(desc), data)?;
                return Ok(desc);
            }
            self.alloc.free(desc.offset(), desc.order());
        }

        let (offset, order) = self.alloc.alloc(data.len() + LENGTH_PREFIX as usize)?;
        let desc = Descriptor::new(offset, order);
        self.write_framed(self.data_offset(desc), data)?;
        Ok(desc)
    }

    fn write_framed(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(4 + data.len());
        framed.extend_from_slice(&(data.len() as u32).to_le_bytes());
        framed.extend_from_slice(data);
        self.storage.write_at(offset, &framed)
    }

    /// Allocates space for `size` bytes without writing anything, reusing
    /// `previous` when its capacity still covers `size`.
    pub fn reserve(&mut self, size: usize, previous: Option<Descriptor>) -> Result<Descriptor> {
        self.require_writable()?;

        if let Some(desc) = previous.filter(|d| !d.is_none()) {
            if size as u64 + LENGTH_PREFIX <= 1u64 << desc.order() {
                return Ok(desc);
            }
            self.alloc.free(desc.offset(), desc.order());
        }

        let (offset, order) = self.alloc.alloc(size + LENGTH_PREFIX as usize)?;
        Ok(Descriptor::new(offset, order))
    }

    /// Reads and frees the record named by `desc`.
    pub fn pop(&mut self, desc: Descriptor) -> Result<Vec<u8>> {
        self.require_writable()?;
        let data = self.read_record(desc)?;
        self.alloc.free(desc.offset(), desc.order());
        Ok(data)
    }

    /// Flushes the cell directory, the allocator state, and the 16-byte
    /// header, in that order.
    ///
    /// The allocator's own on-disk state is itself a sack record, so saving
    /// it can itself allocate, so `push` is looped until it returns the same
    /// descriptor it was given, i.e. until the allocator's state stops
    /// changing as a result of persisting itself. Only once that fixed
    /// point is reached is the header overwritten, so a crash mid-flush
    /// still leaves a previously-committed, internally consistent header in
    /// place.
    pub fn flush(&mut self) -> Result<()> {
        self.require_writable()?;

        let cell_bytes = self.cell.save();
        self.cell_desc = self.push(&cell_bytes, Some(self.cell_desc).filter(|d| !d.is_none()))?;

        loop {
            let mut state = Vec::new();
            self.alloc.save(&mut state)?;
            let previous = Some(self.alloc_desc).filter(|d| !d.is_none());
            let desc = self.push(&state, previous)?;
            let unchanged = previous == Some(desc);
            self.alloc_desc = desc;
            if unchanged {
                break;
            }
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(&self.alloc_desc.to_be_bytes());
        header[8..16].copy_from_slice(&self.cell_desc.to_be_bytes());
        self.storage.write_at(0, &header)?;
        self.storage.sync()?;

        MetricsCollector::global().record(Metric::new(
            "alloc_used_space",
            self.alloc.used_space() as f64,
            MetricUnit::Bytes,
        ));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fresh() -> Sack<Cursor<Vec<u8>>> {
        Sack::create(Cursor::new(Vec::new()), 16).unwrap()
    }

    #[test]
    fn push_and_get_roundtrip() {
        let mut sack = fresh();
        let desc = sack.push(b"hello world", None).unwrap();
        assert_eq!(sack.get(desc).unwrap(), b"hello world");
    }

    #[test]
    fn push_reuses_block_when_it_still_fits() {
        let mut sack = fresh();
        let desc = sack.push(b"short", None).unwrap();
        let desc2 = sack.push(b"still short", Some(desc)).unwrap();
        assert_eq!(desc, desc2);
        assert_eq!(sack.get(desc2).unwrap(), b"still short");
    }

    #[test]
    fn push_reallocates_when_outgrowing_block() {
        let mut sack = fresh();
        let desc = sack.push(b"x", None).unwrap();
        let big = vec![b'y'; 10_000];
        let desc2 = sack.push(&big, Some(desc)).unwrap();
        assert_ne!(desc, desc2);
        assert_eq!(sack.get(desc2).unwrap(), big);
    }

    #[test]
    fn pop_frees_the_block() {
        let mut sack = fresh();
        let desc = sack.push(b"gone soon", None).unwrap();
        let data = sack.pop(desc).unwrap();
        assert_eq!(data, b"gone soon");

        let desc2 = sack.push(b"reuse", None).unwrap();
        assert_eq!(desc2.offset(), desc.offset());
    }

    #[test]
    fn flush_then_reopen_restores_cell_directory_and_records() {
        let mut sack = fresh();
        let desc = sack.push(b"payload", None).unwrap();
        sack.cell_mut().set(0, desc.to_be_bytes().to_vec());
        sack.flush().unwrap();

        let storage = sack.storage;
        let mut reopened = Sack::open(storage, OpenMode::ReadWrite).unwrap();
        let stored = reopened.cell().get(0).unwrap();
        let restored_desc = Descriptor::from_be_bytes(stored.try_into().unwrap());
        assert_eq!(reopened.get(restored_desc).unwrap(), b"payload");
    }

    #[test]
    fn read_only_sack_rejects_mutation() {
        let mut sack = fresh();
        sack.flush().unwrap();
        let storage = sack.storage;

        let mut reopened = Sack::open(storage, OpenMode::ReadOnly).unwrap();
        assert!(matches!(reopened.push(b"nope", None), Err(Error::ReadOnly)));
    }

    #[test]
    fn file_open_mode_create_if_missing_creates_then_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sack");

        let mut sack = Sack::open_file(&path, FileOpenMode::CreateIfMissing, Some(16)).unwrap();
        let desc = sack.push(b"first run", None).unwrap();
        sack.cell_mut().set(0, desc.to_be_bytes().to_vec());
        sack.flush().unwrap();
        drop(sack);

        let mut reopened = Sack::open_file(&path, FileOpenMode::CreateIfMissing, None).unwrap();
        let stored = reopened.cell().get(0).unwrap();
        let restored_desc = Descriptor::from_be_bytes(stored.try_into().unwrap());
        assert_eq!(reopened.get(restored_desc).unwrap(), b"first run");
    }

    #[test]
    fn file_open_mode_new_always_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sack");

        let mut sack = Sack::open_file(&path, FileOpenMode::New, Some(16)).unwrap();
        sack.push(b"will be discarded", None).unwrap();
        sack.flush().unwrap();
        drop(sack);

        let fresh = Sack::open_file(&path, FileOpenMode::New, Some(16)).unwrap();
        assert!(fresh.cell().get(0).is_none());
    }

    #[test]
    fn file_open_mode_read_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sack");
        assert!(Sack::open_file(&path, FileOpenMode::Read, None).is_err());
    }

    #[test]
    fn file_open_mode_create_if_missing_requires_order_for_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-order.sack");
        assert!(matches!(
            Sack::open_file(&path, FileOpenMode::CreateIfMissing, None),
            Err(Error::BadArgument { .. })
        ));
    }
}
