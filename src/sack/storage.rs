// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Byte-addressable backing stream abstraction.
//!
//! A [`Storage`] is anything the [`Sack`](super::Sack) can place records
//! into: a plain `File`, an in-memory buffer (used by every unit test and
//! by the open-in-memory persistence scenario), or a memory-mapped file for
//! callers who want to avoid a syscall per access.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use memmap2::MmapMut;

use crate::error::Result;

/// A seekable, growable byte-addressable backing store.
///
/// Offsets are absolute from the start of the stream. Implementations must
/// transparently zero-fill any gap between the previous end-of-stream and a
/// `write_at` call that starts beyond it (a file-backed `Storage` gets this
/// for free from the OS; an in-memory one must do it itself).
pub trait Storage {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` starting at `offset`, growing the backing store if
    /// `offset + buf.len()` exceeds its current length.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Current length of the backing store in bytes.
    fn len(&mut self) -> Result<u64>;

    /// Persists any buffered writes durably.
    fn sync(&mut self) -> Result<()>;
}

impl Storage for File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn sync(&mut self) -> Result<()> {
        self.sync_all()?;
        Ok(())
    }
}

impl Storage for Cursor<Vec<u8>> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Memory-mapped file storage.
///
/// Mirrors `examples/original_source/sack/mmap.py`: reads and writes go
/// straight through a mapped region instead of a syscall per access. The
/// map is grown (unmapped, file extended, remapped) on demand, which is the
/// Rust equivalent of the original's `resize` hook.
pub struct MmapStorage {
    file: File,
    map: MmapMut,
}

impl MmapStorage {
    const GROWTH_FACTOR: u64 = 2;
    const MIN_SIZE: u64 = 4096;

    pub fn new(file: File) -> Result<Self> {
        let len = file.metadata()?.len().max(Self::MIN_SIZE);
        file.set_len(len)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, map })
    }

    fn grow_to(&mut self, min_len: u64) -> Result<()> {
        if min_len <= self.map.len() as u64 {
            return Ok(());
        }
        let mut new_len = (self.map.len() as u64 * Self::GROWTH_FACTOR).max(Self::MIN_SIZE);
        while new_len < min_len {
            new_len *= Self::GROWTH_FACTOR;
        }
        self.map.flush()?;
        self.file.set_len(new_len)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }
}

impl Storage for MmapStorage {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        buf.copy_from_slice(&self.map[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.grow_to(offset + buf.len() as u64)?;
        let start = offset as usize;
        let end = start + buf.len();
        self.map[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.map.len() as u64)
    }

    fn sync(&mut self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}
