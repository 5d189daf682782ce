// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Cell directory: a sparse indexed array of byte strings persisted as a
//! single sack record.
//!
//! Cell `i` typically holds the serialized root descriptor + header for one
//! logical B+Tree, but the directory itself has no opinion about what is
//! stored at an index.

use crate::error::{Error, Result};

/// A sparse, indexed array of opaque byte strings.
///
/// On disk: a 4-byte big-endian count, then `count` signed 32-bit sizes
/// (`-1` marks an absent entry), then the concatenated payloads of the
/// present entries. `len()` is one past the last index holding a
/// non-empty payload; deletion marks an entry absent without shifting its
/// neighbors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellDirectory {
    entries: Vec<Option<Vec<u8>>>,
}

impl CellDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value at `index`, or `None` if absent or out of range.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.entries.get(index).and_then(|e| e.as_deref())
    }

    /// Sets the value at `index`, extending the directory with absent
    /// entries as needed.
    pub fn set(&mut self, index: usize, value: Vec<u8>) {
        if index >= self.entries.len() {
            self.entries.resize(index + 1, None);
        }
        self.entries[index] = Some(value);
    }

    /// Marks `index` absent. Does not shift any adjacent entries.
    pub fn delete(&mut self, index: usize) {
        if index < self.entries.len() {
            self.entries[index] = None;
        }
    }

    /// One past the last index holding a non-empty payload.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, Some(v) if !v.is_empty()))
            .map(|(i, _)| i + 1)
            .last()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the directory, trimming trailing absent/empty entries.
    pub fn save(&self) -> Vec<u8> {
        let trimmed_len = self.len();
        let trimmed = &self.entries[..trimmed_len.min(self.entries.len())];

        let mut out = Vec::new();
        out.extend_from_slice(&(trimmed_len as u32).to_be_bytes());
        for entry in trimmed {
            let size: i32 = match entry {
                None => -1,
                Some(v) => v.len() as i32,
            };
            out.extend_from_slice(&size.to_be_bytes());
        }
        for entry in trimmed {
            if let Some(v) = entry {
                out.extend_from_slice(v);
            }
        }
        out
    }

    /// Deserializes a directory previously produced by [`CellDirectory::save`].
    pub fn load(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        if data.len() < 4 {
            return Err(Error::corrupt("cell directory: truncated count"));
        }
        let count = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;

        let sizes_start = 4;
        let sizes_end = sizes_start + count * 4;
        if data.len() < sizes_end {
            return Err(Error::corrupt("cell directory: truncated size table"));
        }

        let mut sizes = Vec::with_capacity(count);
        for i in 0..count {
            let start = sizes_start + i * 4;
            let size = i32::from_be_bytes(data[start..start + 4].try_into().unwrap());
            sizes.push(size);
        }

        let mut entries = Vec::with_capacity(count);
        let mut cursor = sizes_end;
        for size in sizes {
            if size < 0 {
                entries.push(None);
                continue;
            }
            let size = size as usize;
            let end = cursor + size;
            if data.len() < end {
                return Err(Error::corrupt("cell directory: truncated payload"));
            }
            entries.push(Some(data[cursor..end].to_vec()));
            cursor = end;
        }

        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_directory_has_zero_length() {
        let cell = CellDirectory::new();
        assert_eq!(cell.len(), 0);
        assert!(cell.get(0).is_none());
    }

    #[test]
    fn set_extends_and_reports_length_and_neighbors_absent() {
        let mut cell = CellDirectory::new();
        cell.set(1, b"test".to_vec());

        assert_eq!(cell.len(), 2);
        assert!(cell.get(0).is_none());
        assert_eq!(cell.get(1), Some(&b"test"[..]));
        assert!(cell.get(2).is_none());
    }

    #[test]
    fn delete_marks_absent_without_shifting() {
        let mut cell = CellDirectory::new();
        cell.set(1, b"test".to_vec());
        cell.delete(1);

        assert_eq!(cell.len(), 0);
        assert!(cell.get(1).is_none());
    }

    #[test]
    fn save_load_roundtrips() {
        let mut cell = CellDirectory::new();
        cell.set(0, b"root-a".to_vec());
        cell.set(3, b"root-b".to_vec());

        let bytes = cell.save();
        let restored = CellDirectory::load(&bytes).unwrap();

        assert_eq!(restored.get(0), Some(&b"root-a"[..]));
        assert_eq!(restored.get(3), Some(&b"root-b"[..]));
        assert_eq!(restored.len(), 4);
    }

    #[test]
    fn save_trims_trailing_absent_entries() {
        let mut cell = CellDirectory::new();
        cell.set(0, b"a".to_vec());
        cell.set(4, b"b".to_vec());
        cell.delete(4);

        let bytes = cell.save();
        let restored = CellDirectory::load(&bytes).unwrap();
        assert_eq!(restored.len(), 1);
    }
}
