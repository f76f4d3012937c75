//! Fixed-width offset index.
//!
//! Each entry maps a record's offset relative to the segment base offset to
//! the record's byte position in the segment store:
//!
//! ```text
//! +----------------------+------------------------------+
//! | relative offset (BE) | store position (BE)          |
//! | 4 bytes              | 8 bytes                      |
//! +----------------------+------------------------------+
//! ```
//!
//! Entry `i` holds relative offset `i`, so lookups index straight into the
//! memory map. The file is grown to its full capacity while open and cut back
//! to the used length on close, which is how a reopened index knows its size.

use crate::error::LogError;
use crate::ENTRY_WIDTH;
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const OFFSET_WIDTH: usize = 4;

struct Mapped {
    file: File,
    mmap: MmapMut,
}

/// A single index file.
pub struct Index {
    path: PathBuf,
    mapped: Option<Mapped>,
    size: u64,
    capacity: u64,
}

impl Index {
    /// Opens or creates an index file with room for `max_bytes` of entries.
    ///
    /// The used size is taken from the file length, trimmed down to the
    /// longest prefix of well-formed entries.
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, LogError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| LogError::io(&path, e))?;

        let file_len = file.metadata().map_err(|e| LogError::io(&path, e))?.len();
        let capacity = max_bytes - max_bytes % ENTRY_WIDTH;
        let capacity = capacity.max(file_len - file_len % ENTRY_WIDTH);

        file.set_len(capacity)
            .map_err(|e| LogError::io(&path, e))?;

        // SAFETY: the log directory is owned by a single `Log`; nothing else
        // truncates or rewrites the file while it is mapped.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| LogError::io(&path, e))?;

        let mut index = Self {
            path,
            mapped: Some(Mapped { file, mmap }),
            size: 0,
            capacity,
        };
        index.size = index.recovered_entries(file_len / ENTRY_WIDTH) * ENTRY_WIDTH;

        Ok(index)
    }

    /// Counts the leading entries among the first `limit` slots whose
    /// relative offset matches their slot number. Zero-filled slots left by a
    /// crash before `close` fail this check from slot 1 onwards.
    fn recovered_entries(&self, limit: u64) -> u64 {
        let Some(mapped) = self.mapped.as_ref() else {
            return 0;
        };

        (0..limit)
            .take_while(|&slot| decode_entry(&mapped.mmap, slot).0 as u64 == slot)
            .count() as u64
    }

    /// Returns the index file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of bytes holding entries.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the pre-sized capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the number of entries.
    pub fn len(&self) -> u64 {
        self.size / ENTRY_WIDTH
    }

    /// Returns true if the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns true if another entry no longer fits.
    pub fn is_full(&self) -> bool {
        self.size + ENTRY_WIDTH > self.capacity
    }

    /// Appends an entry.
    pub fn append(&mut self, relative_offset: u32, position: u64) -> Result<(), LogError> {
        if self.is_full() {
            return Err(LogError::IndexFull {
                path: self.path.clone(),
                capacity: self.capacity,
            });
        }
        let mapped = self.mapped.as_mut().ok_or(LogError::Closed)?;

        let start = self.size as usize;
        let mid = start + OFFSET_WIDTH;
        let end = start + ENTRY_WIDTH as usize;
        mapped.mmap[start..mid].copy_from_slice(&relative_offset.to_be_bytes());
        mapped.mmap[mid..end].copy_from_slice(&position.to_be_bytes());
        self.size += ENTRY_WIDTH;

        Ok(())
    }

    /// Reads the entry for `relative_offset`, returning `(relative_offset, position)`.
    ///
    /// A relative offset of `-1` reads the last entry.
    pub fn read(&self, relative_offset: i64) -> Result<(u32, u64), LogError> {
        let mapped = self.mapped.as_ref().ok_or(LogError::Closed)?;

        let not_found = || LogError::IndexEntryNotFound {
            path: self.path.clone(),
            relative_offset,
        };

        let slot = match relative_offset {
            -1 => self.len().checked_sub(1).ok_or_else(not_found)?,
            n if n < 0 => return Err(not_found()),
            n => n as u64,
        };
        if slot >= self.len() {
            return Err(not_found());
        }

        Ok(decode_entry(&mapped.mmap, slot))
    }

    /// Drops every entry from slot `entries` onwards.
    pub fn truncate_entries(&mut self, entries: u64) -> Result<(), LogError> {
        let mapped = self.mapped.as_mut().ok_or(LogError::Closed)?;
        let new_size = (entries * ENTRY_WIDTH).min(self.size);
        mapped.mmap[new_size as usize..self.size as usize].fill(0);
        self.size = new_size;
        Ok(())
    }

    /// Flushes the memory map to disk.
    pub fn sync(&self) -> Result<(), LogError> {
        let mapped = self.mapped.as_ref().ok_or(LogError::Closed)?;
        mapped
            .mmap
            .flush()
            .map_err(|e| LogError::io(&self.path, e))
    }

    /// Flushes the map, truncates the file to the used size and releases it.
    /// Idempotent.
    pub fn close(&mut self) -> Result<(), LogError> {
        let Some(mapped) = self.mapped.take() else {
            return Ok(());
        };

        mapped
            .mmap
            .flush()
            .map_err(|e| LogError::io(&self.path, e))?;
        let Mapped { file, mmap } = mapped;
        drop(mmap);

        file.set_len(self.size)
            .map_err(|e| LogError::io(&self.path, e))?;
        file.sync_all().map_err(|e| LogError::io(&self.path, e))?;

        tracing::trace!("closed index {} ({} entries)", self.path.display(), self.len());
        Ok(())
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.mapped.is_none()
    }
}

fn decode_entry(buf: &[u8], slot: u64) -> (u32, u64) {
    let start = (slot * ENTRY_WIDTH) as usize;
    let mid = start + OFFSET_WIDTH;
    let end = start + ENTRY_WIDTH as usize;

    let mut offset = [0u8; OFFSET_WIDTH];
    offset.copy_from_slice(&buf[start..mid]);
    let mut position = [0u8; 8];
    position.copy_from_slice(&buf[mid..end]);

    (u32::from_be_bytes(offset), u64::from_be_bytes(position))
}

impl Drop for Index {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("failed to close index {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_index_append_read() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::open(dir.path().join("0.index"), 1024).unwrap();

        assert!(index.is_empty());
        assert!(matches!(index.read(-1), Err(LogError::IndexEntryNotFound { .. })));

        let entries = [(0u32, 0u64), (1, 10), (2, 25)];
        for (offset, position) in entries {
            index.append(offset, position).unwrap();
        }
        assert_eq!(index.len(), 3);
        assert_eq!(index.size(), 3 * ENTRY_WIDTH);

        for (offset, position) in entries {
            assert_eq!(index.read(offset as i64).unwrap(), (offset, position));
        }
        assert_eq!(index.read(-1).unwrap(), (2, 25));

        assert!(index.read(3).is_err());
        assert!(index.read(-2).is_err());
    }

    #[test]
    fn test_index_capacity() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::open(dir.path().join("0.index"), ENTRY_WIDTH * 2 + 5).unwrap();
        assert_eq!(index.capacity(), ENTRY_WIDTH * 2);

        index.append(0, 0).unwrap();
        assert!(!index.is_full());
        index.append(1, 10).unwrap();
        assert!(index.is_full());

        assert!(matches!(index.append(2, 20), Err(LogError::IndexFull { .. })));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_index_close_truncates_and_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.index");

        {
            let mut index = Index::open(&path, 1024).unwrap();
            assert_eq!(std::fs::metadata(&path).unwrap().len(), index.capacity());
            index.append(0, 0).unwrap();
            index.append(1, 19).unwrap();
            index.close().unwrap();
            index.close().unwrap();
            assert!(index.is_closed());
            assert!(matches!(index.read(0), Err(LogError::Closed)));
        }

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * ENTRY_WIDTH);

        let index = Index::open(&path, 1024).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.read(-1).unwrap(), (1, 19));
    }

    #[test]
    fn test_index_recovers_from_unclosed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.index");

        {
            let mut index = Index::open(&path, 1024).unwrap();
            index.append(0, 0).unwrap();
            index.append(1, 19).unwrap();
            index.append(2, 38).unwrap();
            index.sync().unwrap();
            // Simulate a crash: the file keeps its pre-sized length.
            std::mem::forget(index);
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1020);

        let index = Index::open(&path, 1024).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.read(-1).unwrap(), (2, 38));
    }

    #[test]
    fn test_index_truncate_entries() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::open(dir.path().join("0.index"), 1024).unwrap();
        for i in 0..5u32 {
            index.append(i, i as u64 * 10).unwrap();
        }

        index.truncate_entries(2).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.read(-1).unwrap(), (1, 10));

        index.append(2, 99).unwrap();
        assert_eq!(index.read(2).unwrap(), (2, 99));
    }
}
