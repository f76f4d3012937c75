//! Log segment management.
//!
//! A segment pairs one store file with one index file, both named after the
//! segment's base offset (`<base_offset>.store`, `<base_offset>.index`). It
//! covers the offsets `[base_offset, next_offset)`.

use crate::config::{FsyncPolicy, SegmentConfig};
use crate::error::LogError;
use crate::index::Index;
use crate::record::Record;
use crate::store::Store;
use crate::LEN_WIDTH;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

/// Store file suffix.
pub const STORE_SUFFIX: &str = ".store";

/// Index file suffix.
pub const INDEX_SUFFIX: &str = ".index";

/// Store file name for a segment.
pub fn store_filename(base_offset: u64) -> String {
    format!("{}{}", base_offset, STORE_SUFFIX)
}

/// Index file name for a segment.
pub fn index_filename(base_offset: u64) -> String {
    format!("{}{}", base_offset, INDEX_SUFFIX)
}

/// Parse a segment base offset from a store or index file name.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    let stem = name
        .strip_suffix(STORE_SUFFIX)
        .or_else(|| name.strip_suffix(INDEX_SUFFIX))?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Lists the distinct segment base offsets found in a directory, sorted
/// ascending. Files that are not `<u64>.store` / `<u64>.index` are ignored.
pub fn list_base_offsets(dir: &Path) -> Result<Vec<u64>, LogError> {
    let mut offsets = BTreeSet::new();

    for entry in std::fs::read_dir(dir).map_err(|e| LogError::io(dir, e))? {
        let entry = entry.map_err(|e| LogError::io(dir, e))?;
        let name = entry.file_name();
        if let Some(base_offset) = parse_segment_filename(&name.to_string_lossy()) {
            offsets.insert(base_offset);
        }
    }

    Ok(offsets.into_iter().collect())
}

/// A store + index pair covering a contiguous range of offsets.
pub struct Segment {
    base_offset: u64,
    next_offset: u64,
    store: Store,
    index: Index,
    config: SegmentConfig,
    writes_since_sync: u32,
}

impl Segment {
    /// Opens the segment starting at `base_offset`, creating its files if they
    /// do not exist yet.
    pub fn open(dir: &Path, base_offset: u64, config: &SegmentConfig) -> Result<Self, LogError> {
        let store = Store::open(dir.join(store_filename(base_offset)))?;
        let index = Index::open(dir.join(index_filename(base_offset)), config.max_index_bytes)?;

        let mut segment = Self {
            base_offset,
            next_offset: base_offset,
            store,
            index,
            config: config.clone(),
            writes_since_sync: 0,
        };
        segment.recover()?;

        Ok(segment)
    }

    /// Reconciles store and index after an unclean shutdown and derives
    /// `next_offset` from the surviving index entries.
    fn recover(&mut self) -> Result<(), LogError> {
        let indexed = if self.store.size() == 0 {
            0
        } else {
            self.index.len()
        };

        let mut entries = indexed;
        let mut store_end = 0;
        while entries > 0 {
            let (_, position) = self.index.read(entries as i64 - 1)?;
            match self.store.read_at(position) {
                Ok(payload) => {
                    store_end = position + LEN_WIDTH + payload.len() as u64;
                    break;
                }
                Err(LogError::CorruptRecord { .. }) => entries -= 1,
                Err(e) => return Err(e),
            }
        }

        if entries < self.index.len() {
            if entries < indexed {
                tracing::warn!(
                    "Segment {}: dropping {} index entries past end of store",
                    self.base_offset,
                    indexed - entries
                );
            }
            self.index.truncate_entries(entries)?;
        }

        let store_size = self.store.size();
        if store_size > store_end {
            self.store.truncate_at(store_end)?;
            tracing::warn!(
                "Segment {}: truncated {} unindexed store bytes at position {}",
                self.base_offset,
                store_size - store_end,
                store_end
            );
        }

        self.next_offset = match self.index.read(-1) {
            Ok((relative_offset, _)) => self
                .base_offset
                .checked_add(u64::from(relative_offset) + 1)
                .ok_or(LogError::OffsetOverflow {
                    offset: self.base_offset,
                })?,
            Err(LogError::IndexEntryNotFound { .. }) => self.base_offset,
            Err(e) => return Err(e),
        };

        Ok(())
    }

    /// Returns the offset of the first record in this segment.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Returns the offset the next appended record will get.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Returns true if `offset` lies in `[base_offset, next_offset)`.
    pub fn contains(&self, offset: u64) -> bool {
        self.base_offset <= offset && offset < self.next_offset
    }

    /// Returns true if no record has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.next_offset == self.base_offset
    }

    /// Returns the store size in bytes.
    pub fn store_size(&self) -> u64 {
        self.store.size()
    }

    /// Returns the used index size in bytes.
    pub fn index_size(&self) -> u64 {
        self.index.size()
    }

    /// Opens a read handle on the store covering every record appended so far.
    pub fn snapshot(&self) -> Result<(File, u64), LogError> {
        self.store.snapshot()
    }

    /// Returns whether the segment should stop taking appends: the store
    /// reached its size limit, the index has no room for another entry or the
    /// next relative offset no longer fits an index entry.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.is_full()
            || u32::try_from(self.next_offset - self.base_offset).is_err()
    }

    /// Appends a record, returning its assigned offset.
    ///
    /// The store is written before the index; `next_offset` only advances
    /// once both writes succeeded. A crash between the two leaves an
    /// unindexed store tail, which [`Segment::open`] trims. An fsync failure
    /// under [`FsyncPolicy::EveryWrite`] / [`FsyncPolicy::EveryN`] is returned
    /// after the record has already taken its offset.
    ///
    /// Nothing is written when the offset has no successor
    /// ([`LogError::OffsetOverflow`]) or the index cannot take another entry.
    pub fn append(&mut self, value: &[u8]) -> Result<u64, LogError> {
        let offset = self.next_offset;
        let next_offset = offset
            .checked_add(1)
            .ok_or(LogError::OffsetOverflow { offset })?;

        let relative_offset = match u32::try_from(offset - self.base_offset) {
            Ok(relative) if !self.index.is_full() => relative,
            _ => {
                return Err(LogError::IndexFull {
                    path: self.index.path().to_path_buf(),
                    capacity: self.index.capacity(),
                });
            }
        };

        let (position, _) = self.store.append(value)?;
        if let Err(e) = self.index.append(relative_offset, position) {
            if let Err(rollback) = self.store.truncate_at(position) {
                tracing::warn!(
                    "Segment {}: failed to roll back store after index error: {}",
                    self.base_offset,
                    rollback
                );
            }
            return Err(e);
        }

        self.next_offset = next_offset;
        self.maybe_sync()?;

        Ok(offset)
    }

    fn maybe_sync(&mut self) -> Result<(), LogError> {
        match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => self.sync(),
            FsyncPolicy::EveryN(n) => {
                self.writes_since_sync += 1;
                if self.writes_since_sync >= n {
                    self.sync()?;
                }
                Ok(())
            }
            FsyncPolicy::Never => Ok(()),
        }
    }

    /// Flushes and fsyncs store and index.
    pub fn sync(&mut self) -> Result<(), LogError> {
        self.store.sync()?;
        self.index.sync()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Reads the record at `offset`.
    pub fn read(&self, offset: u64) -> Result<Record, LogError> {
        if !self.contains(offset) {
            return Err(LogError::OffsetOutOfRange {
                offset,
                lowest: self.base_offset,
                next: self.next_offset,
            });
        }

        let (_, position) = self.index.read((offset - self.base_offset) as i64)?;
        let value = self.store.read_at(position)?;

        Ok(Record::new(offset, value))
    }

    /// Closes store and index; the index file is cut to its used size.
    pub fn close(&mut self) -> Result<(), LogError> {
        self.store.close()?;
        self.index.close()?;
        tracing::debug!(
            "Closed segment {} (offsets {}..{})",
            self.base_offset,
            self.base_offset,
            self.next_offset
        );
        Ok(())
    }

    /// Closes the segment and deletes both of its files.
    pub fn remove(mut self) -> Result<(), LogError> {
        self.close()?;
        for path in [self.store.path(), self.index.path()] {
            std::fs::remove_file(path).map_err(|e| LogError::io(path, e))?;
        }
        tracing::debug!("Removed segment {}", self.base_offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ENTRY_WIDTH;
    use tempfile::TempDir;

    const PAYLOAD: &[u8] = b"hello world";
    const RECORD_WIDTH: u64 = LEN_WIDTH + PAYLOAD.len() as u64;

    fn config(max_store_bytes: u64, max_index_bytes: u64) -> SegmentConfig {
        SegmentConfig {
            max_store_bytes,
            max_index_bytes,
            ..SegmentConfig::default()
        }
    }

    #[test]
    fn test_segment_filenames() {
        assert_eq!(store_filename(0), "0.store");
        assert_eq!(index_filename(16), "16.index");
        assert_eq!(parse_segment_filename("16.store"), Some(16));
        assert_eq!(parse_segment_filename("16.index"), Some(16));
        assert_eq!(parse_segment_filename("16.wal"), None);
        assert_eq!(parse_segment_filename(".store"), None);
        assert_eq!(parse_segment_filename("+1.index"), None);
        assert_eq!(parse_segment_filename("abc.store"), None);
    }

    #[test]
    fn test_list_base_offsets() {
        let dir = TempDir::new().unwrap();
        for name in ["32.store", "32.index", "0.store", "0.index", "16.index", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        assert_eq!(list_base_offsets(dir.path()).unwrap(), vec![0, 16, 32]);
    }

    #[test]
    fn test_segment_append_read() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 16, &config(1024, 1024)).unwrap();
        assert_eq!(segment.base_offset(), 16);
        assert_eq!(segment.next_offset(), 16);
        assert!(segment.is_empty());
        assert!(!segment.is_maxed());

        for i in 0..3u64 {
            let offset = segment.append(PAYLOAD).unwrap();
            assert_eq!(offset, 16 + i);

            let record = segment.read(offset).unwrap();
            assert_eq!(record.offset, offset);
            assert_eq!(&record.value[..], PAYLOAD);
        }

        assert_eq!(segment.store_size(), RECORD_WIDTH * 3);
        assert_eq!(segment.index_size(), ENTRY_WIDTH * 3);
        assert!(segment.read(15).unwrap_err().is_out_of_range());
        assert!(segment.read(19).unwrap_err().is_out_of_range());
    }

    #[test]
    fn test_segment_maxed_by_index() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, &config(1024, ENTRY_WIDTH * 3)).unwrap();

        for _ in 0..3 {
            assert!(!segment.is_maxed());
            segment.append(PAYLOAD).unwrap();
        }
        assert!(segment.is_maxed());
        assert!(matches!(segment.append(PAYLOAD), Err(LogError::IndexFull { .. })));
        // The rejected append left no trace in the store.
        assert_eq!(segment.store_size(), RECORD_WIDTH * 3);
        assert_eq!(segment.next_offset(), 3);
    }

    #[test]
    fn test_segment_maxed_by_store() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, &config(RECORD_WIDTH * 2, 1024)).unwrap();

        segment.append(PAYLOAD).unwrap();
        assert!(!segment.is_maxed());
        segment.append(PAYLOAD).unwrap();
        assert!(segment.is_maxed());
    }

    #[test]
    fn test_segment_append_at_end_of_offset_space() {
        let dir = TempDir::new().unwrap();
        let config = config(1024, 1024);
        let mut segment = Segment::open(dir.path(), u64::MAX - 1, &config).unwrap();

        assert_eq!(segment.append(PAYLOAD).unwrap(), u64::MAX - 1);
        assert_eq!(segment.next_offset(), u64::MAX);

        assert!(matches!(
            segment.append(PAYLOAD),
            Err(LogError::OffsetOverflow { offset: u64::MAX })
        ));
        assert_eq!(segment.store_size(), RECORD_WIDTH);
        assert_eq!(segment.index_size(), ENTRY_WIDTH);
        assert_eq!(&segment.read(u64::MAX - 1).unwrap().value[..], PAYLOAD);
    }

    #[test]
    fn test_segment_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, &config(1024, 1024)).unwrap();
        segment.append(PAYLOAD).unwrap();

        let (_file, size) = segment.snapshot().unwrap();
        assert_eq!(size, RECORD_WIDTH);

        segment.remove().unwrap();
    }

    #[test]
    fn test_segment_reopen() {
        let dir = TempDir::new().unwrap();
        let config = config(1024, 1024);

        {
            let mut segment = Segment::open(dir.path(), 16, &config).unwrap();
            segment.append(PAYLOAD).unwrap();
            segment.append(b"second").unwrap();
            segment.close().unwrap();
        }

        let mut segment = Segment::open(dir.path(), 16, &config).unwrap();
        assert_eq!(segment.next_offset(), 18);
        assert_eq!(&segment.read(17).unwrap().value[..], b"second");
        assert_eq!(segment.append(PAYLOAD).unwrap(), 18);
    }

    #[test]
    fn test_segment_recovers_unindexed_store_tail() {
        let dir = TempDir::new().unwrap();
        let config = config(1024, 1024);

        {
            let mut segment = Segment::open(dir.path(), 0, &config).unwrap();
            segment.append(PAYLOAD).unwrap();
            segment.append(PAYLOAD).unwrap();
            segment.close().unwrap();
        }

        // A store write whose index entry never made it to disk.
        {
            let store = Store::open(dir.path().join(store_filename(0))).unwrap();
            store.append(b"orphan").unwrap();
            store.close().unwrap();
        }

        let segment = Segment::open(dir.path(), 0, &config).unwrap();
        assert_eq!(segment.next_offset(), 2);
        assert_eq!(segment.store_size(), RECORD_WIDTH * 2);
        assert_eq!(&segment.read(1).unwrap().value[..], PAYLOAD);
    }

    #[test]
    fn test_segment_recovers_empty_unclosed_index() {
        let dir = TempDir::new().unwrap();
        let config = config(1024, 1024);

        {
            let segment = Segment::open(dir.path(), 0, &config).unwrap();
            // Leave the index at its pre-sized, zero-filled length.
            std::mem::forget(segment);
        }

        let mut segment = Segment::open(dir.path(), 0, &config).unwrap();
        assert!(segment.is_empty());
        assert_eq!(segment.append(PAYLOAD).unwrap(), 0);
    }

    #[test]
    fn test_segment_remove() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, &config(1024, 1024)).unwrap();
        segment.append(PAYLOAD).unwrap();

        let store_path = dir.path().join(store_filename(0));
        let index_path = dir.path().join(index_filename(0));
        assert!(store_path.exists());
        assert!(index_path.exists());

        segment.remove().unwrap();
        assert!(!store_path.exists());
        assert!(!index_path.exists());
    }
}
