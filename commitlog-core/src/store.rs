//! Append-only record store.
//!
//! A store file is a sequence of length-prefixed records written back to back:
//!
//! ```text
//! +----------------+--------------------+----------------+-----
//! | length (BE)    | payload            | length (BE)    | ...
//! | 8 bytes        | length bytes       | 8 bytes        |
//! +----------------+--------------------+----------------+-----
//! ```
//!
//! Writes are buffered; every read flushes the buffer first, so a reader never
//! observes a length prefix without its payload.

use crate::error::LogError;
use crate::LEN_WIDTH;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

struct StoreInner {
    writer: BufWriter<File>,
    size: u64,
}

/// A single store file.
pub struct Store {
    path: PathBuf,
    inner: Mutex<Option<StoreInner>>,
}

impl Store {
    /// Opens or creates a store file, positioned for appending at its end.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogError::io(&path, e))?;
        let size = file.metadata().map_err(|e| LogError::io(&path, e))?.len();

        Ok(Self {
            path,
            inner: Mutex::new(Some(StoreInner {
                writer: BufWriter::new(file),
                size,
            })),
        })
    }

    /// Returns the store file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current end-of-file position, including buffered bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().as_ref().map(|inner| inner.size).unwrap_or(0)
    }

    /// Appends a record, returning `(position, bytes_written)`.
    pub fn append(&self, payload: &[u8]) -> Result<(u64, u64), LogError> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(LogError::Closed)?;

        let mut buf = BytesMut::with_capacity(LEN_WIDTH as usize + payload.len());
        buf.put_u64(payload.len() as u64);
        buf.put_slice(payload);

        let position = inner.size;
        if let Err(e) = inner.writer.write_all(&buf) {
            // Cut whatever part of the record reached the file. If that fails
            // too, the store stays unusable until reopen recovery trims it.
            let rolled_back = inner
                .writer
                .flush()
                .and_then(|_| inner.writer.get_ref().set_len(position))
                .is_ok();
            if !rolled_back {
                *guard = None;
            }
            return Err(LogError::io(&self.path, e));
        }

        let written = buf.len() as u64;
        inner.size += written;
        Ok((position, written))
    }

    /// Reads the record that starts at `position`.
    pub fn read_at(&self, position: u64) -> Result<Bytes, LogError> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(LogError::Closed)?;
        inner
            .writer
            .flush()
            .map_err(|e| LogError::io(&self.path, e))?;

        if position.saturating_add(LEN_WIDTH) > inner.size {
            return Err(LogError::CorruptRecord {
                path: self.path.clone(),
                position,
                reason: format!(
                    "length prefix extends past end of store ({} bytes)",
                    inner.size
                ),
            });
        }

        let mut file = inner.writer.get_ref();
        file.seek(SeekFrom::Start(position))
            .map_err(|e| LogError::io(&self.path, e))?;

        let mut len = [0u8; LEN_WIDTH as usize];
        file.read_exact(&mut len)
            .map_err(|e| LogError::io(&self.path, e))?;
        let len = u64::from_be_bytes(len);

        if len > inner.size - position - LEN_WIDTH {
            return Err(LogError::CorruptRecord {
                path: self.path.clone(),
                position,
                reason: format!(
                    "payload of {} bytes extends past end of store ({} bytes)",
                    len, inner.size
                ),
            });
        }

        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)
            .map_err(|e| LogError::io(&self.path, e))?;

        Ok(Bytes::from(payload))
    }

    /// Flushes buffered writes and opens a separate read-only handle on the
    /// file, returned with the store size at this moment.
    ///
    /// The handle has its own file position and outlives `close`, so bytes up
    /// to the returned size stay readable after the store is closed or its
    /// file deleted.
    pub fn snapshot(&self) -> Result<(File, u64), LogError> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(LogError::Closed)?;
        inner
            .writer
            .flush()
            .map_err(|e| LogError::io(&self.path, e))?;

        let file = File::open(&self.path).map_err(|e| LogError::io(&self.path, e))?;
        Ok((file, inner.size))
    }

    /// Flushes buffered writes and fsyncs the file.
    pub fn sync(&self) -> Result<(), LogError> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(LogError::Closed)?;
        inner
            .writer
            .flush()
            .map_err(|e| LogError::io(&self.path, e))?;
        inner
            .writer
            .get_ref()
            .sync_data()
            .map_err(|e| LogError::io(&self.path, e))
    }

    /// Truncates the store to `size` bytes (for recovery from partial writes).
    pub fn truncate_at(&self, size: u64) -> Result<(), LogError> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(LogError::Closed)?;
        inner
            .writer
            .flush()
            .map_err(|e| LogError::io(&self.path, e))?;
        inner
            .writer
            .get_ref()
            .set_len(size)
            .map_err(|e| LogError::io(&self.path, e))?;
        inner.size = size;
        Ok(())
    }

    /// Flushes buffered writes and releases the file handle. Idempotent.
    pub fn close(&self) -> Result<(), LogError> {
        let mut guard = self.inner.lock();
        if let Some(mut inner) = guard.take() {
            let result = inner
                .writer
                .flush()
                .and_then(|_| inner.writer.get_ref().sync_all());
            if let Err(e) = result {
                *guard = Some(inner);
                return Err(LogError::io(&self.path, e));
            }
        }
        Ok(())
    }

    /// Returns true once `close` has succeeded.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}
