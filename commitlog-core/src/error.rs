//! Commit log error types.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during commit log operations.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("offset out of range: {offset} (retained range starts at {lowest}, next offset is {next})")]
    OffsetOutOfRange { offset: u64, lowest: u64, next: u64 },

    #[error("index {} is full ({capacity} bytes)", .path.display())]
    IndexFull { path: PathBuf, capacity: u64 },

    #[error("index {} has no entry for relative offset {relative_offset}", .path.display())]
    IndexEntryNotFound { path: PathBuf, relative_offset: i64 },

    #[error("corrupt record in {} at position {position}: {reason}", .path.display())]
    CorruptRecord {
        path: PathBuf,
        position: u64,
        reason: String,
    },

    #[error("offset {offset} has no successor; the offset space is exhausted")]
    OffsetOverflow { offset: u64 },

    #[error("log has no segments")]
    Empty,

    #[error("segment file is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LogError {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        LogError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogError::Io { .. })
    }

    /// Returns whether the requested offset was truncated or not yet written.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, LogError::OffsetOutOfRange { .. })
    }
}
