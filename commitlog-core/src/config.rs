//! Commit log configuration.

use crate::error::LogError;
use crate::{DEFAULT_MAX_INDEX_BYTES, DEFAULT_MAX_STORE_BYTES, ENTRY_WIDTH};
use serde::{Deserialize, Serialize};

/// Largest index whose entries can all be addressed by a `u32` relative offset.
pub const MAX_INDEX_BYTES: u64 = ENTRY_WIDTH * (u32::MAX as u64 + 1);

/// Fsync policy for segment writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Buffer writes; flush before reads and on close (fastest).
    #[default]
    Never,
    /// Flush and fsync store and index after every append (safest, slowest).
    EveryWrite,
    /// Flush and fsync after N appends to the same segment.
    EveryN(u32),
}

/// Per-segment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Maximum store file size before rotation.
    pub max_store_bytes: u64,
    /// Maximum index file size before rotation. The index is pre-sized to this.
    pub max_index_bytes: u64,
    /// Offset assigned to the first record of a brand-new log.
    pub initial_offset: u64,
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: DEFAULT_MAX_STORE_BYTES,
            max_index_bytes: DEFAULT_MAX_INDEX_BYTES,
            initial_offset: 0,
            fsync_policy: FsyncPolicy::default(),
        }
    }
}

/// Commit log configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub segment: SegmentConfig,
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_store_bytes(mut self, bytes: u64) -> Self {
        self.segment.max_store_bytes = bytes;
        self
    }

    pub fn with_max_index_bytes(mut self, bytes: u64) -> Self {
        self.segment.max_index_bytes = bytes;
        self
    }

    pub fn with_initial_offset(mut self, offset: u64) -> Self {
        self.segment.initial_offset = offset;
        self
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.segment.fsync_policy = policy;
        self
    }

    /// Replaces unset (zero) size limits with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.segment.max_store_bytes == 0 {
            self.segment.max_store_bytes = DEFAULT_MAX_STORE_BYTES;
        }
        if self.segment.max_index_bytes == 0 {
            self.segment.max_index_bytes = DEFAULT_MAX_INDEX_BYTES;
        }
        self
    }

    /// Checks that the configuration can hold at least one record per segment
    /// and that every index slot is addressable by a relative offset.
    pub fn validate(&self) -> Result<(), LogError> {
        if self.segment.max_index_bytes < ENTRY_WIDTH {
            return Err(LogError::InvalidConfig(format!(
                "max_index_bytes ({}) must fit at least one {}-byte index entry",
                self.segment.max_index_bytes, ENTRY_WIDTH
            )));
        }
        if self.segment.max_index_bytes > MAX_INDEX_BYTES {
            return Err(LogError::InvalidConfig(format!(
                "max_index_bytes ({}) exceeds the {} bytes addressable by u32 relative offsets",
                self.segment.max_index_bytes, MAX_INDEX_BYTES
            )));
        }
        if self.segment.fsync_policy == FsyncPolicy::EveryN(0) {
            return Err(LogError::InvalidConfig(
                "fsync_policy every_n requires n > 0".to_string(),
            ));
        }
        Ok(())
    }
}
