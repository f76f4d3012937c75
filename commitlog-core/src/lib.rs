//! # commitlog-core
//!
//! Segmented, append-only commit log.
//!
//! This crate provides an offset-addressed, durable record log with:
//! - Length-prefixed store files and fixed-width, memory-mapped index files
//! - Segment rotation once a store or index reaches its configured size
//! - Retention by whole-segment truncation
//! - Recovery of segment boundaries from directory contents on reopen

pub mod config;
pub mod error;
pub mod index;
pub mod log;
pub mod reader;
pub mod record;
pub mod segment;
pub mod store;

pub use config::{FsyncPolicy, LogConfig, SegmentConfig, MAX_INDEX_BYTES};
pub use error::LogError;
pub use index::Index;
pub use log::{Appended, Log};
pub use reader::LogReader;
pub use record::Record;
pub use segment::Segment;
pub use store::Store;

/// Default maximum store file size before rotation (1 KiB).
pub const DEFAULT_MAX_STORE_BYTES: u64 = 1024;

/// Default maximum index file size before rotation (1 KiB).
pub const DEFAULT_MAX_INDEX_BYTES: u64 = 1024;

/// Width of a store record's length prefix in bytes.
pub const LEN_WIDTH: u64 = 8;

/// Width of a single index entry in bytes (`u32` relative offset + `u64` position).
pub const ENTRY_WIDTH: u64 = 12;
