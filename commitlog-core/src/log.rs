//! Segmented commit log.

use crate::config::LogConfig;
use crate::error::LogError;
use crate::reader::LogReader;
use crate::record::Record;
use crate::segment::{list_base_offsets, Segment};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};

/// Outcome of a successful append.
///
/// The record is durable at `offset` regardless of `rotation_error`. A failed
/// rotation leaves the full segment active; the next append retries the
/// rotation before writing.
#[derive(Debug)]
#[must_use]
pub struct Appended {
    /// Offset assigned to the record.
    pub offset: u64,
    /// Set when the active segment filled up and a new one could not be created.
    pub rotation_error: Option<LogError>,
}

/// Append-only log of records split across segment files.
///
/// The segment list is kept sorted by base offset; the last segment is the
/// active one and the only one taking appends.
pub struct Log {
    dir: PathBuf,
    config: LogConfig,
    segments: RwLock<Vec<Segment>>,
}

impl Log {
    /// Opens the log in `dir`, reopening every segment found there or creating
    /// a first segment at the configured initial offset.
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig) -> Result<Self, LogError> {
        let config = config.normalized();
        config.validate()?;

        let log = Self {
            dir: dir.into(),
            config,
            segments: RwLock::new(Vec::new()),
        };

        {
            let mut segments = log.segments.write();
            log.setup(&mut segments)?;
            tracing::info!(
                "Log opened at {}: {} segments, offsets {}..{}",
                log.dir.display(),
                segments.len(),
                segments.first().map(Segment::base_offset).unwrap_or_default(),
                segments.last().map(Segment::next_offset).unwrap_or_default()
            );
        }

        Ok(log)
    }

    fn setup(&self, segments: &mut Vec<Segment>) -> Result<(), LogError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| LogError::io(&self.dir, e))?;

        for base_offset in list_base_offsets(&self.dir)? {
            segments.push(Segment::open(&self.dir, base_offset, &self.config.segment)?);
        }

        if segments.is_empty() {
            segments.push(Segment::open(
                &self.dir,
                self.config.segment.initial_offset,
                &self.config.segment,
            )?);
        }

        Ok(())
    }

    /// Creates a new active segment starting at the current active segment's
    /// next offset.
    fn rotate(&self, segments: &mut Vec<Segment>) -> Result<(), LogError> {
        let base_offset = segments
            .last()
            .map(Segment::next_offset)
            .ok_or(LogError::Empty)?;

        segments.push(Segment::open(&self.dir, base_offset, &self.config.segment)?);
        tracing::debug!("Rotated to segment {}", base_offset);
        Ok(())
    }

    /// Appends a record, assigning it the next offset.
    pub fn append(&self, value: &[u8]) -> Result<Appended, LogError> {
        let mut segments = self.segments.write();

        let active = segments.last().ok_or(LogError::Empty)?;
        if active.is_maxed() && !active.is_empty() {
            self.rotate(&mut segments)?;
        }

        let active = segments.last_mut().ok_or(LogError::Empty)?;
        let offset = active.append(value)?;

        let rotation_error = if active.is_maxed() {
            self.rotate(&mut segments).err()
        } else {
            None
        };
        if let Some(e) = &rotation_error {
            tracing::warn!("Appended offset {} but rotation failed: {}", offset, e);
        }

        Ok(Appended {
            offset,
            rotation_error,
        })
    }

    /// Reads the record at `offset`.
    pub fn read(&self, offset: u64) -> Result<Record, LogError> {
        let segments = self.segments.read();
        let (lowest, next) = match (segments.first(), segments.last()) {
            (Some(first), Some(last)) => (first.base_offset(), last.next_offset()),
            _ => return Err(LogError::Empty),
        };

        let segment = segments
            .partition_point(|s| s.base_offset() <= offset)
            .checked_sub(1)
            .map(|i| &segments[i])
            .filter(|s| s.contains(offset));

        match segment {
            Some(segment) => segment.read(offset),
            None => Err(LogError::OffsetOutOfRange {
                offset,
                lowest,
                next,
            }),
        }
    }

    /// Returns the base offset of the oldest segment.
    pub fn lowest_offset(&self) -> Result<u64, LogError> {
        self.segments
            .read()
            .first()
            .map(Segment::base_offset)
            .ok_or(LogError::Empty)
    }

    /// Returns the offset of the most recently appended record
    /// (`next_offset - 1` of the active segment, or 0 when that is 0).
    pub fn highest_offset(&self) -> Result<u64, LogError> {
        let next = self
            .segments
            .read()
            .last()
            .map(Segment::next_offset)
            .ok_or(LogError::Empty)?;
        Ok(next.saturating_sub(1))
    }

    /// Removes every segment whose records all have offsets `<= lowest`.
    ///
    /// The active segment is never removed. Returns the number of segments
    /// deleted. If deleting a segment fails, the segments before it are gone,
    /// the failing one is dropped from the log and the rest are kept.
    pub fn truncate(&self, lowest: u64) -> Result<usize, LogError> {
        let mut segments = self.segments.write();
        let floor = lowest.saturating_add(1);

        let inactive = segments.len().saturating_sub(1);
        let doomed = segments[..inactive]
            .iter()
            .take_while(|s| s.next_offset() <= floor)
            .count();

        for _ in 0..doomed {
            let segment = segments.remove(0);
            let base_offset = segment.base_offset();
            segment.remove()?;
            tracing::info!("Truncated segment {} (below offset {})", base_offset, lowest);
        }

        Ok(doomed)
    }

    /// Returns a reader over the raw store bytes of every segment as of now.
    ///
    /// The reader keeps its own file handles, so a later `truncate`, `close`
    /// or `remove` does not cut the stream short.
    pub fn reader(&self) -> Result<LogReader, LogError> {
        let stores = self
            .segments
            .read()
            .iter()
            .map(Segment::snapshot)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LogReader::new(stores))
    }

    /// Flushes and fsyncs the active segment.
    pub fn sync(&self) -> Result<(), LogError> {
        self.segments
            .write()
            .last_mut()
            .ok_or(LogError::Empty)?
            .sync()
    }

    /// Closes every segment in order, stopping at the first error.
    ///
    /// Closed segments leave the log; the failing segment and every segment
    /// after it stay open and in place.
    pub fn close(&self) -> Result<(), LogError> {
        let mut segments = self.segments.write();
        Self::close_segments(&mut segments)
    }

    fn close_segments(segments: &mut Vec<Segment>) -> Result<(), LogError> {
        let mut closed = 0;
        let result = segments.iter_mut().try_for_each(|segment| {
            segment.close()?;
            closed += 1;
            Ok::<(), LogError>(())
        });
        segments.drain(..closed);
        result
    }

    fn remove_dir(&self) -> Result<(), LogError> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LogError::io(&self.dir, e)),
        }
    }

    /// Closes the log and deletes its directory.
    pub fn remove(&self) -> Result<(), LogError> {
        let mut segments = self.segments.write();
        Self::close_segments(&mut segments)?;
        self.remove_dir()?;
        tracing::info!("Removed log at {}", self.dir.display());
        Ok(())
    }

    /// Removes the log and sets it up again, empty, at the initial offset.
    pub fn reset(&self) -> Result<(), LogError> {
        let mut segments = self.segments.write();
        Self::close_segments(&mut segments)?;
        self.remove_dir()?;
        self.setup(&mut segments)?;
        tracing::info!(
            "Reset log at {} to offset {}",
            self.dir.display(),
            self.config.segment.initial_offset
        );
        Ok(())
    }

    /// Returns the log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the effective configuration.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Returns the number of open segments.
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Returns the base offsets of all open segments, ascending.
    pub fn base_offsets(&self) -> Vec<u64> {
        self.segments.read().iter().map(Segment::base_offset).collect()
    }

    /// Returns the total size of all stores in bytes.
    pub fn total_size(&self) -> u64 {
        self.segments.read().iter().map(Segment::store_size).sum()
    }
}
