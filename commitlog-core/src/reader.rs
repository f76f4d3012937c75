//! Whole-log byte stream.

use std::fs::File;
use std::io::{self, Read, Take};

/// Sequential reader over the raw contents of every store in a log, oldest
/// segment first.
///
/// The set of segments and the end of each store are captured when the reader
/// is created; records appended afterwards are not returned. The reader holds
/// its own handle on each store file, so truncating, closing or removing the
/// log while it streams does not affect it. The stream is the concatenation of
/// the store files, i.e. length-prefixed records.
pub struct LogReader {
    stores: Vec<Take<File>>,
    current: usize,
    total_len: u64,
}

impl LogReader {
    pub(crate) fn new(stores: Vec<(File, u64)>) -> Self {
        let total_len = stores.iter().map(|(_, end)| end).sum();
        Self {
            stores: stores
                .into_iter()
                .map(|(file, end)| file.take(end))
                .collect(),
            current: 0,
            total_len,
        }
    }

    /// Returns the total number of bytes this reader yields from start to end.
    pub fn total_len(&self) -> u64 {
        self.total_len
    }
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while let Some(store) = self.stores.get_mut(self.current) {
            if store.limit() == 0 {
                self.current += 1;
                continue;
            }

            let n = store.read(buf)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "store file ended {} bytes short of its captured size",
                        store.limit()
                    ),
                ));
            }
            return Ok(n);
        }

        Ok(0)
    }
}
