//! Log records.

use bytes::Bytes;

/// A record read back from the log: an opaque payload plus the offset the log
/// assigned to it on append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    pub value: Bytes,
}

impl Record {
    pub fn new(offset: u64, value: impl Into<Bytes>) -> Self {
        Self {
            offset,
            value: value.into(),
        }
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}
