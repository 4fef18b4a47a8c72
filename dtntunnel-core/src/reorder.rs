//! Per-flow reorder buffer.
//!
//! Bundles reach the tunnel in whatever order the transport delivers them.
//! The reorder buffer turns that into a strictly ordered sequence: items at
//! the expected sequence number are released together with any now-contiguous
//! successors, later items wait, and earlier ones are duplicates.
//!
//! There is no timeout on waiting for a gap to fill. End-to-end delay is owned
//! by the transport and may be arbitrarily long.

use std::collections::BTreeMap;

/// Default cap on out-of-order items held for one flow
pub const DEFAULT_MAX_BUFFERED: usize = 4096;

/// Reorder buffer errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReorderError {
    #[error("Duplicate bundle: sequence {seqno}, expected {expected}")]
    Duplicate { seqno: u32, expected: u32 },

    #[error("Reorder buffer full: {0} bundles waiting")]
    BufferFull(usize),
}

/// Reorder buffer for one direction of one flow
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    /// Expected next sequence number
    next_expected: u32,
    /// Items waiting for a gap to fill
    buffer: BTreeMap<u32, T>,
    /// Maximum number of waiting items
    max_size: usize,
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_BUFFERED)
    }

    /// Create a reorder buffer holding at most `max_size` out-of-order items
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            next_expected: 0,
            buffer: BTreeMap::new(),
            max_size,
        }
    }

    /// Offer an item and collect everything that is now in order.
    ///
    /// The returned items are in ascending sequence order and are never
    /// returned again. An empty vector means the item was buffered.
    pub fn push(&mut self, seqno: u32, item: T) -> Result<Vec<T>, ReorderError> {
        if seqno < self.next_expected || self.buffer.contains_key(&seqno) {
            return Err(ReorderError::Duplicate {
                seqno,
                expected: self.next_expected,
            });
        }

        if seqno > self.next_expected {
            if self.buffer.len() >= self.max_size {
                return Err(ReorderError::BufferFull(self.buffer.len()));
            }
            self.buffer.insert(seqno, item);
            return Ok(Vec::new());
        }

        let mut ready = vec![item];
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(next) = self.buffer.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        Ok(ready)
    }

    /// Get the next expected sequence number
    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// Number of items waiting for a gap to fill
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_expected = 0;
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
