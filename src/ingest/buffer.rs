//! In-memory write buffer
//!
//! Holds records that are persisted in the key-sequence index but not yet in
//! any delta layer. Records arrive in strictly increasing sequence order, so
//! the buffer is a plain vector searched by sequence.

use crate::record::{ChangeRecord, Sequence};

#[derive(Debug, Default, Clone)]
pub struct WriteBuffer {
    records: Vec<ChangeRecord>,
    bytes: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record; callers guarantee sequence order.
    pub fn push(&mut self, record: ChangeRecord) {
        debug_assert!(self.last_sequence().map_or(true, |last| record.sequence > last));
        self.bytes += record.approximate_size();
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn first_sequence(&self) -> Option<Sequence> {
        self.records.first().map(|r| r.sequence)
    }

    pub fn last_sequence(&self) -> Option<Sequence> {
        self.records.last().map(|r| r.sequence)
    }

    /// Records with `after < sequence <= upto`.
    pub fn between(&self, after: Sequence, upto: Sequence) -> &[ChangeRecord] {
        let lo = self.records.partition_point(|r| r.sequence <= after);
        let hi = self.records.partition_point(|r| r.sequence <= upto);
        if lo >= hi {
            &[]
        } else {
            &self.records[lo..hi]
        }
    }
}
