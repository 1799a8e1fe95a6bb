//! ChangeRecord - one mutation observed on the change feed
//!
//! A change record is produced exactly once per upstream mutation and is
//! immutable once persisted. Deletes are explicit records, never a missing
//! value.

use serde::{Deserialize, Serialize};

use super::Sequence;

/// Mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Operation {
    /// Key set to a value
    Put = 0,
    /// Key removed
    Delete = 1,
}

impl Operation {
    /// Convert from u8, returns None for invalid values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Operation::Put),
            1 => Some(Operation::Delete),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Where a record's value lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Value stored next to the history entry.
    Inline(Vec<u8>),
    /// Value externalized into the value blob table, keyed like the entry.
    Blob { len: u64 },
    /// Deletes carry nothing.
    None,
}

impl Payload {
    /// Returns true if the value lives in the value blob table.
    pub fn is_external(&self) -> bool {
        matches!(self, Payload::Blob { .. })
    }

    /// Logical value size in bytes.
    pub fn value_len(&self) -> u64 {
        match self {
            Payload::Inline(v) => v.len() as u64,
            Payload::Blob { len } => *len,
            Payload::None => 0,
        }
    }
}

/// A single mutation of the ordered store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: Vec<u8>,
    pub sequence: Sequence,
    pub operation: Operation,
    pub payload: Payload,
}

impl ChangeRecord {
    /// A put with an inline value.
    pub fn put(key: impl Into<Vec<u8>>, sequence: u64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            sequence: Sequence::new(sequence),
            operation: Operation::Put,
            payload: Payload::Inline(value.into()),
        }
    }

    /// A delete (tombstone).
    pub fn delete(key: impl Into<Vec<u8>>, sequence: u64) -> Self {
        Self {
            key: key.into(),
            sequence: Sequence::new(sequence),
            operation: Operation::Delete,
            payload: Payload::None,
        }
    }

    /// Returns true if this record is a delete.
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// Approximate in-memory footprint, used for flush thresholds.
    pub fn approximate_size(&self) -> usize {
        self.key.len() + self.payload.value_len() as usize + 16
    }

    /// Returns the history entry this record persists as.
    pub fn entry(&self) -> HistoryEntry {
        HistoryEntry {
            sequence: self.sequence,
            operation: self.operation,
            payload: self.payload.clone(),
        }
    }
}

/// The persisted payload of one (key, sequence) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub sequence: Sequence,
    pub operation: Operation,
    pub payload: Payload,
}

impl HistoryEntry {
    /// Returns true if this entry is a tombstone.
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// Rebuilds the full record for `key`.
    pub fn into_record(self, key: Vec<u8>) -> ChangeRecord {
        ChangeRecord {
            key,
            sequence: self.sequence,
            operation: self.operation,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_roundtrip() {
        assert_eq!(Operation::from_u8(Operation::Put.as_u8()), Some(Operation::Put));
        assert_eq!(Operation::from_u8(1), Some(Operation::Delete));
        assert_eq!(Operation::from_u8(9), None);
    }

    #[test]
    fn test_delete_has_no_payload() {
        let record = ChangeRecord::delete("a", 9);
        assert!(record.is_delete());
        assert_eq!(record.payload, Payload::None);
    }

    #[test]
    fn test_entry_keeps_sequence() {
        let record = ChangeRecord::put("a", 5, "y");
        let entry = record.entry();
        assert_eq!(entry.sequence, Sequence::new(5));
        assert!(!entry.is_delete());
        assert_eq!(entry.into_record(b"a".to_vec()), record);
    }
}
