//! Deferred reclamation entries
//!
//! When a record overwrites or deletes an earlier entry of the same key, the
//! earlier entry becomes garbage as soon as no snapshot can still read it.
//! A `DeletedKeyInfo` row records that fact, keyed by the sequence of the
//! superseding record so reclamation can scan everything below the
//! visibility floor in one ordered range.

use serde::{Deserialize, Serialize};

use super::keys::{decode_deleted_key, deleted_key};
use crate::record::Sequence;
use crate::substrate::{StoreError, StoreResult, Table, WriteBatch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedKeyInfo {
    pub key: Vec<u8>,
    /// Sequence of the record that superseded the entry
    pub deletion_sequence: Sequence,
    /// Sequence of the superseded entry
    pub superseded_sequence: Sequence,
    /// The superseded entry's value lives in `value_blobs`
    pub superseded_external: bool,
    /// The superseding record is a delete
    pub tombstone: bool,
}

#[derive(Serialize, Deserialize)]
struct DeletedKeyRow {
    superseded: Sequence,
    external: bool,
    tombstone: bool,
}

impl DeletedKeyInfo {
    pub fn stage(&self, batch: &mut WriteBatch) -> StoreResult<()> {
        let row = DeletedKeyRow {
            superseded: self.superseded_sequence,
            external: self.superseded_external,
            tombstone: self.tombstone,
        };
        let value = serde_json::to_vec(&row)
            .map_err(|e| StoreError::codec(Table::DeletedKeys.name(), e.to_string()))?;
        batch.put(
            Table::DeletedKeys,
            deleted_key(self.deletion_sequence, &self.key),
            value,
        );
        Ok(())
    }

    pub fn row_key(&self) -> Vec<u8> {
        deleted_key(self.deletion_sequence, &self.key)
    }

    pub fn decode(row_key: &[u8], value: &[u8]) -> StoreResult<Self> {
        let (deletion_sequence, key) = decode_deleted_key(row_key)?;
        let row: DeletedKeyRow = serde_json::from_slice(value)
            .map_err(|e| StoreError::codec(Table::DeletedKeys.name(), e.to_string()))?;
        Ok(Self {
            key,
            deletion_sequence,
            superseded_sequence: row.superseded,
            superseded_external: row.external,
            tombstone: row.tombstone,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_roundtrip() {
        let info = DeletedKeyInfo {
            key: b"a".to_vec(),
            deletion_sequence: Sequence::new(9),
            superseded_sequence: Sequence::new(5),
            superseded_external: false,
            tombstone: true,
        };
        let mut batch = WriteBatch::new();
        info.stage(&mut batch).unwrap();
        let crate::substrate::BatchOp::Put { key, value, .. } = &batch.ops()[0] else {
            panic!("expected put");
        };
        assert_eq!(DeletedKeyInfo::decode(key, value).unwrap(), info);
    }
}
