//! Coverage index: delta layers by sequence interval
//!
//! One row per layer, keyed start (u64 BE) ‖ layer id (u64 BE), holding the
//! layer's last sequence. The row count follows the number of layers, not
//! the width of their ranges. A lookup scans starts from `first - widest`,
//! where `widest` bounds every indexed layer's span, and keeps the rows
//! whose interval actually reaches `first`.
//!
//! Coverage rows are written in the same batch as the layer's metadata.

use std::collections::BTreeSet;

use crate::record::{Sequence, SequenceRange};
use crate::substrate::{StorageHandle, StoreError, StoreResult, Table, WriteBatch};

use super::LayerId;

fn row_key(start: Sequence, id: LayerId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&start.to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn decode_row(key: &[u8], value: &[u8]) -> StoreResult<(LayerId, Sequence)> {
    if key.len() != 16 || value.len() != 8 {
        return Err(StoreError::codec(Table::LayerCoverage.name(), "bad row length"));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&key[8..]);
    let mut last = [0u8; 8];
    last.copy_from_slice(value);
    Ok((LayerId::new(u64::from_be_bytes(id)), Sequence::from_be_bytes(last)))
}

/// Sequences a range spans beyond its start.
pub fn span(range: SequenceRange) -> u64 {
    range.last().value() - range.start.value()
}

pub fn stage_insert(batch: &mut WriteBatch, id: LayerId, range: SequenceRange) {
    batch.put(
        Table::LayerCoverage,
        row_key(range.start, id),
        range.last().to_be_bytes().to_vec(),
    );
}

pub fn stage_remove(batch: &mut WriteBatch, id: LayerId, range: SequenceRange) {
    batch.delete(Table::LayerCoverage, row_key(range.start, id));
}

/// Layers whose interval intersects `[first, last]`.
///
/// `widest` must be at least the span of every indexed layer.
pub fn candidates(
    storage: &StorageHandle,
    first: Sequence,
    last: Sequence,
    widest: u64,
) -> StoreResult<BTreeSet<LayerId>> {
    let from = Sequence::new(first.value().saturating_sub(widest)).to_be_bytes();
    let to = last.value().checked_add(1).map(|s| s.to_be_bytes());

    let mut ids = BTreeSet::new();
    for (key, value) in storage.range(Table::LayerCoverage, &from, to.as_ref().map(|e| &e[..]))? {
        let (id, layer_last) = decode_row(&key, &value)?;
        if layer_last >= first {
            ids.insert(id);
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64) -> SequenceRange {
        SequenceRange::new(Sequence::new(start), Sequence::new(end))
    }

    fn ids(set: BTreeSet<LayerId>) -> Vec<u64> {
        set.into_iter().map(|id| id.value()).collect()
    }

    #[test]
    fn test_candidates_by_interval() {
        let storage = StorageHandle::in_memory();
        let mut batch = WriteBatch::new();
        stage_insert(&mut batch, LayerId::new(1), range(1, 10));
        stage_insert(&mut batch, LayerId::new(2), range(10, 25));
        stage_insert(&mut batch, LayerId::new(3), range(25, 40));
        storage.commit(&batch).unwrap();

        let widest = 14;
        let found = candidates(&storage, Sequence::new(12), Sequence::new(19), widest).unwrap();
        assert_eq!(ids(found), vec![2]);

        let found = candidates(&storage, Sequence::new(5), Sequence::new(30), widest).unwrap();
        assert_eq!(ids(found), vec![1, 2, 3]);

        let found = candidates(&storage, Sequence::new(9), Sequence::new(9), widest).unwrap();
        assert_eq!(ids(found), vec![1]);
    }

    #[test]
    fn test_sparse_range_is_one_row() {
        let storage = StorageHandle::in_memory();
        let wide = range(1, u64::MAX);
        let mut batch = WriteBatch::new();
        stage_insert(&mut batch, LayerId::new(1), wide);
        storage.commit(&batch).unwrap();
        assert_eq!(storage.count(Table::LayerCoverage).unwrap(), 1);

        let found = candidates(&storage, Sequence::new(1 << 40), Sequence::new(1 << 41), span(wide)).unwrap();
        assert_eq!(ids(found), vec![1]);

        let mut batch = WriteBatch::new();
        stage_remove(&mut batch, LayerId::new(1), wide);
        storage.commit(&batch).unwrap();
        assert_eq!(storage.count(Table::LayerCoverage).unwrap(), 0);
    }
}
