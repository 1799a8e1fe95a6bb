//! Logical tables and atomic write batches
//!
//! Every table is an ordered byte-keyed map. Keys are built so that byte
//! order matches the order the engine scans in (big-endian sequences,
//! length-prefixed user keys).

use std::collections::BTreeMap;

/// Frame header plus op count
const FRAME_OVERHEAD: usize = 12;
/// Op kind, table tag, key and value lengths
const PUT_OVERHEAD: usize = 10;

/// Logical tables held by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Table {
    /// Delta layer metadata, keyed by start ‖ end ‖ layer id
    DeltaLayers = 0,
    /// Image layer metadata, keyed by sequence ‖ image id
    ImageLayers = 1,
    /// Key-sequence history, keyed by len(key) ‖ key ‖ sequence
    KeyHistory = 2,
    /// Layer coverage index, keyed by start sequence ‖ layer id
    LayerCoverage = 3,
    /// Deferred reclamation entries, keyed by deletion sequence ‖ key
    DeletedKeys = 4,
    /// Layer content, keyed by layer id (delta) or tagged image id
    LayerBlobs = 5,
    /// Externalized values, keyed like KeyHistory
    ValueBlobs = 6,
    /// Compaction DAG nodes, keyed by node id
    CompactionNodes = 7,
    /// Compaction DAG edges, keyed by from ‖ to
    CompactionEdges = 8,
    /// Snapshot points, keyed by snapshot id
    Snapshots = 9,
    /// Engine watermarks and counters
    Meta = 10,
    /// Snapshot diff jobs, keyed by from snapshot id ‖ to snapshot id
    DiffJobs = 11,
    /// Finished diff job entries, keyed by job id ‖ entry index
    DiffReports = 12,
}

impl Table {
    /// All tables, in tag order.
    pub const ALL: [Table; 13] = [
        Table::DeltaLayers,
        Table::ImageLayers,
        Table::KeyHistory,
        Table::LayerCoverage,
        Table::DeletedKeys,
        Table::LayerBlobs,
        Table::ValueBlobs,
        Table::CompactionNodes,
        Table::CompactionEdges,
        Table::Snapshots,
        Table::Meta,
        Table::DiffJobs,
        Table::DiffReports,
    ];

    /// Convert from u8, returns None for invalid values
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Convert to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Table name for logs and errors
    pub fn name(self) -> &'static str {
        match self {
            Table::DeltaLayers => "delta_layers",
            Table::ImageLayers => "image_layers",
            Table::KeyHistory => "key_history",
            Table::LayerCoverage => "layer_coverage",
            Table::DeletedKeys => "deleted_keys",
            Table::LayerBlobs => "layer_blobs",
            Table::ValueBlobs => "value_blobs",
            Table::CompactionNodes => "compaction_nodes",
            Table::CompactionEdges => "compaction_edges",
            Table::Snapshots => "snapshots",
            Table::Meta => "meta",
            Table::DiffJobs => "diff_jobs",
            Table::DiffReports => "diff_reports",
        }
    }
}

/// A single mutation inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        table: Table,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: Vec<u8>,
    },
}

/// An all-or-nothing group of mutations.
///
/// Either every operation of a committed batch is visible after a crash,
/// or none of them is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an insert or overwrite
    pub fn put(&mut self, table: Table, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            table,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Queue a removal
    pub fn delete(&mut self, table: Table, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete {
            table,
            key: key.into(),
        });
    }

    /// Append every operation of `other`
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queued operations, in commit order
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// In-memory image of every table.
#[derive(Debug, Default, Clone)]
pub struct Tables {
    maps: BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Tables {
    /// Create empty tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch in order
    pub fn apply(&mut self, batch: &WriteBatch) {
        for op in batch.ops() {
            match op {
                BatchOp::Put { table, key, value } => {
                    self.maps
                        .entry(*table)
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                BatchOp::Delete { table, key } => {
                    if let Some(map) = self.maps.get_mut(table) {
                        map.remove(key);
                    }
                }
            }
        }
    }

    /// Point lookup
    pub fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        self.maps.get(&table).and_then(|m| m.get(key).cloned())
    }

    /// Ordered scan of `[start, end)`; `end = None` means unbounded.
    pub fn range(&self, table: Table, start: &[u8], end: Option<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let Some(map) = self.maps.get(&table) else {
            return Vec::new();
        };
        let iter = map.range(start.to_vec()..);
        match end {
            Some(end) => iter
                .take_while(|(k, _)| k.as_slice() < end)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => iter.map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    /// Last entry of `[start, end)`, if any.
    pub fn last_in_range(&self, table: Table, start: &[u8], end: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let map = self.maps.get(&table)?;
        if start >= end {
            return None;
        }
        map.range(start.to_vec()..end.to_vec())
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Number of rows in a table
    pub fn count(&self, table: Table) -> usize {
        self.maps.get(&table).map(|m| m.len()).unwrap_or(0)
    }

    /// Size of a log holding exactly these rows, one frame per table.
    pub fn encoded_size(&self) -> u64 {
        self.maps
            .values()
            .filter(|m| !m.is_empty())
            .map(|m| {
                let rows: usize = m.iter().map(|(k, v)| PUT_OVERHEAD + k.len() + v.len()).sum();
                (FRAME_OVERHEAD + rows) as u64
            })
            .sum()
    }

    /// Every row of every table, for log rewrites
    pub fn iter_all(&self) -> impl Iterator<Item = (Table, &Vec<u8>, &Vec<u8>)> {
        self.maps
            .iter()
            .flat_map(|(t, m)| m.iter().map(move |(k, v)| (*t, k, v)))
    }
}

/// Smallest key strictly greater than every key starting with `prefix`.
///
/// Returns None when no such bound exists (prefix is all 0xFF).
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xFF {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_tag_roundtrip() {
        for table in Table::ALL {
            assert_eq!(Table::from_u8(table.as_u8()), Some(table));
        }
        assert_eq!(Table::from_u8(200), None);
    }

    #[test]
    fn test_batch_applies_in_order() {
        let mut tables = Tables::new();
        let mut batch = WriteBatch::new();
        batch.put(Table::Meta, b"k".to_vec(), b"1".to_vec());
        batch.delete(Table::Meta, b"k".to_vec());
        batch.put(Table::Meta, b"k".to_vec(), b"2".to_vec());
        tables.apply(&batch);
        assert_eq!(tables.get(Table::Meta, b"k"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_range_and_last() {
        let mut tables = Tables::new();
        let mut batch = WriteBatch::new();
        for k in [b"a1", b"a2", b"b1"] {
            batch.put(Table::KeyHistory, k.to_vec(), k.to_vec());
        }
        tables.apply(&batch);

        let rows = tables.range(Table::KeyHistory, b"a", Some(b"b"));
        assert_eq!(rows.len(), 2);
        let last = tables.last_in_range(Table::KeyHistory, b"a", b"b").unwrap();
        assert_eq!(last.0, b"a2".to_vec());
        assert!(tables.last_in_range(Table::KeyHistory, b"c", b"d").is_none());
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_upper_bound(&[0x01, 0xFF]), Some(vec![0x02]));
        assert_eq!(prefix_upper_bound(&[0xFF, 0xFF]), None);
    }
}
