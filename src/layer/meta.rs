//! Layer metadata rows
//!
//! Delta layer rows are keyed by start ‖ end ‖ layer id (all u64 BE), so the
//! table scans in sequence-range order. Image rows are keyed by
//! sequence ‖ image id.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::MembershipFilter;
use crate::record::{ChangeRecord, Sequence, SequenceRange};
use crate::substrate::{StoreError, StoreResult, Table};

/// Identifier of a delta or image layer
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(u64);

impl LayerId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// How a delta layer came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerOrigin {
    /// Written from the in-memory buffer
    Flush,
    /// Output of a merge
    Compaction,
}

/// Immutable description of one delta layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaLayerMeta {
    pub layer_id: LayerId,
    /// Every record carries a sequence inside this range
    pub range: SequenceRange,
    pub filter: MembershipFilter,
    pub record_count: u64,
    pub tombstone_count: u64,
    /// Encoded content size
    pub byte_size: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    /// Watermark when the layer was committed
    pub generation: Sequence,
    pub origin: LayerOrigin,
    pub created_at: DateTime<Utc>,
}

/// Parameters shared by every layer build.
#[derive(Debug, Clone, Copy)]
pub struct LayerBuildParams {
    pub false_positive_rate: f64,
    pub prefix_len: usize,
}

impl DeltaLayerMeta {
    /// Describe a layer holding `records` (non-empty).
    pub fn build(
        layer_id: LayerId,
        range: SequenceRange,
        records: &[ChangeRecord],
        byte_size: u64,
        generation: Sequence,
        origin: LayerOrigin,
        params: LayerBuildParams,
    ) -> Self {
        let filter = MembershipFilter::build(
            records.iter().map(|r| r.key.as_slice()),
            params.false_positive_rate,
            params.prefix_len,
        );
        let min_key = records.iter().map(|r| &r.key).min().cloned().unwrap_or_default();
        let max_key = records.iter().map(|r| &r.key).max().cloned().unwrap_or_default();
        Self {
            layer_id,
            range,
            filter,
            record_count: records.len() as u64,
            tombstone_count: records.iter().filter(|r| r.is_delete()).count() as u64,
            byte_size,
            min_key,
            max_key,
            generation,
            origin,
            created_at: Utc::now(),
        }
    }

    pub fn row_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(&self.range.start.to_be_bytes());
        key.extend_from_slice(&self.range.end.to_be_bytes());
        key.extend_from_slice(&self.layer_id.to_be_bytes());
        key
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::codec(Table::DeltaLayers.name(), e.to_string()))
    }

    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| StoreError::codec(Table::DeltaLayers.name(), e.to_string()))
    }

    /// Could this layer hold a key under `prefix`?
    pub fn may_match_prefix(&self, prefix: &[u8]) -> bool {
        crate::filter::prefix_overlaps(prefix, &self.min_key, &self.max_key)
            && self.filter.may_contain_prefix(prefix)
    }

    /// Tombstones as a share of all records
    pub fn tombstone_ratio(&self) -> f64 {
        if self.record_count == 0 {
            0.0
        } else {
            self.tombstone_count as f64 / self.record_count as f64
        }
    }
}

/// A full-state checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLayerMeta {
    pub image_id: LayerId,
    /// State includes every record with sequence <= this
    pub sequence: Sequence,
    pub key_count: u64,
    pub byte_size: u64,
    pub filter: MembershipFilter,
    pub created_at: DateTime<Utc>,
}

impl ImageLayerMeta {
    pub fn row_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&self.sequence.to_be_bytes());
        key.extend_from_slice(&self.image_id.to_be_bytes());
        key
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::codec(Table::ImageLayers.name(), e.to_string()))
    }

    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| StoreError::codec(Table::ImageLayers.name(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> LayerBuildParams {
        LayerBuildParams {
            false_positive_rate: 0.01,
            prefix_len: 2,
        }
    }

    fn sample() -> DeltaLayerMeta {
        let records = vec![
            ChangeRecord::put("ab1", 3, "x"),
            ChangeRecord::delete("ab2", 4),
            ChangeRecord::put("cd", 5, "y"),
        ];
        DeltaLayerMeta::build(
            LayerId::new(7),
            SequenceRange::new(Sequence::new(3), Sequence::new(6)),
            &records,
            100,
            Sequence::new(5),
            LayerOrigin::Flush,
            params(),
        )
    }

    #[test]
    fn test_build_summarizes_records() {
        let meta = sample();
        assert_eq!(meta.record_count, 3);
        assert_eq!(meta.tombstone_count, 1);
        assert_eq!(meta.min_key, b"ab1".to_vec());
        assert_eq!(meta.max_key, b"cd".to_vec());
        assert!(meta.filter.may_contain(b"ab2"));
    }

    #[test]
    fn test_prefix_exclusion() {
        let meta = sample();
        assert!(meta.may_match_prefix(b"ab"));
        assert!(!meta.may_match_prefix(b"zz"));
        assert!(!meta.may_match_prefix(b"aa"));
    }

    #[test]
    fn test_row_key_orders_by_range() {
        let meta = sample();
        let mut later = meta.clone();
        later.range = SequenceRange::new(Sequence::new(6), Sequence::new(9));
        later.layer_id = LayerId::new(2);
        assert!(meta.row_key() < later.row_key());
        assert_eq!(DeltaLayerMeta::decode(&meta.encode().unwrap()).unwrap(), meta);
    }
}
