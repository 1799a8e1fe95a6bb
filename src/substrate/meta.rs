//! Engine counters kept in the `meta` table
//!
//! Each counter is a u64 stored big-endian under a fixed name.

use super::errors::{StoreError, StoreResult};
use super::table::{Table, WriteBatch};
use super::StorageHandle;

/// Highest sequence ingested
pub const WATERMARK: &[u8] = b"watermark";
/// Every sequence <= this value is inside a committed delta layer
pub const FLUSHED_THROUGH: &[u8] = b"flushed_through";
/// History below this sequence may have been physically removed
pub const RECLAIMED_FLOOR: &[u8] = b"reclaimed_floor";
/// Next delta/image layer id
pub const NEXT_LAYER_ID: &[u8] = b"next_layer_id";
/// Next compaction DAG node id
pub const NEXT_NODE_ID: &[u8] = b"next_node_id";

pub fn put_u64(batch: &mut WriteBatch, name: &[u8], value: u64) {
    batch.put(Table::Meta, name.to_vec(), value.to_be_bytes().to_vec());
}

pub fn get_u64(storage: &StorageHandle, name: &[u8]) -> StoreResult<Option<u64>> {
    match storage.get(Table::Meta, name)? {
        None => Ok(None),
        Some(bytes) => {
            let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                StoreError::codec(
                    Table::Meta.name(),
                    format!("counter {} is {} bytes", String::from_utf8_lossy(name), bytes.len()),
                )
            })?;
            Ok(Some(u64::from_be_bytes(raw)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_roundtrip() {
        let storage = StorageHandle::in_memory();
        assert_eq!(get_u64(&storage, WATERMARK).unwrap(), None);
        let mut batch = WriteBatch::new();
        put_u64(&mut batch, WATERMARK, 42);
        storage.commit(&batch).unwrap();
        assert_eq!(get_u64(&storage, WATERMARK).unwrap(), Some(42));
    }
}
