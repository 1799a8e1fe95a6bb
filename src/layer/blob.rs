//! Layer content blobs
//!
//! Content lives in the `layer_blobs` table under a one-byte kind tag and the
//! layer id. Blobs are written in their own batch before the metadata batch
//! that makes the layer visible; a crash in between leaves an orphan that
//! recovery deletes.

use crate::errors::{VaultError, VaultResult};
use crate::record::codec::{decode_records, encode_records};
use crate::record::ChangeRecord;
use crate::substrate::{StorageHandle, StoreError, StoreResult, Table, WriteBatch};

use super::LayerId;

const DELTA_TAG: u8 = b'd';
const IMAGE_TAG: u8 = b'i';

/// Which kind of layer a blob belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    Delta,
    Image,
}

impl BlobKind {
    fn tag(self) -> u8 {
        match self {
            BlobKind::Delta => DELTA_TAG,
            BlobKind::Image => IMAGE_TAG,
        }
    }
}

pub fn blob_key(kind: BlobKind, id: LayerId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(kind.tag());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Split a blob row key into kind and id.
pub fn decode_blob_key(key: &[u8]) -> StoreResult<(BlobKind, LayerId)> {
    if key.len() != 9 {
        return Err(StoreError::codec(Table::LayerBlobs.name(), "bad blob key length"));
    }
    let kind = match key[0] {
        DELTA_TAG => BlobKind::Delta,
        IMAGE_TAG => BlobKind::Image,
        other => {
            return Err(StoreError::codec(
                Table::LayerBlobs.name(),
                format!("unknown blob tag {}", other),
            ))
        }
    };
    let mut id = [0u8; 8];
    id.copy_from_slice(&key[1..]);
    Ok((kind, LayerId::new(u64::from_be_bytes(id))))
}

/// Write layer content; returns the encoded size.
pub fn write_blob(
    storage: &StorageHandle,
    kind: BlobKind,
    id: LayerId,
    records: &[ChangeRecord],
) -> StoreResult<u64> {
    let content = encode_records(records);
    let size = content.len() as u64;
    let mut batch = WriteBatch::new();
    batch.put(Table::LayerBlobs, blob_key(kind, id), content);
    storage.commit(&batch)?;
    Ok(size)
}

pub fn read_blob(storage: &StorageHandle, kind: BlobKind, id: LayerId) -> VaultResult<Vec<ChangeRecord>> {
    let content = storage
        .get(Table::LayerBlobs, &blob_key(kind, id))?
        .ok_or(VaultError::LayerMissing(id))?;
    let records = decode_records(&content)
        .map_err(|e| StoreError::codec(Table::LayerBlobs.name(), format!("{}: {}", id, e)))?;
    Ok(records)
}

pub fn stage_delete_blob(batch: &mut WriteBatch, kind: BlobKind, id: LayerId) {
    batch.delete(Table::LayerBlobs, blob_key(kind, id));
}
