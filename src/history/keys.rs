//! Row key layout for the history tables
//!
//! `key_history` and `value_blobs`: key length (u32 BE) ‖ key ‖ sequence (u64 BE)
//! `deleted_keys`: deletion sequence (u64 BE) ‖ key
//!
//! The length prefix keeps one key's entries contiguous and stops a key from
//! interleaving with a longer key it prefixes.

use crate::record::Sequence;
use crate::substrate::{StoreError, StoreResult, Table};

/// Prefix shared by every history row of `key`.
pub fn history_prefix(key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len());
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf
}

/// Row key of `key` at `sequence`.
pub fn history_key(key: &[u8], sequence: Sequence) -> Vec<u8> {
    let mut buf = history_prefix(key);
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf
}

/// Split a history row key back into user key and sequence.
pub fn decode_history_key(row: &[u8]) -> StoreResult<(Vec<u8>, Sequence)> {
    let malformed = || StoreError::codec(Table::KeyHistory.name(), "truncated row key");
    if row.len() < 12 {
        return Err(malformed());
    }
    let len = u32::from_be_bytes([row[0], row[1], row[2], row[3]]) as usize;
    if row.len() != 4 + len + 8 {
        return Err(malformed());
    }
    let key = row[4..4 + len].to_vec();
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&row[4 + len..]);
    Ok((key, Sequence::from_be_bytes(seq)))
}

/// Row key of a deferred reclamation entry.
pub fn deleted_key(deletion: Sequence, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + key.len());
    buf.extend_from_slice(&deletion.to_be_bytes());
    buf.extend_from_slice(key);
    buf
}

pub fn decode_deleted_key(row: &[u8]) -> StoreResult<(Sequence, Vec<u8>)> {
    if row.len() < 8 {
        return Err(StoreError::codec(
            Table::DeletedKeys.name(),
            "truncated row key",
        ));
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&row[..8]);
    Ok((Sequence::from_be_bytes(seq), row[8..].to_vec()))
}
