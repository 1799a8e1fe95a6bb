//! Key-sequence index
//!
//! The persisted `key_history` table is the source of truth for point reads:
//! every ingested record is committed here before it is acknowledged, so a
//! lookup is correct regardless of what has been flushed into layers.
//!
//! Lookup is a floor search over one key's entries. Entries are loaded from
//! the substrate on a cache miss and kept in a bounded TTL cache. Ingest
//! appends to a cached history; reclaiming a key invalidates it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::cache::{CacheStats, HistoryCache};
use super::deleted::DeletedKeyInfo;
use super::keys::{decode_history_key, history_key, history_prefix};
use crate::errors::{VaultError, VaultResult};
use crate::record::codec::{decode_entry, encode_entry};
use crate::record::{ChangeRecord, HistoryEntry, Payload, Sequence};
use crate::substrate::meta::{self, RECLAIMED_FLOOR};
use crate::substrate::{StorageHandle, StoreError, StoreResult, Table, WriteBatch};

#[derive(Debug)]
pub struct KeySequenceIndex {
    storage: StorageHandle,
    cache: Mutex<HistoryCache>,
    inline_value_limit: usize,
    /// 0 while nothing has been reclaimed
    reclaimed_floor: AtomicU64,
}

impl KeySequenceIndex {
    pub fn new(
        storage: StorageHandle,
        cache_max_entries: usize,
        cache_ttl: Duration,
        inline_value_limit: usize,
    ) -> Self {
        Self {
            storage,
            cache: Mutex::new(HistoryCache::new(cache_max_entries, cache_ttl)),
            inline_value_limit,
            reclaimed_floor: AtomicU64::new(0),
        }
    }

    /// Reload persisted state after open.
    pub fn load(&self) -> VaultResult<()> {
        let floor = meta::get_u64(&self.storage, RECLAIMED_FLOOR)?.unwrap_or(0);
        self.reclaimed_floor.store(floor, Ordering::SeqCst);
        self.lock_cache()?.clear();
        Ok(())
    }

    fn lock_cache(&self) -> VaultResult<MutexGuard<'_, HistoryCache>> {
        self.cache
            .lock()
            .map_err(|_| VaultError::LockPoisoned("history cache"))
    }

    /// Lowest sequence reads are still answered for, if anything was reclaimed.
    pub fn reclaimed_floor(&self) -> Option<Sequence> {
        match self.reclaimed_floor.load(Ordering::SeqCst) {
            0 => None,
            floor => Some(Sequence::new(floor)),
        }
    }

    /// Fail with `HistoryReclaimed` if `target` is below the reclaimed floor.
    pub fn check_readable(&self, target: Sequence) -> VaultResult<()> {
        match self.reclaimed_floor() {
            Some(floor) if target < floor => Err(VaultError::HistoryReclaimed {
                requested: target,
                floor,
            }),
            _ => Ok(()),
        }
    }

    /// Persist a new reclaimed floor as part of `batch`.
    pub fn stage_reclaimed_floor(&self, batch: &mut WriteBatch, floor: Sequence) {
        meta::put_u64(batch, RECLAIMED_FLOOR, floor.value());
    }

    /// Publish a reclaimed floor after its batch committed.
    pub fn raise_reclaimed_floor(&self, floor: Sequence) {
        self.reclaimed_floor
            .fetch_max(floor.value(), Ordering::SeqCst);
    }

    /// Every entry of `key`, ordered by sequence.
    pub fn entries(&self, key: &[u8]) -> VaultResult<Arc<Vec<HistoryEntry>>> {
        let ticket = {
            let mut cache = self.lock_cache()?;
            if let Some(hit) = cache.get(key) {
                return Ok(hit);
            }
            cache.begin_load(key)
        };

        match self.load_entries(key) {
            Ok(entries) => {
                let entries = Arc::new(entries);
                self.lock_cache()?
                    .insert(key.to_vec(), Arc::clone(&entries), ticket);
                Ok(entries)
            }
            Err(err) => {
                self.lock_cache()?.abandon(key, ticket);
                Err(err)
            }
        }
    }

    fn load_entries(&self, key: &[u8]) -> VaultResult<Vec<HistoryEntry>> {
        let rows = self
            .storage
            .scan_prefix(Table::KeyHistory, &history_prefix(key))?;
        let mut entries = Vec::with_capacity(rows.len());
        for (row_key, value) in rows {
            let (_, sequence) = decode_history_key(&row_key)?;
            let entry = decode_entry(sequence, &value)
                .map_err(|e| StoreError::codec(Table::KeyHistory.name(), e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Entry with the greatest sequence <= `target`.
    pub fn floor_entry(&self, key: &[u8], target: Sequence) -> VaultResult<Option<HistoryEntry>> {
        let entries = self.entries(key)?;
        let idx = entries.partition_point(|e| e.sequence <= target);
        Ok(idx.checked_sub(1).map(|i| entries[i].clone()))
    }

    /// Latest entry of `key`, if any.
    pub fn latest_entry(&self, key: &[u8]) -> VaultResult<Option<HistoryEntry>> {
        Ok(self.entries(key)?.last().cloned())
    }

    /// Value of `key` as of `target`; `None` if deleted or never written.
    pub fn get_key_at_sequence(&self, key: &[u8], target: Sequence) -> VaultResult<Option<Vec<u8>>> {
        self.check_readable(target)?;
        match self.floor_entry(key, target)? {
            None => Ok(None),
            Some(entry) => self.resolve(key, &entry),
        }
    }

    /// Materialize an entry's value, following externalized payloads.
    pub fn resolve(&self, key: &[u8], entry: &HistoryEntry) -> VaultResult<Option<Vec<u8>>> {
        self.resolve_payload(key, entry.sequence, &entry.payload)
    }

    pub fn resolve_payload(
        &self,
        key: &[u8],
        sequence: Sequence,
        payload: &Payload,
    ) -> VaultResult<Option<Vec<u8>>> {
        match payload {
            Payload::None => Ok(None),
            Payload::Inline(value) => Ok(Some(value.clone())),
            Payload::Blob { .. } => self
                .storage
                .get(Table::ValueBlobs, &history_key(key, sequence))?
                .map(Some)
                .ok_or_else(|| VaultError::payload_missing(key, sequence)),
        }
    }

    /// Stage the rows persisting `record`.
    ///
    /// Returns the record as stored: large values are moved to `value_blobs`
    /// and replaced by a blob reference. If the key already had an entry, a
    /// deferred reclamation row for that entry is staged too.
    pub fn stage_ingest(
        &self,
        batch: &mut WriteBatch,
        record: ChangeRecord,
    ) -> VaultResult<(ChangeRecord, Option<DeletedKeyInfo>)> {
        let row_key = history_key(&record.key, record.sequence);

        let payload = match record.payload {
            Payload::Inline(value) if value.len() > self.inline_value_limit => {
                let len = value.len() as u64;
                batch.put(Table::ValueBlobs, row_key.clone(), value);
                Payload::Blob { len }
            }
            other => other,
        };
        let stored = ChangeRecord {
            key: record.key,
            sequence: record.sequence,
            operation: record.operation,
            payload,
        };
        batch.put(
            Table::KeyHistory,
            row_key,
            encode_entry(stored.operation, &stored.payload),
        );

        let superseded = self.latest_entry(&stored.key)?.map(|prev| DeletedKeyInfo {
            key: stored.key.clone(),
            deletion_sequence: stored.sequence,
            superseded_sequence: prev.sequence,
            superseded_external: prev.payload.is_external(),
            tombstone: stored.is_delete(),
        });
        if let Some(info) = &superseded {
            info.stage(batch)?;
        }
        Ok((stored, superseded))
    }

    /// Publish a record whose rows committed.
    pub fn committed(&self, record: &ChangeRecord) -> VaultResult<()> {
        self.lock_cache()?.append(&record.key, record.entry());
        Ok(())
    }

    /// Drop the cached history of `key`.
    pub fn invalidate(&self, key: &[u8]) -> VaultResult<()> {
        self.lock_cache()?.invalidate(key);
        Ok(())
    }

    /// Every persisted record with sequence > `after`, in sequence order.
    ///
    /// Used on restart to rebuild the unflushed write buffer.
    pub fn records_after(&self, after: Sequence) -> StoreResult<Vec<ChangeRecord>> {
        let mut records = Vec::new();
        for (row_key, value) in self.storage.range(Table::KeyHistory, &[], None)? {
            let (key, sequence) = decode_history_key(&row_key)?;
            if sequence <= after {
                continue;
            }
            let entry = decode_entry(sequence, &value)
                .map_err(|e| StoreError::codec(Table::KeyHistory.name(), e.to_string()))?;
            records.push(entry.into_record(key));
        }
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    /// Deferred reclamation rows with deletion sequence < `floor`.
    pub fn deleted_below(&self, floor: Sequence) -> StoreResult<Vec<DeletedKeyInfo>> {
        let end = floor.to_be_bytes();
        self.storage
            .range(Table::DeletedKeys, &[], Some(&end))?
            .into_iter()
            .map(|(k, v)| DeletedKeyInfo::decode(&k, &v))
            .collect()
    }

    /// Stage physical removal of the superseded entries of one key.
    ///
    /// A tombstone left with nothing older than it goes too, since an absent
    /// history reads the same as a lone tombstone.
    pub fn stage_reclaim(
        &self,
        batch: &mut WriteBatch,
        key: &[u8],
        infos: &[DeletedKeyInfo],
    ) -> VaultResult<usize> {
        let entries = self.entries(key)?;
        let exists = |seq: Sequence| entries.binary_search_by_key(&seq, |e| e.sequence).is_ok();

        // A superseded entry may already be gone: a lone tombstone is
        // removed before the row for the record that overwrote it comes due
        let mut removed = BTreeSet::new();
        for info in infos {
            let row = history_key(key, info.superseded_sequence);
            batch.delete(Table::KeyHistory, row.clone());
            if info.superseded_external {
                batch.delete(Table::ValueBlobs, row);
            }
            batch.delete(Table::DeletedKeys, info.row_key());
            if exists(info.superseded_sequence) {
                removed.insert(info.superseded_sequence);
            }
        }

        for entry in entries.iter() {
            if removed.contains(&entry.sequence) {
                continue;
            }
            let reclaimable = entry.is_delete()
                && infos
                    .iter()
                    .any(|i| i.tombstone && i.deletion_sequence == entry.sequence);
            if !reclaimable {
                break;
            }
            batch.delete(Table::KeyHistory, history_key(key, entry.sequence));
            removed.insert(entry.sequence);
        }
        Ok(removed.len())
    }

    pub fn cache_stats(&self) -> VaultResult<CacheStats> {
        Ok(self.lock_cache()?.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> KeySequenceIndex {
        KeySequenceIndex::new(StorageHandle::in_memory(), 16, Duration::from_secs(60), 8)
    }

    fn ingest(index: &KeySequenceIndex, record: ChangeRecord) {
        let mut batch = WriteBatch::new();
        let (stored, _) = index.stage_ingest(&mut batch, record).unwrap();
        index.storage.commit(&batch).unwrap();
        index.committed(&stored).unwrap();
    }

    fn reclaim(index: &KeySequenceIndex, key: &[u8], floor: u64) -> usize {
        let infos: Vec<_> = index
            .deleted_below(Sequence::new(floor))
            .unwrap()
            .into_iter()
            .filter(|i| i.key == key)
            .collect();
        let mut batch = WriteBatch::new();
        let removed = index.stage_reclaim(&mut batch, key, &infos).unwrap();
        index.storage.commit(&batch).unwrap();
        index.invalidate(key).unwrap();
        removed
    }

    #[test]
    fn test_floor_lookup() {
        let index = index();
        ingest(&index, ChangeRecord::put("a", 1, "x"));
        ingest(&index, ChangeRecord::put("a", 5, "y"));
        ingest(&index, ChangeRecord::delete("a", 9));

        let at = |s| index.get_key_at_sequence(b"a", Sequence::new(s)).unwrap();
        assert_eq!(at(0), None);
        assert_eq!(at(3), Some(b"x".to_vec()));
        assert_eq!(at(5), Some(b"y".to_vec()));
        assert_eq!(at(7), Some(b"y".to_vec()));
        assert_eq!(at(10), None);
    }

    #[test]
    fn test_large_value_is_externalized() {
        let index = index();
        let big = vec![7u8; 64];
        ingest(&index, ChangeRecord::put("big", 1, big.clone()));

        let entry = index.latest_entry(b"big").unwrap().unwrap();
        assert!(entry.payload.is_external());
        assert_eq!(
            index.get_key_at_sequence(b"big", Sequence::new(1)).unwrap(),
            Some(big)
        );
    }

    #[test]
    fn test_overwrite_records_deleted_key_info() {
        let index = index();
        ingest(&index, ChangeRecord::put("a", 1, "x"));
        ingest(&index, ChangeRecord::put("a", 4, "y"));

        let rows = index.deleted_below(Sequence::new(10)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].superseded_sequence, Sequence::new(1));
        assert_eq!(rows[0].deletion_sequence, Sequence::new(4));
        assert!(index.deleted_below(Sequence::new(4)).unwrap().is_empty());
    }

    #[test]
    fn test_reads_below_reclaimed_floor_fail() {
        let index = index();
        ingest(&index, ChangeRecord::put("a", 1, "x"));
        index.raise_reclaimed_floor(Sequence::new(5));
        assert!(matches!(
            index.get_key_at_sequence(b"a", Sequence::new(2)),
            Err(VaultError::HistoryReclaimed { .. })
        ));
        assert_eq!(
            index.get_key_at_sequence(b"a", Sequence::new(5)).unwrap(),
            Some(b"x".to_vec())
        );
    }

    #[test]
    fn test_reclaim_removes_superseded_and_lone_tombstone() {
        let index = index();
        ingest(&index, ChangeRecord::put("a", 1, "x"));
        ingest(&index, ChangeRecord::delete("a", 2));

        assert_eq!(reclaim(&index, b"a", 3), 2);
        assert!(index.entries(b"a").unwrap().is_empty());
        assert_eq!(index.storage.count(Table::DeletedKeys).unwrap(), 0);
    }

    #[test]
    fn test_reclaim_keeps_tombstone_with_live_predecessor() {
        let index = index();
        ingest(&index, ChangeRecord::put("a", 1, "x"));
        ingest(&index, ChangeRecord::put("a", 2, "y"));
        ingest(&index, ChangeRecord::delete("a", 3));

        // Only the first overwrite is below the floor
        assert_eq!(index.deleted_below(Sequence::new(3)).unwrap().len(), 1);
        assert_eq!(reclaim(&index, b"a", 3), 1);

        let seqs: Vec<u64> = index.entries(b"a").unwrap().iter().map(|e| e.sequence.value()).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_reclaimed_tombstone_not_counted_twice() {
        let index = index();
        ingest(&index, ChangeRecord::put("a", 1, "x"));
        ingest(&index, ChangeRecord::delete("a", 2));
        ingest(&index, ChangeRecord::put("a", 3, "y"));

        assert_eq!(reclaim(&index, b"a", 3), 2);
        // The row for the put at 3 names the tombstone that is already gone
        assert_eq!(reclaim(&index, b"a", 4), 0);
        assert_eq!(index.storage.count(Table::DeletedKeys).unwrap(), 0);
        let seqs: Vec<u64> = index.entries(b"a").unwrap().iter().map(|e| e.sequence.value()).collect();
        assert_eq!(seqs, vec![3]);
    }

    #[test]
    fn test_ingest_extends_cached_history() {
        let index = index();
        ingest(&index, ChangeRecord::put("a", 1, "x"));
        assert_eq!(index.entries(b"a").unwrap().len(), 1);
        ingest(&index, ChangeRecord::put("a", 2, "y"));

        let misses = index.cache_stats().unwrap().misses;
        assert_eq!(index.entries(b"a").unwrap().len(), 2);
        assert_eq!(index.cache_stats().unwrap().misses, misses);
        assert_eq!(
            index.get_key_at_sequence(b"a", Sequence::new(2)).unwrap(),
            Some(b"y".to_vec())
        );
    }

    #[test]
    fn test_records_after() {
        let index = index();
        ingest(&index, ChangeRecord::put("b", 1, "x"));
        ingest(&index, ChangeRecord::put("a", 2, "y"));
        ingest(&index, ChangeRecord::put("b", 3, "z"));
        let records = index.records_after(Sequence::new(1)).unwrap();
        let seqs: Vec<u64> = records.iter().map(|r| r.sequence.value()).collect();
        assert_eq!(seqs, vec![2, 3]);
    }
}
