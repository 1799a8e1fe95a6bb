//! Bounded, time-limited cache of per-key histories
//!
//! - Entries expire after the configured TTL
//! - When full, expired entries go first, then the oldest load
//! - Ingest appends to a cached history in place
//! - Loads carry a per-key ticket; invalidating or appending to a key voids
//!   its outstanding ticket so a racing load cannot install a stale history.
//!   Loads of other keys are unaffected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::record::HistoryEntry;

#[derive(Debug)]
struct CachedHistory {
    entries: Arc<Vec<HistoryEntry>>,
    loaded_at: Instant,
}

/// Cache counters, passive only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Proof that a load of one key started after its last change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket(u64);

#[derive(Debug)]
pub struct HistoryCache {
    entries: HashMap<Vec<u8>, CachedHistory>,
    /// Outstanding load per key
    loading: HashMap<Vec<u8>, u64>,
    next_ticket: u64,
    max_entries: usize,
    ttl: Duration,
    stats: CacheStats,
}

impl HistoryCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            loading: HashMap::new(),
            next_ticket: 0,
            max_entries,
            ttl,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, key: &[u8]) -> Option<Arc<Vec<HistoryEntry>>> {
        let expired = match self.entries.get(key) {
            Some(cached) if cached.loaded_at.elapsed() < self.ttl => {
                self.stats.hits += 1;
                return Some(Arc::clone(&cached.entries));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        self.stats.misses += 1;
        None
    }

    /// Register a load of `key` from the substrate.
    pub fn begin_load(&mut self, key: &[u8]) -> LoadTicket {
        self.next_ticket += 1;
        self.loading.insert(key.to_vec(), self.next_ticket);
        LoadTicket(self.next_ticket)
    }

    /// Install a loaded history unless `key` changed since `ticket` was issued.
    pub fn insert(&mut self, key: Vec<u8>, entries: Arc<Vec<HistoryEntry>>, ticket: LoadTicket) {
        if self.loading.get(&key) != Some(&ticket.0) {
            return;
        }
        self.loading.remove(&key);
        if self.max_entries == 0 {
            return;
        }
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.evict();
        }
        self.entries.insert(
            key,
            CachedHistory {
                entries,
                loaded_at: Instant::now(),
            },
        );
    }

    /// Forget a load that failed.
    pub fn abandon(&mut self, key: &[u8], ticket: LoadTicket) {
        if self.loading.get(key) == Some(&ticket.0) {
            self.loading.remove(key);
        }
    }

    /// Extend a cached history with a newly committed entry.
    ///
    /// Entries arrive in sequence order, so the history stays sorted.
    pub fn append(&mut self, key: &[u8], entry: HistoryEntry) {
        self.loading.remove(key);
        if let Some(cached) = self.entries.get_mut(key) {
            Arc::make_mut(&mut cached.entries).push(entry);
        }
    }

    pub fn invalidate(&mut self, key: &[u8]) {
        self.loading.remove(key);
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.loading.clear();
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn evict(&mut self) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, cached| cached.loaded_at.elapsed() < ttl);
        if self.entries.len() == before {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, cached)| cached.loaded_at)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                self.entries.remove(&key);
            }
        }
        self.stats.evictions += (before - self.entries.len()) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Operation, Payload, Sequence};

    fn entry(seq: u64) -> HistoryEntry {
        HistoryEntry {
            sequence: Sequence::new(seq),
            operation: Operation::Put,
            payload: Payload::Inline(b"v".to_vec()),
        }
    }

    fn history(seq: u64) -> Arc<Vec<HistoryEntry>> {
        Arc::new(vec![entry(seq)])
    }

    fn load(cache: &mut HistoryCache, key: &[u8], seq: u64) {
        let ticket = cache.begin_load(key);
        cache.insert(key.to_vec(), history(seq), ticket);
    }

    #[test]
    fn test_hit_and_miss() {
        let mut cache = HistoryCache::new(4, Duration::from_secs(60));
        assert!(cache.get(b"a").is_none());
        load(&mut cache, b"a", 1);
        assert_eq!(cache.get(b"a").unwrap()[0].sequence, Sequence::new(1));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut cache = HistoryCache::new(2, Duration::from_secs(60));
        for key in [b"a", b"b", b"c"] {
            load(&mut cache, key, 1);
        }
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.get(b"c").is_some());
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let mut cache = HistoryCache::new(4, Duration::from_millis(0));
        load(&mut cache, b"a", 1);
        assert!(cache.get(b"a").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_stale_load_is_not_installed() {
        let mut cache = HistoryCache::new(4, Duration::from_secs(60));
        let ticket = cache.begin_load(b"a");
        cache.invalidate(b"a");
        cache.insert(b"a".to_vec(), history(1), ticket);
        assert!(cache.get(b"a").is_none());
    }

    #[test]
    fn test_change_to_other_key_keeps_load() {
        let mut cache = HistoryCache::new(4, Duration::from_secs(60));
        let ticket = cache.begin_load(b"a");
        cache.invalidate(b"b");
        cache.append(b"c", entry(7));
        cache.insert(b"a".to_vec(), history(1), ticket);
        assert!(cache.get(b"a").is_some());
    }

    #[test]
    fn test_append_extends_cached_history() {
        let mut cache = HistoryCache::new(4, Duration::from_secs(60));
        load(&mut cache, b"a", 1);
        let before = cache.get(b"a").unwrap();
        cache.append(b"a", entry(4));

        let after = cache.get(b"a").unwrap();
        let seqs: Vec<u64> = after.iter().map(|e| e.sequence.value()).collect();
        assert_eq!(seqs, vec![1, 4]);
        // Readers holding the old history keep their view
        assert_eq!(before.len(), 1);
    }

    #[test]
    fn test_append_voids_racing_load() {
        let mut cache = HistoryCache::new(4, Duration::from_secs(60));
        let ticket = cache.begin_load(b"a");
        cache.append(b"a", entry(4));
        cache.insert(b"a".to_vec(), history(1), ticket);
        assert!(cache.get(b"a").is_none());
    }
}
