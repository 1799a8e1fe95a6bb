//! Operational counters
//!
//! - Counters only, monotonic
//! - Reset only on process start
//! - Relaxed atomics; values are exact once the writers have quiesced

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    records_ingested: AtomicU64,
    records_rejected: AtomicU64,
    values_externalized: AtomicU64,
    flushes: AtomicU64,
    records_flushed: AtomicU64,
    compactions: AtomicU64,
    records_dropped_by_compaction: AtomicU64,
    images_created: AtomicU64,
    snapshots_created: AtomicU64,
    snapshots_deleted: AtomicU64,
    reads: AtomicU64,
    diffs: AtomicU64,
    diffs_cancelled: AtomicU64,
    reclaim_runs: AtomicU64,
    units_reclaimed: AtomicU64,
    feed_truncations: AtomicU64,
    batches_committed: AtomicU64,
    substrate_retries: AtomicU64,
    maintenance_failures: AtomicU64,
    log_rewrites: AtomicU64,
    log_bytes_freed: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $add:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $add(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(increment_records_ingested, add_records_ingested, records_ingested);
    counter!(increment_records_rejected, add_records_rejected, records_rejected);
    counter!(increment_values_externalized, add_values_externalized, values_externalized);
    counter!(increment_flushes, add_flushes, flushes);
    counter!(increment_records_flushed, add_records_flushed, records_flushed);
    counter!(increment_compactions, add_compactions, compactions);
    counter!(increment_records_dropped, add_records_dropped, records_dropped_by_compaction);
    counter!(increment_images_created, add_images_created, images_created);
    counter!(increment_snapshots_created, add_snapshots_created, snapshots_created);
    counter!(increment_snapshots_deleted, add_snapshots_deleted, snapshots_deleted);
    counter!(increment_reads, add_reads, reads);
    counter!(increment_diffs, add_diffs, diffs);
    counter!(increment_diffs_cancelled, add_diffs_cancelled, diffs_cancelled);
    counter!(increment_reclaim_runs, add_reclaim_runs, reclaim_runs);
    counter!(increment_units_reclaimed, add_units_reclaimed, units_reclaimed);
    counter!(increment_feed_truncations, add_feed_truncations, feed_truncations);
    counter!(increment_batches_committed, add_batches_committed, batches_committed);
    counter!(increment_substrate_retries, add_substrate_retries, substrate_retries);
    counter!(increment_maintenance_failures, add_maintenance_failures, maintenance_failures);
    counter!(increment_log_rewrites, add_log_rewrites, log_rewrites);
    counter!(increment_log_bytes_freed, add_log_bytes_freed, log_bytes_freed);

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            records_ingested: load(&self.records_ingested),
            records_rejected: load(&self.records_rejected),
            values_externalized: load(&self.values_externalized),
            flushes: load(&self.flushes),
            records_flushed: load(&self.records_flushed),
            compactions: load(&self.compactions),
            records_dropped_by_compaction: load(&self.records_dropped_by_compaction),
            images_created: load(&self.images_created),
            snapshots_created: load(&self.snapshots_created),
            snapshots_deleted: load(&self.snapshots_deleted),
            reads: load(&self.reads),
            diffs: load(&self.diffs),
            diffs_cancelled: load(&self.diffs_cancelled),
            reclaim_runs: load(&self.reclaim_runs),
            units_reclaimed: load(&self.units_reclaimed),
            feed_truncations: load(&self.feed_truncations),
            batches_committed: load(&self.batches_committed),
            substrate_retries: load(&self.substrate_retries),
            maintenance_failures: load(&self.maintenance_failures),
            log_rewrites: load(&self.log_rewrites),
            log_bytes_freed: load(&self.log_bytes_freed),
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub records_ingested: u64,
    pub records_rejected: u64,
    pub values_externalized: u64,
    pub flushes: u64,
    pub records_flushed: u64,
    pub compactions: u64,
    pub records_dropped_by_compaction: u64,
    pub images_created: u64,
    pub snapshots_created: u64,
    pub snapshots_deleted: u64,
    pub reads: u64,
    pub diffs: u64,
    pub diffs_cancelled: u64,
    pub reclaim_runs: u64,
    pub units_reclaimed: u64,
    pub feed_truncations: u64,
    pub batches_committed: u64,
    pub substrate_retries: u64,
    pub maintenance_failures: u64,
    pub log_rewrites: u64,
    pub log_bytes_freed: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
