//! Storage substrate for seqvault
//!
//! An ordered, multi-table key-value store with atomic batch commits. Every
//! other module persists through this layer.
//!
//! Guarantees:
//! - A committed batch is entirely visible or entirely absent after a crash
//! - Range scans return keys in byte order
//! - Transient failures are retried with bounded, jittered backoff
//!
//! Backends:
//! - `MemoryBackend`: volatile, used by tests and ephemeral engines
//! - `FileBackend`: append-only checksummed log, replayed on open

mod errors;
mod file;
mod frame;
mod memory;
pub mod meta;
mod retry;
mod table;

pub use errors::{StoreError, StoreResult};
pub use file::{FileBackend, ReplayStats};
pub use memory::MemoryBackend;
pub use retry::RetryPolicy;
pub use table::{prefix_upper_bound, BatchOp, Table, WriteBatch};

use std::sync::Arc;

use crate::observability::MetricsRegistry;

/// Ordered multi-table key-value store.
pub trait KvBackend: Send + Sync {
    /// Point lookup
    fn get(&self, table: Table, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Ordered scan of `[start, end)`; `None` means to the end of the table.
    fn range(
        &self,
        table: Table,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Greatest entry in `[start, end)`.
    fn last_in_range(
        &self,
        table: Table,
        start: &[u8],
        end: &[u8],
    ) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>>;

    /// Atomically apply a batch.
    fn commit(&self, batch: &WriteBatch) -> StoreResult<()>;

    /// Number of rows in a table
    fn count(&self, table: Table) -> StoreResult<usize>;

    /// On-disk footprint, for backends that keep a log.
    fn log_usage(&self) -> StoreResult<Option<LogUsage>> {
        Ok(None)
    }

    /// Drop superseded frames. A no-op for backends without a log.
    fn rewrite_log(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Log size against the size of a log holding only live rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogUsage {
    pub log_bytes: u64,
    pub live_bytes: u64,
}

impl LogUsage {
    pub fn dead_bytes(&self) -> u64 {
        self.log_bytes.saturating_sub(self.live_bytes)
    }

    /// Dead share of the log, 0.0 for an empty log.
    pub fn dead_ratio(&self) -> f64 {
        if self.log_bytes == 0 {
            return 0.0;
        }
        self.dead_bytes() as f64 / self.log_bytes as f64
    }
}

/// Shared handle used by the engine's components.
///
/// Wraps a backend with the retry policy and counts retries.
#[derive(Clone)]
pub struct StorageHandle {
    backend: Arc<dyn KvBackend>,
    retry: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl StorageHandle {
    pub fn new(backend: Arc<dyn KvBackend>, retry: RetryPolicy, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            backend,
            retry,
            metrics,
        }
    }

    /// Volatile handle with default retry, for tests.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBackend::new()),
            RetryPolicy::default(),
            Arc::new(MetricsRegistry::new()),
        )
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn get(&self, table: Table, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.retry.run(
            table.name(),
            || self.backend.get(table, key),
            || self.metrics.increment_substrate_retries(),
        )
    }

    pub fn range(
        &self,
        table: Table,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.retry.run(
            table.name(),
            || self.backend.range(table, start, end),
            || self.metrics.increment_substrate_retries(),
        )
    }

    /// Every row whose key starts with `prefix`.
    pub fn scan_prefix(&self, table: Table, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let upper = prefix_upper_bound(prefix);
        self.range(table, prefix, upper.as_deref())
    }

    pub fn last_in_range(
        &self,
        table: Table,
        start: &[u8],
        end: &[u8],
    ) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.retry.run(
            table.name(),
            || self.backend.last_in_range(table, start, end),
            || self.metrics.increment_substrate_retries(),
        )
    }

    /// Commit a batch, retrying transient failures.
    pub fn commit(&self, batch: &WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.retry.run(
            "commit",
            || self.backend.commit(batch),
            || self.metrics.increment_substrate_retries(),
        )?;
        self.metrics.increment_batches_committed();
        Ok(())
    }

    pub fn count(&self, table: Table) -> StoreResult<usize> {
        self.retry.run(
            table.name(),
            || self.backend.count(table),
            || self.metrics.increment_substrate_retries(),
        )
    }

    pub fn log_usage(&self) -> StoreResult<Option<LogUsage>> {
        self.backend.log_usage()
    }

    pub fn rewrite_log(&self) -> StoreResult<()> {
        self.retry.run(
            "rewrite_log",
            || self.backend.rewrite_log(),
            || self.metrics.increment_substrate_retries(),
        )
    }
}
