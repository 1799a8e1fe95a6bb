//! In-memory backend
//!
//! Same semantics as the file backend without durability. Used by tests and
//! by callers that only need the engine for a process lifetime. Transient
//! commit failures can be injected to exercise retry paths.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use super::errors::{StoreError, StoreResult};
use super::table::{Table, Tables, WriteBatch};
use super::KvBackend;

/// Volatile substrate backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
    failures_to_inject: AtomicU32,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a transient I/O error.
    pub fn inject_transient_failures(&self, count: u32) {
        self.failures_to_inject.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, table: Table, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.get(table, key))
    }

    fn range(
        &self,
        table: Table,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.range(table, start, end))
    }

    fn last_in_range(
        &self,
        table: Table,
        start: &[u8],
        end: &[u8],
    ) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.last_in_range(table, start, end))
    }

    fn commit(&self, batch: &WriteBatch) -> StoreResult<()> {
        if self.take_injected_failure() {
            return Err(StoreError::io(
                "commit",
                io::Error::new(io::ErrorKind::Interrupted, "injected transient failure"),
            ));
        }
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        tables.apply(batch);
        Ok(())
    }

    fn count(&self, table: Table) -> StoreResult<usize> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.count(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injected_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.inject_transient_failures(1);

        let mut batch = WriteBatch::new();
        batch.put(Table::Meta, b"k".to_vec(), b"v".to_vec());

        let err = backend.commit(&batch).unwrap_err();
        assert!(err.is_transient());
        backend.commit(&batch).unwrap();
        assert_eq!(backend.get(Table::Meta, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
