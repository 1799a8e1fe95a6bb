//! Record ingestion
//!
//! `ingest` validates ordering, commits the record's index rows in one batch
//! and only then appends it to the active buffer. The ingest lock is held
//! across the commit, so records reach the substrate in sequence order.
//!
//! Flushing swaps the active buffer for an empty one under the same lock;
//! that swap is the only pause ingestion sees from flushing. The frozen
//! buffer stays readable until its layer is committed.

use std::sync::{Arc, Mutex, MutexGuard};

use super::buffer::WriteBuffer;
use crate::errors::{display_key, VaultError, VaultResult};
use crate::history::KeySequenceIndex;
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::record::{ChangeRecord, Sequence};
use crate::substrate::meta::{self, WATERMARK};
use crate::substrate::{StorageHandle, WriteBatch};

#[derive(Debug)]
struct IngestState {
    active: WriteBuffer,
    frozen: Option<Arc<WriteBuffer>>,
    watermark: Sequence,
    /// Set after an upstream truncation: the next record may skip sequences
    gap_allowed: bool,
}

impl IngestState {
    fn empty() -> Self {
        Self {
            active: WriteBuffer::new(),
            frozen: None,
            watermark: Sequence::ZERO,
            gap_allowed: false,
        }
    }
}

#[derive(Debug)]
pub struct Ingestor {
    state: Mutex<IngestState>,
    reject_gaps: bool,
}

impl Ingestor {
    pub fn new(reject_gaps: bool) -> Self {
        Self {
            state: Mutex::new(IngestState::empty()),
            reject_gaps,
        }
    }

    fn lock(&self) -> VaultResult<MutexGuard<'_, IngestState>> {
        self.state.lock().map_err(|_| VaultError::LockPoisoned("ingest state"))
    }

    /// Highest sequence ingested so far.
    pub fn watermark(&self) -> VaultResult<Sequence> {
        Ok(self.lock()?.watermark)
    }

    pub fn ingest(
        &self,
        index: &KeySequenceIndex,
        storage: &StorageHandle,
        metrics: &MetricsRegistry,
        record: ChangeRecord,
    ) -> VaultResult<()> {
        let mut state = self.lock()?;
        if let Err(err) = self.check_order(&state, &record) {
            metrics.increment_records_rejected();
            Logger::error(
                Event::IngestRejected.as_str(),
                &[
                    ("code", err.code()),
                    ("key", &display_key(&record.key)),
                    ("received", &record.sequence.to_string()),
                    ("watermark", &state.watermark.to_string()),
                ],
            );
            return Err(err);
        }

        let sequence = record.sequence;
        let mut batch = WriteBatch::new();
        let (stored, _) = index.stage_ingest(&mut batch, record)?;
        meta::put_u64(&mut batch, WATERMARK, sequence.value());
        storage.commit(&batch)?;
        index.committed(&stored)?;

        if stored.payload.is_external() {
            metrics.increment_values_externalized();
        }
        metrics.increment_records_ingested();
        state.watermark = sequence;
        state.gap_allowed = false;
        state.active.push(stored);
        Ok(())
    }

    fn check_order(&self, state: &IngestState, record: &ChangeRecord) -> VaultResult<()> {
        if record.sequence == Sequence::MAX {
            return Err(VaultError::SequenceReserved(record.sequence));
        }
        if record.sequence <= state.watermark {
            return Err(VaultError::out_of_order(&record.key, record.sequence, state.watermark));
        }
        let expected = state.watermark.next();
        if self.reject_gaps && state.watermark > Sequence::ZERO && record.sequence > expected && !state.gap_allowed {
            return Err(VaultError::SequenceGap {
                expected,
                received: record.sequence,
            });
        }
        Ok(())
    }

    /// Let the next record skip sequences once.
    pub fn allow_gap(&self) -> VaultResult<()> {
        self.lock()?.gap_allowed = true;
        Ok(())
    }

    /// Has the active buffer reached either flush threshold?
    pub fn should_flush(&self, max_records: usize, max_bytes: usize) -> VaultResult<bool> {
        let state = self.lock()?;
        Ok(state.active.len() >= max_records || state.active.byte_size() >= max_bytes)
    }

    /// Buffer to flush next.
    ///
    /// A frozen buffer left over from a failed flush is returned again;
    /// otherwise a non-empty active buffer is frozen.
    pub fn freeze(&self) -> VaultResult<Option<Arc<WriteBuffer>>> {
        let mut state = self.lock()?;
        if let Some(frozen) = &state.frozen {
            return Ok(Some(Arc::clone(frozen)));
        }
        if state.active.is_empty() {
            return Ok(None);
        }
        let frozen = Arc::new(std::mem::take(&mut state.active));
        state.frozen = Some(Arc::clone(&frozen));
        Ok(Some(frozen))
    }

    /// Drop the frozen buffer once its layer is committed.
    pub fn release_frozen(&self) -> VaultResult<()> {
        self.lock()?.frozen = None;
        Ok(())
    }

    /// Unflushed records with `after < sequence <= upto`, in sequence order.
    pub fn buffered_between(&self, after: Sequence, upto: Sequence) -> VaultResult<Vec<ChangeRecord>> {
        let state = self.lock()?;
        let mut records = Vec::new();
        if let Some(frozen) = &state.frozen {
            records.extend_from_slice(frozen.between(after, upto));
        }
        records.extend_from_slice(state.active.between(after, upto));
        Ok(records)
    }

    /// Number of unflushed records, frozen included.
    pub fn buffered_len(&self) -> VaultResult<usize> {
        let state = self.lock()?;
        Ok(state.active.len() + state.frozen.as_ref().map_or(0, |f| f.len()))
    }

    /// Reinstate the unflushed tail after a restart.
    pub fn restore(&self, records: Vec<ChangeRecord>, watermark: Sequence) -> VaultResult<()> {
        let mut state = self.lock()?;
        let mut active = WriteBuffer::new();
        let mut highest = watermark;
        for record in records {
            highest = highest.max(record.sequence);
            active.push(record);
        }
        state.active = active;
        state.frozen = None;
        state.watermark = highest;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Fixture {
        storage: StorageHandle,
        index: KeySequenceIndex,
        metrics: MetricsRegistry,
    }

    fn fixture() -> Fixture {
        let storage = StorageHandle::in_memory();
        let index = KeySequenceIndex::new(storage.clone(), 64, Duration::from_secs(60), 1024);
        Fixture {
            storage,
            index,
            metrics: MetricsRegistry::new(),
        }
    }

    fn ingest(ingestor: &Ingestor, f: &Fixture, record: ChangeRecord) -> VaultResult<()> {
        ingestor.ingest(&f.index, &f.storage, &f.metrics, record)
    }

    #[test]
    fn test_out_of_order_rejected() {
        let f = fixture();
        let ingestor = Ingestor::new(false);
        ingest(&ingestor, &f, ChangeRecord::put("a", 5, "x")).unwrap();

        let err = ingest(&ingestor, &f, ChangeRecord::put("b", 5, "y")).unwrap_err();
        assert!(matches!(err, VaultError::SequenceOutOfOrder { .. }));
        let err = ingest(&ingestor, &f, ChangeRecord::put("a", 3, "y")).unwrap_err();
        assert!(matches!(err, VaultError::SequenceOutOfOrder { .. }));

        assert_eq!(ingestor.watermark().unwrap(), Sequence::new(5));
        assert_eq!(f.metrics.snapshot().records_rejected, 2);
        assert_eq!(ingestor.buffered_len().unwrap(), 1);
    }

    #[test]
    fn test_sequence_zero_is_rejected() {
        let f = fixture();
        let ingestor = Ingestor::new(false);
        assert!(ingest(&ingestor, &f, ChangeRecord::put("a", 0, "x")).is_err());
    }

    #[test]
    fn test_max_sequence_is_reserved() {
        let f = fixture();
        let ingestor = Ingestor::new(false);
        ingest(&ingestor, &f, ChangeRecord::put("a", 1, "x")).unwrap();

        let err = ingest(&ingestor, &f, ChangeRecord::put("a", u64::MAX, "x")).unwrap_err();
        assert_eq!(err.code(), "VAULT_SEQUENCE_RESERVED");
        assert_eq!(ingestor.watermark().unwrap(), Sequence::new(1));
        ingest(&ingestor, &f, ChangeRecord::put("a", u64::MAX - 1, "x")).unwrap();
    }

    #[test]
    fn test_gap_rejection_and_allowance() {
        let f = fixture();
        let ingestor = Ingestor::new(true);
        ingest(&ingestor, &f, ChangeRecord::put("a", 10, "x")).unwrap();
        ingest(&ingestor, &f, ChangeRecord::put("a", 11, "x")).unwrap();

        let err = ingest(&ingestor, &f, ChangeRecord::put("a", 13, "x")).unwrap_err();
        assert!(matches!(err, VaultError::SequenceGap { .. }));

        ingestor.allow_gap().unwrap();
        ingest(&ingestor, &f, ChangeRecord::put("a", 13, "x")).unwrap();
        assert!(ingest(&ingestor, &f, ChangeRecord::put("a", 20, "x")).is_err());
    }

    #[test]
    fn test_freeze_and_release() {
        let f = fixture();
        let ingestor = Ingestor::new(false);
        assert!(ingestor.freeze().unwrap().is_none());

        ingest(&ingestor, &f, ChangeRecord::put("a", 1, "x")).unwrap();
        ingest(&ingestor, &f, ChangeRecord::put("b", 2, "x")).unwrap();
        let frozen = ingestor.freeze().unwrap().unwrap();
        assert_eq!(frozen.len(), 2);

        ingest(&ingestor, &f, ChangeRecord::put("c", 3, "x")).unwrap();
        let again = ingestor.freeze().unwrap().unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(
            ingestor.buffered_between(Sequence::new(1), Sequence::new(3)).unwrap().len(),
            2
        );

        ingestor.release_frozen().unwrap();
        assert_eq!(ingestor.buffered_len().unwrap(), 1);
    }

    #[test]
    fn test_thresholds() {
        let f = fixture();
        let ingestor = Ingestor::new(false);
        ingest(&ingestor, &f, ChangeRecord::put("a", 1, "x")).unwrap();
        assert!(!ingestor.should_flush(2, 1 << 20).unwrap());
        ingest(&ingestor, &f, ChangeRecord::put("a", 2, "x")).unwrap();
        assert!(ingestor.should_flush(2, 1 << 20).unwrap());
        assert!(ingestor.should_flush(100, 10).unwrap());
    }
}
