//! Tracked snapshot diff jobs
//!
//! A diff between two snapshot points can be queued as a job instead of
//! computed inline. Jobs are keyed by the (from, to) pair: submitting a pair
//! again returns the job already queued, running or done, while a failed or
//! cancelled job is replaced by a fresh one.
//!
//! Rows:
//! - `diff_jobs`: from id ‖ to id → job (JSON)
//! - `diff_reports`: job id ‖ entry index (u64 BE) → entry (JSON)
//!
//! A report is written in the same batch that marks its job done, so a job
//! is never seen done with half a report. A job cancelled while it runs
//! stops at the next cancellation check and publishes nothing. Jobs that
//! were running when the process stopped go back to the queue on load.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::diff::DiffEntry;
use super::page::{diff_entries, resolve_pair};
use super::CancelToken;
use crate::engine::Core;
use crate::errors::{VaultError, VaultResult};
use crate::observability::{log_event_with_fields, Event};
use crate::record::Sequence;
use crate::snapshot::{SnapshotId, SnapshotInfo};
use crate::substrate::{prefix_upper_bound, StorageHandle, StoreError, StoreResult, Table, WriteBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffJobState {
    Queued,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl DiffJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffJobState::Queued => "queued",
            DiffJobState::InProgress => "in_progress",
            DiffJobState::Done => "done",
            DiffJobState::Failed => "failed",
            DiffJobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(DiffJobState::Queued),
            "in_progress" => Some(DiffJobState::InProgress),
            "done" => Some(DiffJobState::Done),
            "failed" => Some(DiffJobState::Failed),
            "cancelled" => Some(DiffJobState::Cancelled),
            _ => None,
        }
    }

    /// Queued or running.
    pub fn is_pending(&self) -> bool {
        matches!(self, DiffJobState::Queued | DiffJobState::InProgress)
    }
}

impl fmt::Display for DiffJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffJob {
    pub job_id: Uuid,
    pub from_snapshot: SnapshotId,
    pub to_snapshot: SnapshotId,
    pub from: Sequence,
    pub to: Sequence,
    pub state: DiffJobState,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Entries in the stored report, once done
    pub total_entries: Option<usize>,
    pub error: Option<String>,
}

impl DiffJob {
    fn new(from: &SnapshotInfo, to: &SnapshotInfo) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            from_snapshot: from.id,
            to_snapshot: to.id,
            from: from.frozen_sequence,
            to: to.frozen_sequence,
            state: DiffJobState::Queued,
            submitted_at: Utc::now(),
            finished_at: None,
            total_entries: None,
            error: None,
        }
    }

    pub fn pair(&self) -> (SnapshotId, SnapshotId) {
        (self.from_snapshot, self.to_snapshot)
    }

    fn finish(&mut self, state: DiffJobState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    pub fn row_key(&self) -> Vec<u8> {
        job_key(self.from_snapshot, self.to_snapshot)
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::codec(Table::DiffJobs.name(), e.to_string()))
    }

    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(data).map_err(|e| StoreError::codec(Table::DiffJobs.name(), e.to_string()))
    }
}

pub fn job_key(from: SnapshotId, to: SnapshotId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(from.as_bytes());
    key.extend_from_slice(to.as_bytes());
    key
}

fn report_key(job_id: Uuid, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(job_id.as_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn encode_entry(entry: &DiffEntry) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(entry).map_err(|e| StoreError::codec(Table::DiffReports.name(), e.to_string()))
}

fn decode_entry(data: &[u8]) -> StoreResult<DiffEntry> {
    serde_json::from_slice(data).map_err(|e| StoreError::codec(Table::DiffReports.name(), e.to_string()))
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<(SnapshotId, SnapshotId), DiffJob>,
    /// Cancel handles of jobs being computed
    running: HashMap<Uuid, CancelToken>,
}

/// Every diff job, persisted before it changes in memory.
#[derive(Debug)]
pub struct DiffJobRegistry {
    storage: StorageHandle,
    table: Mutex<JobTable>,
}

impl DiffJobRegistry {
    pub fn new(storage: StorageHandle) -> Self {
        Self {
            storage,
            table: Mutex::new(JobTable::default()),
        }
    }

    fn lock(&self) -> VaultResult<MutexGuard<'_, JobTable>> {
        self.table
            .lock()
            .map_err(|_| VaultError::LockPoisoned("diff jobs"))
    }

    /// Reload persisted jobs. Jobs left running go back to the queue.
    ///
    /// Returns how many were requeued.
    pub fn load(&self) -> VaultResult<usize> {
        let mut batch = WriteBatch::new();
        let mut jobs = HashMap::new();
        for (_, value) in self.storage.range(Table::DiffJobs, &[], None)? {
            let mut job = DiffJob::decode(&value)?;
            if job.state == DiffJobState::InProgress {
                job.state = DiffJobState::Queued;
                batch.put(Table::DiffJobs, job.row_key(), job.encode()?);
            }
            jobs.insert(job.pair(), job);
        }
        let requeued = batch.len();
        self.storage.commit(&batch)?;

        let mut table = self.lock()?;
        table.jobs = jobs;
        table.running.clear();
        Ok(requeued)
    }

    /// Queue a diff of `from` → `to` unless one is queued, running or done.
    ///
    /// The flag is true when a new job was queued.
    pub fn submit(&self, from: &SnapshotInfo, to: &SnapshotInfo) -> VaultResult<(DiffJob, bool)> {
        let mut table = self.lock()?;
        if let Some(existing) = table.jobs.get(&(from.id, to.id)) {
            if existing.state.is_pending() || existing.state == DiffJobState::Done {
                return Ok((existing.clone(), false));
            }
        }

        let job = DiffJob::new(from, to);
        let mut batch = WriteBatch::new();
        batch.put(Table::DiffJobs, job.row_key(), job.encode()?);
        self.storage.commit(&batch)?;
        table.jobs.insert(job.pair(), job.clone());

        log_event_with_fields(
            Event::DiffJobSubmitted,
            &[
                ("job_id", &job.job_id.to_string()),
                ("from_snapshot", &from.id.to_string()),
                ("to_snapshot", &to.id.to_string()),
            ],
        );
        Ok((job, true))
    }

    pub fn get(&self, from: SnapshotId, to: SnapshotId) -> VaultResult<Option<DiffJob>> {
        Ok(self.lock()?.jobs.get(&(from, to)).cloned())
    }

    /// Jobs in submission order, optionally only those in `state`.
    pub fn list(&self, state: Option<DiffJobState>) -> VaultResult<Vec<DiffJob>> {
        let mut jobs: Vec<DiffJob> = self
            .lock()?
            .jobs
            .values()
            .filter(|job| state.map_or(true, |s| job.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.job_id.cmp(&b.job_id)));
        Ok(jobs)
    }

    /// Cancel a queued or running job. Cancelling twice is not an error.
    pub fn cancel(&self, from: SnapshotId, to: SnapshotId) -> VaultResult<DiffJob> {
        let mut table = self.lock()?;
        let mut job = match table.jobs.get(&(from, to)) {
            Some(job) => job.clone(),
            None => return Err(VaultError::DiffJobNotFound { from, to }),
        };
        match job.state {
            DiffJobState::Cancelled => return Ok(job),
            DiffJobState::Done | DiffJobState::Failed => {
                return Err(VaultError::DiffJobNotCancellable {
                    job_id: job.job_id,
                    state: job.state,
                })
            }
            DiffJobState::Queued | DiffJobState::InProgress => {}
        }

        job.finish(DiffJobState::Cancelled);
        let mut batch = WriteBatch::new();
        batch.put(Table::DiffJobs, job.row_key(), job.encode()?);
        self.storage.commit(&batch)?;

        if let Some(token) = table.running.remove(&job.job_id) {
            token.cancel();
        }
        table.jobs.insert(job.pair(), job.clone());
        log_event_with_fields(
            Event::DiffJobCancelled,
            &[("job_id", &job.job_id.to_string())],
        );
        Ok(job)
    }

    /// Mark the oldest queued job running and hand out its cancel handle.
    fn claim_next(&self) -> VaultResult<Option<(DiffJob, CancelToken)>> {
        let mut table = self.lock()?;
        let next = table
            .jobs
            .values()
            .filter(|job| job.state == DiffJobState::Queued)
            .min_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.job_id.cmp(&b.job_id)))
            .cloned();
        let mut job = match next {
            Some(job) => job,
            None => return Ok(None),
        };

        job.state = DiffJobState::InProgress;
        let mut batch = WriteBatch::new();
        batch.put(Table::DiffJobs, job.row_key(), job.encode()?);
        self.storage.commit(&batch)?;

        let token = CancelToken::new();
        table.running.insert(job.job_id, token.clone());
        table.jobs.insert(job.pair(), job.clone());
        Ok(Some((job, token)))
    }

    /// Record how a run ended. A job cancelled or replaced meanwhile keeps
    /// its current state and nothing is published.
    fn complete(&self, claimed: &DiffJob, outcome: VaultResult<Vec<DiffEntry>>) -> VaultResult<DiffJob> {
        let mut table = self.lock()?;
        table.running.remove(&claimed.job_id);
        let mut job = match table.jobs.get(&claimed.pair()) {
            Some(job) if job.job_id == claimed.job_id && job.state == DiffJobState::InProgress => job.clone(),
            Some(job) => return Ok(job.clone()),
            None => return Ok(claimed.clone()),
        };

        let mut batch = WriteBatch::new();
        match outcome {
            Ok(entries) => {
                for (index, entry) in entries.iter().enumerate() {
                    batch.put(Table::DiffReports, report_key(job.job_id, index as u64), encode_entry(entry)?);
                }
                job.total_entries = Some(entries.len());
                job.finish(DiffJobState::Done);
            }
            Err(VaultError::Cancelled) => job.finish(DiffJobState::Cancelled),
            Err(err) => {
                job.error = Some(format!("{}: {}", err.code(), err));
                job.finish(DiffJobState::Failed);
            }
        }
        batch.put(Table::DiffJobs, job.row_key(), job.encode()?);
        self.storage.commit(&batch)?;
        table.jobs.insert(job.pair(), job.clone());
        Ok(job)
    }

    /// `count` report entries of a done job, from entry `start`.
    pub fn report_page(&self, job: &DiffJob, start: usize, count: usize) -> VaultResult<Vec<DiffEntry>> {
        let lower = report_key(job.job_id, start as u64);
        let upper = report_key(job.job_id, start.saturating_add(count) as u64);
        self.storage
            .range(Table::DiffReports, &lower, Some(&upper))?
            .iter()
            .map(|(_, value)| decode_entry(value).map_err(VaultError::from))
            .collect()
    }

    /// Drop every job that involves one of `ids`, with its report.
    pub fn forget_snapshots(&self, ids: &[SnapshotId]) -> VaultResult<usize> {
        let mut table = self.lock()?;
        let doomed: Vec<DiffJob> = table
            .jobs
            .values()
            .filter(|job| ids.contains(&job.from_snapshot) || ids.contains(&job.to_snapshot))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        for job in &doomed {
            batch.delete(Table::DiffJobs, job.row_key());
            let prefix = job.job_id.as_bytes().to_vec();
            let upper = prefix_upper_bound(&prefix);
            for (key, _) in self.storage.range(Table::DiffReports, &prefix, upper.as_deref())? {
                batch.delete(Table::DiffReports, key);
            }
        }
        self.storage.commit(&batch)?;

        for job in &doomed {
            if let Some(token) = table.running.remove(&job.job_id) {
                token.cancel();
            }
            table.jobs.remove(&job.pair());
        }
        Ok(doomed.len())
    }
}

/// Run queued jobs until the queue is empty. Returns how many ran.
pub(crate) fn run_queued(core: &Core) -> VaultResult<usize> {
    let mut ran = 0;
    while let Some((job, cancel)) = core.diff_jobs.claim_next()? {
        let outcome = resolve_pair(core, job.from_snapshot, job.to_snapshot)
            .and_then(|(from, to)| diff_entries(core, &from, &to, &cancel));
        let finished = core.diff_jobs.complete(&job, outcome)?;
        log_event_with_fields(
            Event::DiffJobFinished,
            &[
                ("job_id", &finished.job_id.to_string()),
                ("state", finished.state.as_str()),
                (
                    "total_entries",
                    &finished.total_entries.map(|t| t.to_string()).unwrap_or_default(),
                ),
            ],
        );
        ran += 1;
    }
    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruct::ChangeKind;

    fn snapshot(seq: u64) -> SnapshotInfo {
        SnapshotInfo::new("default", Sequence::new(seq), None)
    }

    fn entry(key: &str) -> DiffEntry {
        DiffEntry {
            key: key.as_bytes().to_vec(),
            kind: ChangeKind::Created,
            before: None,
            after: Some(b"v".to_vec()),
        }
    }

    #[test]
    fn test_resubmit_returns_same_job() {
        let jobs = DiffJobRegistry::new(StorageHandle::in_memory());
        let (a, b) = (snapshot(1), snapshot(5));
        let (first, queued) = jobs.submit(&a, &b).unwrap();
        assert!(queued);
        assert_eq!(first.state, DiffJobState::Queued);

        let (again, queued) = jobs.submit(&a, &b).unwrap();
        assert!(!queued);
        assert_eq!(again.job_id, first.job_id);
        assert_eq!(jobs.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_cancel_transitions() {
        let jobs = DiffJobRegistry::new(StorageHandle::in_memory());
        let (a, b) = (snapshot(1), snapshot(5));
        let err = jobs.cancel(a.id, b.id).unwrap_err();
        assert_eq!(err.code(), "VAULT_DIFF_JOB_NOT_FOUND");

        jobs.submit(&a, &b).unwrap();
        assert_eq!(jobs.cancel(a.id, b.id).unwrap().state, DiffJobState::Cancelled);
        assert_eq!(jobs.cancel(a.id, b.id).unwrap().state, DiffJobState::Cancelled);
        assert!(jobs.claim_next().unwrap().is_none());

        // A cancelled pair can be submitted again
        let (fresh, queued) = jobs.submit(&a, &b).unwrap();
        assert!(queued);
        assert_eq!(jobs.list(Some(DiffJobState::Queued)).unwrap(), vec![fresh]);
    }

    #[test]
    fn test_done_job_stores_report() {
        let jobs = DiffJobRegistry::new(StorageHandle::in_memory());
        let (a, b) = (snapshot(1), snapshot(5));
        jobs.submit(&a, &b).unwrap();
        let (claimed, _) = jobs.claim_next().unwrap().unwrap();
        assert_eq!(claimed.state, DiffJobState::InProgress);

        let done = jobs
            .complete(&claimed, Ok(vec![entry("a"), entry("b"), entry("c")]))
            .unwrap();
        assert_eq!(done.state, DiffJobState::Done);
        assert_eq!(done.total_entries, Some(3));
        let page = jobs.report_page(&done, 1, 5).unwrap();
        assert_eq!(page, vec![entry("b"), entry("c")]);

        let err = jobs.cancel(a.id, b.id).unwrap_err();
        assert_eq!(err.code(), "VAULT_DIFF_JOB_NOT_CANCELLABLE");
    }

    #[test]
    fn test_cancelled_run_publishes_nothing() {
        let jobs = DiffJobRegistry::new(StorageHandle::in_memory());
        let (a, b) = (snapshot(1), snapshot(5));
        jobs.submit(&a, &b).unwrap();
        let (claimed, token) = jobs.claim_next().unwrap().unwrap();

        jobs.cancel(a.id, b.id).unwrap();
        assert!(token.is_cancelled());
        let after = jobs.complete(&claimed, Ok(vec![entry("a")])).unwrap();
        assert_eq!(after.state, DiffJobState::Cancelled);
        assert!(jobs.report_page(&after, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_running_job_requeued_on_load() {
        let storage = StorageHandle::in_memory();
        let jobs = DiffJobRegistry::new(storage.clone());
        let (a, b) = (snapshot(1), snapshot(5));
        jobs.submit(&a, &b).unwrap();
        jobs.claim_next().unwrap().unwrap();

        let reloaded = DiffJobRegistry::new(storage);
        assert_eq!(reloaded.load().unwrap(), 1);
        assert_eq!(reloaded.get(a.id, b.id).unwrap().unwrap().state, DiffJobState::Queued);
    }

    #[test]
    fn test_forget_snapshot_drops_jobs_and_reports() {
        let storage = StorageHandle::in_memory();
        let jobs = DiffJobRegistry::new(storage.clone());
        let (a, b, c) = (snapshot(1), snapshot(5), snapshot(9));
        jobs.submit(&a, &b).unwrap();
        let (claimed, _) = jobs.claim_next().unwrap().unwrap();
        jobs.complete(&claimed, Ok(vec![entry("a")])).unwrap();
        jobs.submit(&b, &c).unwrap();

        assert_eq!(jobs.forget_snapshots(&[a.id]).unwrap(), 1);
        assert!(jobs.get(a.id, b.id).unwrap().is_none());
        assert!(jobs.get(b.id, c.id).unwrap().is_some());
        assert_eq!(storage.count(Table::DiffReports).unwrap(), 0);
    }

    #[test]
    fn test_state_names_parse_back() {
        for state in [
            DiffJobState::Queued,
            DiffJobState::InProgress,
            DiffJobState::Done,
            DiffJobState::Failed,
            DiffJobState::Cancelled,
        ] {
            assert_eq!(DiffJobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(DiffJobState::parse("rejected"), None);
    }
}
