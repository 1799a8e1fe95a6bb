//! Engine facade
//!
//! `Engine` owns every component and is the only public entry point:
//! ingestion, snapshot points, historical reads, diffs and maintenance.
//!
//! Ingestion only ever flushes: once the buffer reaches a threshold the
//! flush runs inline, or is queued to the background worker after
//! `start_maintenance`. Compaction, image creation and reclamation hold the
//! maintenance lock and run from `run_maintenance`, the explicit calls below
//! or the worker's ticker, never from `ingest`.
//!
//! A record is acknowledged once durable. A flush failing after that is
//! logged and counted, not returned; the frozen buffer is retried by the
//! next flush.
//!
//! ```ignore
//! let engine = Engine::open(EngineConfig::new("/var/lib/seqvault"))?;
//! engine.ingest(ChangeRecord::put("user:1", 1, "alice"))?;
//! let snap = engine.create_snapshot_point("nightly")?;
//! let value = engine.read_at(b"user:1", Sequence::new(1))?;
//! ```

mod core;
mod maintenance;

pub(crate) use self::core::Core;
pub use maintenance::MaintenanceTask;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use self::maintenance::MaintenanceHandle;
use crate::checkpoint::{self, ImageReport};
use crate::compaction::{self, CompactionReport};
use crate::config::EngineConfig;
use crate::errors::{VaultError, VaultResult};
use crate::history::CacheStats;
use crate::layer::{self, FlushReport};
use crate::observability::{log_event, log_event_with_fields, Event, MetricsRegistry, MetricsSnapshot};
use crate::reclaim::{self, ReclaimReport};
use crate::reconstruct::{self, CancelToken, DiffJob, DiffJobState, DiffPage, DiffReport};
use crate::record::{ChangeRecord, Sequence};
use crate::recovery::{self, RecoveryReport};
use crate::snapshot::{SnapshotError, SnapshotId, SnapshotInfo};
use crate::substrate::{FileBackend, StorageHandle};

/// Point-in-time view of engine state, for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub watermark: Sequence,
    pub flushed_through: Sequence,
    pub reclaimed_floor: Option<Sequence>,
    pub buffered_records: usize,
    pub delta_layers: usize,
    pub current_layers: usize,
    pub image_layers: usize,
    pub latest_image: Option<Sequence>,
    pub dag_nodes: usize,
    pub dag_edges: usize,
    pub active_snapshots: usize,
    pub total_snapshots: usize,
    pub visibility_floor: Option<Sequence>,
    pub cache: CacheStats,
}

/// What one `run_maintenance` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenancePass {
    pub compaction: Option<CompactionReport>,
    pub image: Option<ImageReport>,
}

pub struct Engine {
    core: Arc<Core>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
    recovery: RecoveryReport,
}

impl Engine {
    /// Open (or create) a file-backed engine under `config.data_dir`.
    pub fn open(config: EngineConfig) -> VaultResult<Self> {
        config.validate()?;
        log_event_with_fields(
            Event::EngineOpen,
            &[("data_dir", &config.data_dir.display().to_string())],
        );
        let backend = FileBackend::open(&config.substrate_dir())?;
        let storage = StorageHandle::new(
            Arc::new(backend),
            config.retry_policy(),
            Arc::new(MetricsRegistry::new()),
        );
        Self::with_storage(config, storage)
    }

    /// Volatile engine; nothing survives the process.
    pub fn open_in_memory(config: EngineConfig) -> VaultResult<Self> {
        config.validate()?;
        log_event_with_fields(Event::EngineOpen, &[("data_dir", ":memory:")]);
        Self::with_storage(config, StorageHandle::in_memory())
    }

    /// Open over an existing substrate handle, running recovery first.
    pub fn with_storage(config: EngineConfig, storage: StorageHandle) -> VaultResult<Self> {
        let core = Arc::new(Core::new(config, storage));
        let recovery = recovery::recover(&core)?;
        log_event_with_fields(
            Event::EngineReady,
            &[("watermark", &recovery.watermark.to_string())],
        );
        Ok(Self {
            core,
            maintenance: Mutex::new(None),
            recovery,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// What recovery found when this engine was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    fn lock_maintenance_handle(&self) -> VaultResult<MutexGuard<'_, Option<MaintenanceHandle>>> {
        self.maintenance
            .lock()
            .map_err(|_| VaultError::LockPoisoned("maintenance handle"))
    }

    // ----- ingestion -----

    /// Ingest one record. Acknowledged once its history entry is durable.
    pub fn ingest(&self, record: ChangeRecord) -> VaultResult<()> {
        let core = &self.core;
        core.ingestor
            .ingest(&core.index, &core.storage, &core.metrics, record)?;
        if core.ingestor.should_flush(
            core.config.flush_threshold_records,
            core.config.flush_threshold_bytes,
        )? {
            if let Err(err) = self.after_threshold() {
                report_maintenance_failure(core, MaintenanceTask::Flush, &err);
            }
        }
        Ok(())
    }

    /// Ingest records in order, stopping at the first failure.
    pub fn ingest_batch(&self, records: impl IntoIterator<Item = ChangeRecord>) -> VaultResult<usize> {
        let mut count = 0;
        for record in records {
            self.ingest(record)?;
            count += 1;
        }
        Ok(count)
    }

    fn after_threshold(&self) -> VaultResult<()> {
        {
            let mut slot = self.lock_maintenance_handle()?;
            if let Some(handle) = slot.as_ref() {
                match handle.sender.send(MaintenanceTask::Flush) {
                    Ok(()) => return Ok(()),
                    Err(_) => {
                        // Worker is gone: flush inline from now on
                        slot.take();
                        report_maintenance_failure(
                            &self.core,
                            MaintenanceTask::Flush,
                            &VaultError::MaintenanceStopped,
                        );
                    }
                }
            }
        }
        layer::flush(&self.core)?;
        Ok(())
    }

    /// Highest sequence ingested so far.
    pub fn watermark(&self) -> VaultResult<Sequence> {
        self.core.watermark()
    }

    /// Handle an upstream feed that no longer holds `requested`.
    ///
    /// Everything known is folded into an image, then the next record may
    /// skip to `earliest_available` once.
    pub fn recover_from_truncation(&self, requested: Sequence, earliest_available: Sequence) -> VaultResult<()> {
        self.core.metrics.increment_feed_truncations();
        log_event_with_fields(
            Event::FeedTruncated,
            &[
                ("requested", &requested.to_string()),
                ("earliest_available", &earliest_available.to_string()),
                ("watermark", &self.core.watermark()?.to_string()),
            ],
        );
        checkpoint::create_image(&self.core)?;
        self.core.ingestor.allow_gap()
    }

    // ----- maintenance -----

    /// Write the buffer into a delta layer now.
    pub fn flush(&self) -> VaultResult<Option<FlushReport>> {
        layer::flush(&self.core)
    }

    /// Compact the oldest run of layers, even below the trigger.
    pub fn compact(&self) -> VaultResult<Option<CompactionReport>> {
        compaction::compact(&self.core, true)
    }

    /// Compact only if the policy asks for it.
    pub fn maybe_compact(&self) -> VaultResult<Option<CompactionReport>> {
        compaction::compact(&self.core, false)
    }

    /// Checkpoint full state at the flushed watermark.
    pub fn create_image(&self) -> VaultResult<Option<ImageReport>> {
        checkpoint::create_image(&self.core)
    }

    /// Compact and create an image if either is due.
    pub fn run_maintenance(&self) -> VaultResult<MaintenancePass> {
        let compaction = compaction::compact(&self.core, false)?;
        let image = if checkpoint::image_due(&self.core)? {
            checkpoint::create_image(&self.core)?
        } else {
            None
        };
        Ok(MaintenancePass { compaction, image })
    }

    /// Remove everything no snapshot can read any more.
    pub fn prune_reclaimable(&self) -> VaultResult<ReclaimReport> {
        reclaim::prune_reclaimable(&self.core)
    }

    /// Move maintenance to background tasks on the current tokio runtime.
    pub async fn start_maintenance(&self) -> VaultResult<()> {
        let mut slot = self.lock_maintenance_handle()?;
        if slot.is_none() {
            let interval = Duration::from_millis(self.core.config.maintenance_interval_ms);
            *slot = Some(MaintenanceHandle::spawn(Arc::clone(&self.core), interval));
        }
        Ok(())
    }

    /// Queue a task for the background worker. `false` if it is not running.
    pub fn submit(&self, task: MaintenanceTask) -> VaultResult<bool> {
        let mut slot = self.lock_maintenance_handle()?;
        let sent = match slot.as_ref() {
            Some(handle) => handle.sender.send(task).is_ok(),
            None => return Ok(false),
        };
        if !sent {
            slot.take();
            report_maintenance_failure(&self.core, task, &VaultError::MaintenanceStopped);
        }
        Ok(sent)
    }

    /// Stop background maintenance and flush what is buffered.
    pub async fn shutdown(&self) -> VaultResult<()> {
        let handle = self.lock_maintenance_handle()?.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        layer::flush(&self.core)?;
        log_event(Event::EngineShutdown);
        Ok(())
    }

    // ----- snapshot points -----

    /// Freeze the current watermark as a named snapshot point.
    pub fn create_snapshot_point(&self, scope: &str) -> VaultResult<SnapshotInfo> {
        self.create_snapshot_point_with_prefix(scope, None)
    }

    /// Snapshot point whose diffs only cover keys under `prefix`.
    pub fn create_snapshot_point_with_prefix(
        &self,
        scope: &str,
        prefix: Option<Vec<u8>>,
    ) -> VaultResult<SnapshotInfo> {
        let info = SnapshotInfo::new(scope, self.core.watermark()?, prefix);
        let created = self.core.registry.create(info, |_| Ok(()))?;
        self.core.metrics.increment_snapshots_created();
        Ok(created)
    }

    /// Snapshot point at an earlier, still readable sequence.
    pub fn create_snapshot_at(
        &self,
        scope: &str,
        sequence: Sequence,
        prefix: Option<Vec<u8>>,
    ) -> VaultResult<SnapshotInfo> {
        let core = &self.core;
        let info = SnapshotInfo::new(scope, sequence, prefix);
        let created = core.registry.create(info, |info| {
            let watermark = core.watermark()?;
            if info.frozen_sequence > watermark {
                return Err(SnapshotError::SequenceAhead {
                    requested: info.frozen_sequence,
                    watermark,
                }
                .into());
            }
            core.index.check_readable(info.frozen_sequence)
        })?;
        core.metrics.increment_snapshots_created();
        Ok(created)
    }

    /// Mark a snapshot deleted; it keeps protecting data for the grace period.
    pub fn delete_snapshot_point(&self, id: SnapshotId) -> VaultResult<()> {
        self.core.registry.delete(id)?;
        self.core.metrics.increment_snapshots_deleted();
        Ok(())
    }

    pub fn snapshot(&self, id: SnapshotId) -> VaultResult<SnapshotInfo> {
        self.core.registry.get(id)
    }

    pub fn list_snapshots(&self) -> VaultResult<Vec<SnapshotInfo>> {
        self.core.registry.list()
    }

    // ----- historical reads -----

    /// Value of `key` as of `sequence`, `None` if absent then.
    pub fn read_at(&self, key: &[u8], sequence: Sequence) -> VaultResult<Option<Vec<u8>>> {
        reconstruct::read_at(&self.core, key, sequence)
    }

    /// Every live key and value as of `sequence`.
    pub fn reconstruct_state(
        &self,
        sequence: Sequence,
        prefix: Option<&[u8]>,
        cancel: &CancelToken,
    ) -> VaultResult<BTreeMap<Vec<u8>, Vec<u8>>> {
        reconstruct::reconstruct_state(&self.core, sequence, prefix, cancel)
    }

    /// Keys changed between `from` and `to`.
    pub fn diff(&self, from: Sequence, to: Sequence, prefix: Option<&[u8]>) -> VaultResult<DiffReport> {
        self.diff_with_cancel(from, to, prefix, &CancelToken::new())
    }

    pub fn diff_with_cancel(
        &self,
        from: Sequence,
        to: Sequence,
        prefix: Option<&[u8]>,
        cancel: &CancelToken,
    ) -> VaultResult<DiffReport> {
        reconstruct::diff(&self.core, from, to, prefix, cancel)
    }

    /// One page of the diff between two active snapshot points.
    pub fn diff_snapshots(
        &self,
        from: SnapshotId,
        to: SnapshotId,
        page_token: Option<&str>,
        page_size: usize,
    ) -> VaultResult<DiffPage> {
        reconstruct::diff_snapshots(&self.core, from, to, page_token, page_size, &CancelToken::new())
    }

    // ----- snapshot diff jobs -----

    /// Queue a tracked diff between two active snapshot points.
    ///
    /// Returns the existing job if the pair is already queued, running or
    /// done. A running maintenance worker picks new jobs up; otherwise call
    /// `run_snapshot_diff_jobs`.
    pub fn submit_snapshot_diff(&self, from: SnapshotId, to: SnapshotId) -> VaultResult<DiffJob> {
        let (from, to) = reconstruct::resolve_pair(&self.core, from, to)?;
        let (job, queued) = self.core.diff_jobs.submit(&from, &to)?;
        if queued {
            self.submit(MaintenanceTask::DiffJobs)?;
        }
        Ok(job)
    }

    /// Run every queued diff job on the calling thread.
    pub fn run_snapshot_diff_jobs(&self) -> VaultResult<usize> {
        reconstruct::run_queued(&self.core)
    }

    pub fn snapshot_diff_job(&self, from: SnapshotId, to: SnapshotId) -> VaultResult<DiffJob> {
        self.core
            .diff_jobs
            .get(from, to)?
            .ok_or(VaultError::DiffJobNotFound { from, to })
    }

    /// Diff jobs in submission order, optionally only those in `state`.
    pub fn list_snapshot_diff_jobs(&self, state: Option<DiffJobState>) -> VaultResult<Vec<DiffJob>> {
        self.core.diff_jobs.list(state)
    }

    /// Cancel a queued or running diff job.
    pub fn cancel_snapshot_diff(&self, from: SnapshotId, to: SnapshotId) -> VaultResult<DiffJob> {
        self.core.diff_jobs.cancel(from, to)
    }

    // ----- introspection -----

    pub fn stats(&self) -> VaultResult<EngineStats> {
        let core = &self.core;
        let (delta_layers, image_layers, latest_image) = {
            let layers = core.layers()?;
            (
                layers.delta_count(),
                layers.image_count(),
                layers.latest_image().map(|i| i.sequence),
            )
        };
        let (dag_nodes, dag_edges, current_layers) = {
            let dag = core.dag()?;
            (dag.node_count(), dag.edge_count(), dag.current_nodes().count())
        };
        let snapshots = core.registry.list()?;
        Ok(EngineStats {
            watermark: core.watermark()?,
            flushed_through: core.flushed_through(),
            reclaimed_floor: core.index.reclaimed_floor(),
            buffered_records: core.ingestor.buffered_len()?,
            delta_layers,
            current_layers,
            image_layers,
            latest_image,
            dag_nodes,
            dag_edges,
            active_snapshots: snapshots.iter().filter(|s| s.is_active()).count(),
            total_snapshots: snapshots.len(),
            visibility_floor: core.registry.visibility_floor()?,
            cache: core.index.cache_stats()?,
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }
}

fn report_maintenance_failure(core: &Core, task: MaintenanceTask, err: &VaultError) {
    core.metrics.increment_maintenance_failures();
    log_event_with_fields(
        Event::MaintenanceFailed,
        &[
            ("task", task.as_str()),
            ("code", err.code()),
            ("error", &err.to_string()),
        ],
    );
}
