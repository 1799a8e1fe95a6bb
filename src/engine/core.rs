//! Shared engine state
//!
//! Lock order, outermost first:
//! 1. `maintenance_lock` (compaction, image creation, reclamation)
//! 2. `flush_lock`
//! 3. snapshot registry
//! 4. `reclaim_gate`
//! 5. `dag`
//! 6. `layers`
//!
//! The ingest state, the history cache and the diff job table are leaf
//! locks: nothing else is acquired while holding them.
//!
//! Readers hold `reclaim_gate` shared for their whole run, so reclamation
//! never deletes content a reconstruction or diff is about to read. Flush
//! and compaction never take it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::compaction::{CompactionDag, CompactionPolicy};
use crate::config::EngineConfig;
use crate::errors::{VaultError, VaultResult};
use crate::history::KeySequenceIndex;
use crate::ingest::Ingestor;
use crate::layer::{LayerBuildParams, LayerCatalog};
use crate::observability::MetricsRegistry;
use crate::reconstruct::DiffJobRegistry;
use crate::record::Sequence;
use crate::snapshot::SnapshotRegistry;
use crate::substrate::StorageHandle;

pub(crate) struct Core {
    pub(crate) config: EngineConfig,
    pub(crate) storage: StorageHandle,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) index: KeySequenceIndex,
    pub(crate) ingestor: Ingestor,
    pub(crate) registry: SnapshotRegistry,
    pub(crate) diff_jobs: DiffJobRegistry,
    layers: RwLock<LayerCatalog>,
    dag: RwLock<CompactionDag>,
    reclaim_gate: RwLock<()>,
    flush_lock: Mutex<()>,
    maintenance_lock: Mutex<()>,
    /// Every sequence <= this is inside a committed delta layer
    flushed_through: AtomicU64,
}

impl Core {
    pub(crate) fn new(config: EngineConfig, storage: StorageHandle) -> Self {
        let metrics = Arc::clone(storage.metrics());
        let index = KeySequenceIndex::new(
            storage.clone(),
            config.cache_max_entries,
            Duration::from_millis(config.cache_ttl_ms),
            config.inline_value_limit,
        );
        let registry = SnapshotRegistry::new(
            storage.clone(),
            config.max_snapshots,
            Duration::from_secs(config.reclamation_grace_secs),
        );
        let diff_jobs = DiffJobRegistry::new(storage.clone());
        Self {
            ingestor: Ingestor::new(config.reject_sequence_gaps),
            layers: RwLock::new(LayerCatalog::new()),
            dag: RwLock::new(CompactionDag::new()),
            reclaim_gate: RwLock::new(()),
            flush_lock: Mutex::new(()),
            maintenance_lock: Mutex::new(()),
            flushed_through: AtomicU64::new(0),
            config,
            storage,
            metrics,
            index,
            registry,
            diff_jobs,
        }
    }

    pub(crate) fn layers(&self) -> VaultResult<RwLockReadGuard<'_, LayerCatalog>> {
        self.layers.read().map_err(|_| VaultError::LockPoisoned("layer catalog"))
    }

    pub(crate) fn layers_mut(&self) -> VaultResult<RwLockWriteGuard<'_, LayerCatalog>> {
        self.layers.write().map_err(|_| VaultError::LockPoisoned("layer catalog"))
    }

    pub(crate) fn dag(&self) -> VaultResult<RwLockReadGuard<'_, CompactionDag>> {
        self.dag.read().map_err(|_| VaultError::LockPoisoned("compaction dag"))
    }

    pub(crate) fn dag_mut(&self) -> VaultResult<RwLockWriteGuard<'_, CompactionDag>> {
        self.dag.write().map_err(|_| VaultError::LockPoisoned("compaction dag"))
    }

    pub(crate) fn read_gate(&self) -> VaultResult<RwLockReadGuard<'_, ()>> {
        self.reclaim_gate.read().map_err(|_| VaultError::LockPoisoned("reclaim gate"))
    }

    pub(crate) fn write_gate(&self) -> VaultResult<RwLockWriteGuard<'_, ()>> {
        self.reclaim_gate.write().map_err(|_| VaultError::LockPoisoned("reclaim gate"))
    }

    pub(crate) fn lock_flush(&self) -> VaultResult<MutexGuard<'_, ()>> {
        self.flush_lock.lock().map_err(|_| VaultError::LockPoisoned("flush"))
    }

    pub(crate) fn lock_maintenance(&self) -> VaultResult<MutexGuard<'_, ()>> {
        self.maintenance_lock.lock().map_err(|_| VaultError::LockPoisoned("maintenance"))
    }

    /// Replace the catalog and graph with freshly loaded ones.
    pub(crate) fn install(&self, layers: LayerCatalog, dag: CompactionDag) -> VaultResult<()> {
        *self.dag_mut()? = dag;
        *self.layers_mut()? = layers;
        Ok(())
    }

    pub(crate) fn flushed_through(&self) -> Sequence {
        Sequence::new(self.flushed_through.load(Ordering::SeqCst))
    }

    pub(crate) fn set_flushed_through(&self, seq: Sequence) {
        self.flushed_through.fetch_max(seq.value(), Ordering::SeqCst);
    }

    pub(crate) fn watermark(&self) -> VaultResult<Sequence> {
        self.ingestor.watermark()
    }

    pub(crate) fn build_params(&self) -> LayerBuildParams {
        LayerBuildParams {
            false_positive_rate: self.config.filter_false_positive_rate,
            prefix_len: self.config.filter_prefix_len,
        }
    }

    pub(crate) fn compaction_policy(&self) -> CompactionPolicy {
        CompactionPolicy::from_config(&self.config)
    }

    pub(crate) fn grace(&self) -> Duration {
        self.registry.grace()
    }
}
