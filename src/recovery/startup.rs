//! Startup sequence
//!
//! # Startup Sequence (strict order)
//!
//! 1. Reload the reclaimed floor, the snapshot registry and the diff jobs;
//!    interrupted jobs are requeued and jobs of purged snapshots dropped
//! 2. Load the layer catalog and the compaction DAG
//! 3. Delete blobs no metadata row references (interrupted flushes,
//!    compactions and image builds)
//! 4. Verify catalog and DAG agree
//! 5. Publish catalog and DAG
//! 6. Rebuild the write buffer from history entries past `flushed_through`
//!
//! The key-sequence index is the durable source of every acknowledged
//! record, so step 6 loses nothing that was acknowledged before the crash.

use std::collections::HashSet;

use serde::Serialize;

use super::verifier::ConsistencyVerifier;
use crate::compaction::CompactionDag;
use crate::engine::Core;
use crate::errors::VaultResult;
use crate::layer::{decode_blob_key, load_flushed_through, stage_delete_blob, LayerCatalog};
use crate::observability::{log_event, log_event_with_fields, Event, ObservationScope};
use crate::record::Sequence;
use crate::substrate::meta::{self, WATERMARK};
use crate::substrate::{Table, WriteBatch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub orphans_removed: usize,
    pub buffered_records: usize,
    pub watermark: Sequence,
    pub flushed_through: Sequence,
    pub delta_layers: usize,
    pub image_layers: usize,
    pub snapshots: usize,
    pub diff_jobs_requeued: usize,
}

pub(crate) fn recover(core: &Core) -> VaultResult<RecoveryReport> {
    log_event(Event::RecoveryBegin);
    let scope = ObservationScope::new("recovery");
    match run(core) {
        Ok(report) => {
            scope.complete_with_fields(&[
                ("orphans_removed", &report.orphans_removed.to_string()),
                ("buffered_records", &report.buffered_records.to_string()),
            ]);
            log_event_with_fields(
                Event::RecoveryComplete,
                &[
                    ("watermark", &report.watermark.to_string()),
                    ("flushed_through", &report.flushed_through.to_string()),
                    ("delta_layers", &report.delta_layers.to_string()),
                    ("image_layers", &report.image_layers.to_string()),
                    ("snapshots", &report.snapshots.to_string()),
                ],
            );
            Ok(report)
        }
        Err(err) => {
            scope.fail(&err.to_string());
            log_event_with_fields(
                Event::RecoveryFailed,
                &[("code", err.code()), ("error", &err.to_string())],
            );
            Err(err)
        }
    }
}

fn run(core: &Core) -> VaultResult<RecoveryReport> {
    core.index.load()?;
    core.registry.load()?;
    let diff_jobs_requeued = core.diff_jobs.load()?;
    let purged: Vec<_> = core
        .diff_jobs
        .list(None)?
        .iter()
        .flat_map(|job| [job.from_snapshot, job.to_snapshot])
        .filter(|id| core.registry.get(*id).is_err())
        .collect();
    core.diff_jobs.forget_snapshots(&purged)?;

    let layers = LayerCatalog::load(&core.storage)?;
    let dag = CompactionDag::load(&core.storage)?;

    let mut present = HashSet::new();
    let mut orphans = WriteBatch::new();
    let mut orphans_removed = 0;
    for (key, _) in core.storage.range(Table::LayerBlobs, &[], None)? {
        let (kind, id) = decode_blob_key(&key)?;
        if layers.references(kind, id) {
            present.insert((kind, id));
        } else {
            stage_delete_blob(&mut orphans, kind, id);
            orphans_removed += 1;
            log_event_with_fields(Event::RecoveryOrphanRemoved, &[("layer_id", &id.to_string())]);
        }
    }
    if orphans_removed > 0 {
        core.storage.commit(&orphans)?;
    }

    ConsistencyVerifier::verify(&layers, &dag, &present)?;
    let delta_layers = layers.delta_count();
    let image_layers = layers.image_count();
    core.install(layers, dag)?;

    let flushed_through = load_flushed_through(core)?;
    core.set_flushed_through(flushed_through);
    let persisted = Sequence::new(meta::get_u64(&core.storage, WATERMARK)?.unwrap_or(0));
    let pending = core.index.records_after(flushed_through)?;
    let buffered_records = pending.len();
    core.ingestor.restore(pending, persisted.max(flushed_through))?;
    let watermark = core.watermark()?;
    log_event_with_fields(
        Event::RecoveryBufferRebuilt,
        &[("records", &buffered_records.to_string())],
    );

    Ok(RecoveryReport {
        orphans_removed,
        buffered_records,
        watermark,
        flushed_through,
        delta_layers,
        image_layers,
        snapshots: core.registry.list()?.len(),
        diff_jobs_requeued,
    })
}
