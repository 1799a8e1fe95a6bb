//! Reclamation service
//!
//! Physically removes data no snapshot can read any more. The visibility
//! floor is the lowest frozen sequence among protecting snapshots (active
//! ones plus deleted ones inside their grace window). Anything whose
//! deletion or absorption sequence is strictly below the floor is garbage:
//!
//! - superseded history entries, their value blobs, trailing tombstones
//! - absorbed delta layers (non-leaf DAG nodes) with their blobs
//! - images older than a newer image that is itself at or below the floor
//! - deleted snapshots past their grace window, with their diff jobs
//!
//! The floor is computed and applied under the registry lock, so a snapshot
//! cannot be created between the comparison and the deletion. Readers are
//! excluded through the reclaim gate for the duration of the commit.
//!
//! With no protecting snapshot the floor is undefined and nothing is
//! reclaimed. Running twice in a row reclaims nothing the second time.
//!
//! Removal only appends delete frames to the substrate log. Once a prune
//! leaves more dead log bytes than `log_rewrite_min_dead_bytes`, and at
//! least `log_rewrite_min_dead_ratio` of the log, the log is rewritten to
//! the live rows.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;

use crate::engine::Core;
use crate::errors::VaultResult;
use crate::history::DeletedKeyInfo;
use crate::layer::{DeltaLayerMeta, ImageLayerMeta};
use crate::observability::{log_event_with_fields, Event};
use crate::record::Sequence;
use crate::substrate::{LogUsage, WriteBatch};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Visibility floor used, if any snapshot protects data
    pub floor: Option<Sequence>,
    pub history_entries: usize,
    pub layers: usize,
    pub images: usize,
    pub snapshots_purged: usize,
    /// Substrate log bytes released by a rewrite; not a unit count
    pub log_bytes_freed: u64,
}

impl ReclaimReport {
    /// Total units removed.
    pub fn total(&self) -> usize {
        self.history_entries + self.layers + self.images + self.snapshots_purged
    }
}

/// Images that a newer image at or below `floor` makes redundant.
///
/// `images` must be ordered by sequence. The latest image is never retired.
pub fn retirable_images(images: &[ImageLayerMeta], floor: Sequence) -> Vec<ImageLayerMeta> {
    images
        .windows(2)
        .filter(|pair| pair[1].sequence <= floor)
        .map(|pair| pair[0].clone())
        .collect()
}

pub(crate) fn prune_reclaimable(core: &Core) -> VaultResult<ReclaimReport> {
    let _maintenance = core.lock_maintenance()?;
    let mut registry = core.registry.lock()?;
    let now = Utc::now();
    let grace = core.grace();
    let mut report = ReclaimReport::default();

    let expired = registry.expired(now, grace);
    if !expired.is_empty() {
        let mut batch = WriteBatch::new();
        for info in &expired {
            registry.stage_purge(&mut batch, info);
        }
        core.storage.commit(&batch)?;
        for info in &expired {
            registry.apply_purge(info.id);
            log_event_with_fields(
                Event::SnapshotPurged,
                &[("snapshot_id", &info.id.to_string())],
            );
        }
        report.snapshots_purged = expired.len();
        let purged: Vec<_> = expired.iter().map(|info| info.id).collect();
        core.diff_jobs.forget_snapshots(&purged)?;
    }

    let floor = match registry.visibility_floor(now, grace) {
        Some(floor) => floor,
        None => {
            drop(registry);
            maybe_rewrite_log(core, &mut report)?;
            finish(core, &report);
            return Ok(report);
        }
    };
    report.floor = Some(floor);

    let _gate = core.write_gate()?;
    let mut dag = core.dag_mut()?;
    let mut layers = core.layers_mut()?;
    let mut batch = WriteBatch::new();

    let mut by_key: BTreeMap<Vec<u8>, Vec<DeletedKeyInfo>> = BTreeMap::new();
    for info in core.index.deleted_below(floor)? {
        by_key.entry(info.key.clone()).or_default().push(info);
    }
    for (key, infos) in &by_key {
        report.history_entries += core.index.stage_reclaim(&mut batch, key, infos)?;
    }

    let absorbed: Vec<_> = dag
        .nodes()
        .filter(|n| !dag.is_leaf(n.node_id))
        .filter(|n| n.absorbed_at.map_or(false, |at| at < floor))
        .map(|n| n.node_id)
        .collect();
    let mut removed_layers: Vec<DeltaLayerMeta> = Vec::new();
    for id in &absorbed {
        if let Some(node) = dag.node(*id) {
            if let Some(meta) = layers.delta(node.layer_id) {
                layers.stage_remove_delta(&mut batch, meta);
                removed_layers.push(meta.clone());
            }
        }
        dag.stage_remove(&mut batch, *id);
    }

    let images: Vec<ImageLayerMeta> = layers.images().cloned().collect();
    let retired = retirable_images(&images, floor);
    for image in &retired {
        layers.stage_remove_image(&mut batch, image);
    }

    let removed_any = !by_key.is_empty() || !absorbed.is_empty() || !retired.is_empty();
    if removed_any {
        core.index.stage_reclaimed_floor(&mut batch, floor);
    }
    core.storage.commit(&batch)?;

    for key in by_key.keys() {
        core.index.invalidate(key)?;
    }
    for id in &absorbed {
        dag.remove(*id);
    }
    for meta in &removed_layers {
        layers.remove_delta(meta.layer_id);
    }
    for image in &retired {
        layers.remove_image(image);
    }
    if removed_any {
        core.index.raise_reclaimed_floor(floor);
    }
    report.layers = removed_layers.len();
    report.images = retired.len();

    drop(layers);
    drop(dag);
    drop(_gate);
    drop(registry);
    maybe_rewrite_log(core, &mut report)?;

    finish(core, &report);
    Ok(report)
}

/// Whether a log this full of dead frames is worth rewriting.
pub fn rewrite_due(usage: &LogUsage, min_dead_bytes: u64, min_dead_ratio: f64) -> bool {
    let dead = usage.dead_bytes();
    dead > 0 && dead >= min_dead_bytes && usage.dead_ratio() >= min_dead_ratio
}

fn maybe_rewrite_log(core: &Core, report: &mut ReclaimReport) -> VaultResult<()> {
    let usage = match core.storage.log_usage()? {
        Some(usage) => usage,
        None => return Ok(()),
    };
    if !rewrite_due(
        &usage,
        core.config.log_rewrite_min_dead_bytes,
        core.config.log_rewrite_min_dead_ratio,
    ) {
        return Ok(());
    }
    core.storage.rewrite_log()?;
    let after = core
        .storage
        .log_usage()?
        .map_or(usage.live_bytes, |u| u.log_bytes);
    report.log_bytes_freed = usage.log_bytes.saturating_sub(after);
    core.metrics.increment_log_rewrites();
    core.metrics.add_log_bytes_freed(report.log_bytes_freed);
    log_event_with_fields(
        Event::LogRewritten,
        &[
            ("log_bytes_before", &usage.log_bytes.to_string()),
            ("log_bytes_after", &after.to_string()),
        ],
    );
    Ok(())
}

fn finish(core: &Core, report: &ReclaimReport) {
    core.metrics.increment_reclaim_runs();
    core.metrics.add_units_reclaimed(report.total() as u64);
    log_event_with_fields(
        Event::ReclaimComplete,
        &[
            ("floor", &report.floor.map(|f| f.to_string()).unwrap_or_default()),
            ("history_entries", &report.history_entries.to_string()),
            ("layers", &report.layers.to_string()),
            ("images", &report.images.to_string()),
            ("snapshots_purged", &report.snapshots_purged.to_string()),
            ("log_bytes_freed", &report.log_bytes_freed.to_string()),
        ],
    );
}
