//! Point reads and full-state reconstruction

use std::collections::BTreeMap;

use super::CancelToken;
use crate::engine::Core;
use crate::errors::{VaultError, VaultResult};
use crate::layer::{coverage, read_blob, BlobKind, DeltaLayerMeta, ImageLayerMeta};
use crate::record::{ChangeRecord, Sequence};

/// Value of `key` as of `seq`.
pub(crate) fn read_at(core: &Core, key: &[u8], seq: Sequence) -> VaultResult<Option<Vec<u8>>> {
    let _gate = core.read_gate()?;
    core.metrics.increment_reads();
    core.index.get_key_at_sequence(key, seq)
}

fn matches(key: &[u8], prefix: Option<&[u8]>) -> bool {
    prefix.map_or(true, |p| key.starts_with(p))
}

/// Current delta layers holding sequences in `(after, upto]`, oldest first.
fn layers_between(
    core: &Core,
    after: Sequence,
    upto: Sequence,
    prefix: Option<&[u8]>,
) -> VaultResult<Vec<DeltaLayerMeta>> {
    if upto <= after {
        return Ok(Vec::new());
    }
    let dag = core.dag()?;
    let layers = core.layers()?;
    let ids = coverage::candidates(&core.storage, after.next(), upto, layers.widest_span())?;
    let mut selected: Vec<DeltaLayerMeta> = ids
        .into_iter()
        .filter_map(|id| layers.delta(id))
        .filter(|meta| {
            dag.node_for_layer(meta.layer_id)
                .map_or(false, |n| n.absorbed_at.is_none())
        })
        .filter(|meta| meta.range.intersects_open_closed(after, upto))
        .filter(|meta| prefix.map_or(true, |p| meta.may_match_prefix(p)))
        .cloned()
        .collect();
    selected.sort_by_key(|m| m.range.start);
    Ok(selected)
}

fn apply(winners: &mut BTreeMap<Vec<u8>, ChangeRecord>, record: ChangeRecord) {
    match winners.get(&record.key) {
        Some(existing) if existing.sequence >= record.sequence => {}
        _ => {
            winners.insert(record.key.clone(), record);
        }
    }
}

/// Latest live record per key as of `seq`, payloads unresolved.
///
/// Callers hold either the reclaim gate or the maintenance lock.
pub(crate) fn materialize(
    core: &Core,
    seq: Sequence,
    prefix: Option<&[u8]>,
    cancel: &CancelToken,
) -> VaultResult<BTreeMap<Vec<u8>, ChangeRecord>> {
    // Buffer before layers: a flush in between can only duplicate records
    let base: Option<ImageLayerMeta> = core.layers()?.image_at_or_before(seq).cloned();
    let lower = base.as_ref().map_or(Sequence::ZERO, |image| image.sequence);
    let buffered = core.ingestor.buffered_between(lower, seq)?;
    let deltas = layers_between(core, lower, seq, prefix)?;

    let mut winners = BTreeMap::new();
    if let Some(image) = &base {
        cancel.check()?;
        for record in read_blob(&core.storage, BlobKind::Image, image.image_id)? {
            if matches(&record.key, prefix) {
                apply(&mut winners, record);
            }
        }
    }
    for meta in &deltas {
        cancel.check()?;
        for record in read_blob(&core.storage, BlobKind::Delta, meta.layer_id)? {
            if record.sequence > lower && record.sequence <= seq && matches(&record.key, prefix) {
                apply(&mut winners, record);
            }
        }
    }
    for record in buffered {
        if matches(&record.key, prefix) {
            apply(&mut winners, record);
        }
    }
    winners.retain(|_, record| !record.is_delete());
    Ok(winners)
}

/// Every live key and value as of `seq`, optionally under `prefix`.
pub(crate) fn reconstruct_state(
    core: &Core,
    seq: Sequence,
    prefix: Option<&[u8]>,
    cancel: &CancelToken,
) -> VaultResult<BTreeMap<Vec<u8>, Vec<u8>>> {
    let _gate = core.read_gate()?;
    let watermark = core.watermark()?;
    if seq > watermark {
        return Err(VaultError::invalid_range(
            seq,
            watermark,
            "sequence is ahead of the watermark",
        ));
    }
    core.index.check_readable(seq)?;

    let winners = materialize(core, seq, prefix, cancel)?;
    let mut state = BTreeMap::new();
    for (key, record) in winners {
        cancel.check()?;
        if let Some(value) = core
            .index
            .resolve_payload(&key, record.sequence, &record.payload)?
        {
            state.insert(key, value);
        }
    }
    core.metrics.increment_reads();
    Ok(state)
}
