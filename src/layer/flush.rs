//! Buffer flush into a delta layer
//!
//! 1. Freeze the active buffer (brief ingest pause)
//! 2. Write the content blob in its own batch
//! 3. Commit metadata, coverage rows, DAG node and `flushed_through` in one
//!    batch, then publish them in memory
//! 4. Release the frozen buffer
//!
//! A failure after step 2 leaves an orphan blob for recovery and keeps the
//! frozen buffer, so the next flush retries the same records. Layer ranges
//! start right after the previous flush, so flushed layers tile the
//! sequence space without gaps.

use super::blob::{write_blob, BlobKind};
use super::meta::{DeltaLayerMeta, LayerId, LayerOrigin};
use crate::compaction::CompactionNode;
use crate::engine::Core;
use crate::errors::VaultResult;
use crate::observability::{log_event_with_fields, Event};
use crate::record::{Sequence, SequenceRange};
use crate::substrate::meta::{self, FLUSHED_THROUGH};
use crate::substrate::WriteBatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub layer_id: LayerId,
    pub range: SequenceRange,
    pub record_count: u64,
    pub byte_size: u64,
}

pub(crate) fn flush(core: &Core) -> VaultResult<Option<FlushReport>> {
    let _flush = core.lock_flush()?;
    let frozen = match core.ingestor.freeze()? {
        Some(frozen) => frozen,
        None => return Ok(None),
    };
    let records = frozen.records();
    let last = match frozen.last_sequence() {
        Some(last) => last,
        None => {
            core.ingestor.release_frozen()?;
            return Ok(None);
        }
    };
    let range = SequenceRange::new(core.flushed_through().next(), last.next());

    let layer_id = core.layers_mut()?.reserve_id();
    let byte_size = write_blob(&core.storage, BlobKind::Delta, layer_id, records)?;
    let generation = core.watermark()?;
    let meta = DeltaLayerMeta::build(
        layer_id,
        range,
        records,
        byte_size,
        generation,
        LayerOrigin::Flush,
        core.build_params(),
    );

    {
        let mut dag = core.dag_mut()?;
        let mut layers = core.layers_mut()?;
        let node = CompactionNode {
            node_id: dag.allocate_id(),
            layer_id,
            generation,
            range,
            origin: LayerOrigin::Flush,
            absorbed_at: None,
        };

        let mut batch = WriteBatch::new();
        layers.stage_delta(&mut batch, &meta)?;
        layers.stage_counter(&mut batch);
        dag.stage_node(&mut batch, &node)?;
        meta::put_u64(&mut batch, FLUSHED_THROUGH, last.value());
        core.storage.commit(&batch)?;

        layers.insert_delta(meta.clone());
        dag.insert(node);
        core.set_flushed_through(last);
    }
    core.ingestor.release_frozen()?;

    core.metrics.increment_flushes();
    core.metrics.add_records_flushed(meta.record_count);
    log_event_with_fields(
        Event::FlushComplete,
        &[
            ("layer_id", &layer_id.to_string()),
            ("range", &range.to_string()),
            ("records", &meta.record_count.to_string()),
            ("bytes", &byte_size.to_string()),
        ],
    );

    Ok(Some(FlushReport {
        layer_id,
        range,
        record_count: meta.record_count,
        byte_size,
    }))
}

/// Last sequence covered by committed layers, as persisted.
pub(crate) fn load_flushed_through(core: &Core) -> VaultResult<Sequence> {
    Ok(Sequence::new(
        meta::get_u64(&core.storage, FLUSHED_THROUGH)?.unwrap_or(0),
    ))
}
