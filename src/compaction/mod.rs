//! Compaction
//!
//! Merges runs of adjacent delta layers and records the lineage in the
//! compaction DAG.
//!
//! Commit protocol:
//! 1. Select inputs among current (unabsorbed) layers
//! 2. Merge and write each output blob in its own batch
//! 3. One batch: output metadata and coverage, output nodes, an edge from
//!    every input to every output, inputs marked absorbed
//!
//! Inputs stay physically present until reclamation. A crash before step 3
//! leaves only orphan output blobs, which recovery deletes; the inputs are
//! untouched and the merge is simply retried.

mod dag;
mod merge;
mod policy;

pub use dag::{CompactionDag, CompactionNode, NodeId};
pub use merge::{merge_records, split_outputs, MergeOutcome};
pub use policy::{CompactionPlan, CompactionPolicy, CompactionTrigger};

use crate::engine::Core;
use crate::errors::VaultResult;
use crate::layer::{read_blob, write_blob, BlobKind, DeltaLayerMeta, LayerId, LayerOrigin};
use crate::observability::{log_event_with_fields, Event};
use crate::record::SequenceRange;
use crate::substrate::WriteBatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub trigger: CompactionTrigger,
    pub range: SequenceRange,
    pub inputs: Vec<LayerId>,
    pub outputs: Vec<LayerId>,
    pub records_in: u64,
    pub records_out: u64,
    pub records_dropped: u64,
}

/// Delta layers not yet absorbed into a compaction.
pub(crate) fn current_layers(core: &Core) -> VaultResult<Vec<DeltaLayerMeta>> {
    let dag = core.dag()?;
    let layers = core.layers()?;
    Ok(layers
        .deltas()
        .filter(|m| {
            dag.node_for_layer(m.layer_id)
                .map_or(false, |n| n.absorbed_at.is_none())
        })
        .cloned()
        .collect())
}

/// Run one compaction if the policy selects one (always when `force`).
pub(crate) fn compact(core: &Core, force: bool) -> VaultResult<Option<CompactionReport>> {
    let _maintenance = core.lock_maintenance()?;
    let plan = match core.compaction_policy().select(&current_layers(core)?, force) {
        Some(plan) => plan,
        None => return Ok(None),
    };

    let mut inputs = Vec::with_capacity(plan.inputs.len());
    for meta in &plan.inputs {
        inputs.push(read_blob(&core.storage, BlobKind::Delta, meta.layer_id)?);
    }
    let records_in: u64 = inputs.iter().map(|r| r.len() as u64).sum();
    let merged = merge_records(inputs, core.index.reclaimed_floor());
    let records_out = merged.records.len() as u64;
    let chunks = split_outputs(
        merged.records,
        plan.range,
        core.config.compaction_max_output_records,
    );

    // Output generation: the watermark now, which is >= every input's
    let generation = core.watermark()?;
    let mut outputs = Vec::with_capacity(chunks.len());
    for (range, records) in &chunks {
        let layer_id = core.layers_mut()?.reserve_id();
        let byte_size = write_blob(&core.storage, BlobKind::Delta, layer_id, records)?;
        outputs.push(DeltaLayerMeta::build(
            layer_id,
            *range,
            records,
            byte_size,
            generation,
            LayerOrigin::Compaction,
            core.build_params(),
        ));
    }

    {
        let mut dag = core.dag_mut()?;
        let mut layers = core.layers_mut()?;
        let mut batch = WriteBatch::new();

        let mut input_nodes = Vec::with_capacity(plan.inputs.len());
        for meta in &plan.inputs {
            if let Some(node) = dag.node_for_layer(meta.layer_id) {
                let mut absorbed = node.clone();
                absorbed.absorbed_at = Some(generation);
                input_nodes.push(absorbed);
            }
        }

        let mut output_nodes = Vec::with_capacity(outputs.len());
        for meta in &outputs {
            let node = CompactionNode {
                node_id: dag.allocate_id(),
                layer_id: meta.layer_id,
                generation,
                range: meta.range,
                origin: LayerOrigin::Compaction,
                absorbed_at: None,
            };
            layers.stage_delta(&mut batch, meta)?;
            output_nodes.push(node);
        }
        for node in input_nodes.iter().chain(output_nodes.iter()) {
            dag.stage_node(&mut batch, node)?;
        }
        for input in &input_nodes {
            for output in &output_nodes {
                dag.stage_edge(&mut batch, input.node_id, output.node_id);
            }
        }
        layers.stage_counter(&mut batch);
        core.storage.commit(&batch)?;

        for meta in &outputs {
            layers.insert_delta(meta.clone());
        }
        for node in &output_nodes {
            dag.insert(node.clone());
        }
        for input in &input_nodes {
            dag.mark_absorbed(input.node_id, generation);
            for output in &output_nodes {
                dag.add_edge(input.node_id, output.node_id);
            }
        }
    }

    let report = CompactionReport {
        trigger: plan.trigger,
        range: plan.range,
        inputs: plan.inputs.iter().map(|m| m.layer_id).collect(),
        outputs: outputs.iter().map(|m| m.layer_id).collect(),
        records_in,
        records_out,
        records_dropped: merged.dropped,
    };
    core.metrics.increment_compactions();
    core.metrics.add_records_dropped(merged.dropped);
    log_event_with_fields(
        Event::CompactionComplete,
        &[
            ("trigger", report.trigger.as_str()),
            ("range", &report.range.to_string()),
            ("inputs", &report.inputs.len().to_string()),
            ("outputs", &report.outputs.len().to_string()),
            ("records_dropped", &report.records_dropped.to_string()),
        ],
    );
    Ok(Some(report))
}
