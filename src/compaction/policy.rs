//! Compaction candidate selection
//!
//! Policy: sequence-tiered runs.
//!
//! - Current delta layers are ordered by range start and cut into runs of
//!   contiguous ranges
//! - Layer-count trigger: once the current layer count reaches
//!   `trigger_layers`, the oldest stretch of at least two unsettled layers is
//!   merged. A layer is settled when it already holds a full output's worth
//!   of records.
//! - Size trigger: the same selection once the current layers together reach
//!   `trigger_bytes`, however few of them there are
//! - Tombstone trigger: any window of at least two layers whose tombstone
//!   count and ratio reach the thresholds is merged, settled or not
//! - Inputs are capped at `max_inputs` layers and `max_input_bytes`

use crate::config::EngineConfig;
use crate::layer::DeltaLayerMeta;
use crate::record::SequenceRange;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionPolicy {
    pub trigger_layers: usize,
    pub trigger_bytes: u64,
    pub max_inputs: usize,
    pub max_input_bytes: u64,
    pub max_output_records: usize,
    pub min_tombstones: u64,
    pub tombstone_ratio: f64,
}

impl CompactionPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            trigger_layers: config.compaction_trigger_layers,
            trigger_bytes: config.compaction_trigger_bytes,
            max_inputs: config.compaction_max_inputs,
            max_input_bytes: config.compaction_max_input_bytes,
            max_output_records: config.compaction_max_output_records,
            min_tombstones: config.compaction_min_tombstones,
            tombstone_ratio: config.compaction_tombstone_ratio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionTrigger {
    LayerCount,
    TotalSize,
    TombstoneRatio,
    Manual,
}

impl CompactionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionTrigger::LayerCount => "layer_count",
            CompactionTrigger::TotalSize => "total_size",
            CompactionTrigger::TombstoneRatio => "tombstone_ratio",
            CompactionTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactionPlan {
    /// Inputs in range order
    pub inputs: Vec<DeltaLayerMeta>,
    /// Union of the input ranges
    pub range: SequenceRange,
    pub trigger: CompactionTrigger,
}

impl CompactionPolicy {
    /// Pick the next merge among the current layers, if any is due.
    ///
    /// `force` selects the oldest eligible stretch even below the
    /// layer-count trigger.
    pub fn select(&self, layers: &[DeltaLayerMeta], force: bool) -> Option<CompactionPlan> {
        let mut sorted: Vec<&DeltaLayerMeta> = layers.iter().collect();
        sorted.sort_by_key(|m| (m.range.start, m.layer_id));
        let runs = contiguous_runs(&sorted);

        let total_bytes: u64 = layers.iter().map(|m| m.byte_size).sum();
        let trigger = if force {
            Some(CompactionTrigger::Manual)
        } else if layers.len() >= self.trigger_layers {
            Some(CompactionTrigger::LayerCount)
        } else if total_bytes >= self.trigger_bytes {
            Some(CompactionTrigger::TotalSize)
        } else {
            None
        };
        if let Some(trigger) = trigger {
            for run in &runs {
                if let Some(plan) = self.oldest_unsettled(run, trigger) {
                    return Some(plan);
                }
            }
        }

        for run in &runs {
            for start in 0..run.len() {
                let window = self.capped_window(&run[start..]);
                if window.len() < 2 {
                    continue;
                }
                let tombstones: u64 = window.iter().map(|m| m.tombstone_count).sum();
                let records: u64 = window.iter().map(|m| m.record_count).sum();
                let ratio = if records == 0 {
                    0.0
                } else {
                    tombstones as f64 / records as f64
                };
                if tombstones >= self.min_tombstones && ratio >= self.tombstone_ratio {
                    return Some(plan(window, CompactionTrigger::TombstoneRatio));
                }
            }
        }
        None
    }

    fn oldest_unsettled(&self, run: &[&DeltaLayerMeta], trigger: CompactionTrigger) -> Option<CompactionPlan> {
        let mut start = 0;
        while start < run.len() {
            if self.is_settled(run[start]) {
                start += 1;
                continue;
            }
            let end = run[start..]
                .iter()
                .position(|m| self.is_settled(m))
                .map_or(run.len(), |p| start + p);
            let window = self.capped_window(&run[start..end]);
            if window.len() >= 2 {
                return Some(plan(window, trigger));
            }
            start = end;
        }
        None
    }

    fn is_settled(&self, meta: &DeltaLayerMeta) -> bool {
        meta.record_count as usize >= self.max_output_records
    }

    /// Longest prefix of `layers` within the input caps; always at least two
    /// layers when two are available.
    fn capped_window<'a>(&self, layers: &[&'a DeltaLayerMeta]) -> Vec<&'a DeltaLayerMeta> {
        let mut window = Vec::new();
        let mut bytes = 0u64;
        for meta in layers {
            if window.len() >= self.max_inputs {
                break;
            }
            if window.len() >= 2 && bytes + meta.byte_size > self.max_input_bytes {
                break;
            }
            bytes += meta.byte_size;
            window.push(*meta);
        }
        window
    }
}

fn contiguous_runs<'a>(sorted: &[&'a DeltaLayerMeta]) -> Vec<Vec<&'a DeltaLayerMeta>> {
    let mut runs: Vec<Vec<&DeltaLayerMeta>> = Vec::new();
    for meta in sorted {
        match runs.last_mut() {
            Some(run) if run.last().map(|m| m.range.end) == Some(meta.range.start) => run.push(meta),
            _ => runs.push(vec![meta]),
        }
    }
    runs
}

fn plan(window: Vec<&DeltaLayerMeta>, trigger: CompactionTrigger) -> CompactionPlan {
    let start = window[0].range.start;
    let end = window[window.len() - 1].range.end;
    CompactionPlan {
        inputs: window.into_iter().cloned().collect(),
        range: SequenceRange::new(start, end),
        trigger,
    }
}
