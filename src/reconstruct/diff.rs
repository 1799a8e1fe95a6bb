//! Differencing between two sequences
//!
//! Instead of re-scanning the state at both ends, the diff walks the
//! compaction DAG to find which files can hold a record in `(a, b]`:
//!
//! 1. `from` = files live at watermark `a`, `to` = files live at `b`
//! 2. A file is covered when its whole range is `<= a`. Covered files present
//!    in both sets are unchanged
//! 3. From every `from` file missing in `to`, walk successors level by level.
//!    A covered successor found in `to` is unchanged and ends its branch; one
//!    missing from `to` keeps the walk going. A visited file without
//!    successors that is missing from `to` has lost its lineage and is
//!    treated as changed
//! 4. Changed files = `to` files not found unchanged, plus lost-lineage files
//!
//! Only the changed files and the unflushed buffers are read. Each key seen
//! there is classified by comparing its value at `a` and at `b`.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::CancelToken;
use crate::compaction::{CompactionDag, NodeId};
use crate::engine::Core;
use crate::errors::{display_key, VaultError, VaultResult};
use crate::layer::{read_blob, BlobKind, LayerId};
use crate::observability::{log_event_with_fields, Event};
use crate::record::Sequence;

/// How a key changed between the two ends of a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Absent at the lower bound, present at the upper bound
    Created,
    /// Present at both ends with different values
    Modified,
    /// Present at the lower bound, absent at the upper bound
    Deleted,
    /// Written in between, but back to its original state
    Reverted,
}

impl ChangeKind {
    pub fn classify(before: Option<&[u8]>, after: Option<&[u8]>) -> Self {
        match (before, after) {
            (None, Some(_)) => ChangeKind::Created,
            (Some(_), None) => ChangeKind::Deleted,
            (Some(x), Some(y)) if x != y => ChangeKind::Modified,
            _ => ChangeKind::Reverted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Reverted => "reverted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub key: Vec<u8>,
    pub kind: ChangeKind,
    pub before: Option<Vec<u8>>,
    pub after: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    pub from: Sequence,
    pub to: Sequence,
    /// Layers that may hold changes, in id order
    pub files: Vec<LayerId>,
    /// Layers proven unchanged
    pub same_files: Vec<LayerId>,
    /// One entry per changed key, in key order
    pub entries: Vec<DiffEntry>,
}

impl DiffReport {
    pub fn empty(from: Sequence, to: Sequence) -> Self {
        Self {
            from,
            to,
            files: Vec::new(),
            same_files: Vec::new(),
            entries: Vec::new(),
        }
    }
}

/// Files split by the DAG walk.
#[derive(Debug, Default)]
struct FilePlan {
    same: BTreeSet<LayerId>,
    different: BTreeSet<LayerId>,
}

fn covered(dag: &CompactionDag, id: NodeId, a: Sequence) -> bool {
    let ends_before = |id: &NodeId| dag.node(*id).map_or(true, |n| n.range.ends_at_or_before(a));
    // Outputs span their inputs, so predecessors only matter once reclaimed
    dag.node(id).map_or(false, |n| n.range.ends_at_or_before(a))
        && dag.predecessors(id).iter().all(ends_before)
}

fn plan_files(dag: &CompactionDag, a: Sequence, b: Sequence) -> FilePlan {
    let from = dag.live_set(a);
    let to = dag.live_set(b);

    let mut same: BTreeSet<NodeId> = from
        .intersection(&to)
        .copied()
        .filter(|id| covered(dag, *id, a))
        .collect();
    let mut broken = BTreeSet::new();

    let mut visited: BTreeSet<NodeId> = from.difference(&to).copied().collect();
    let mut queue: VecDeque<NodeId> = visited.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        let successors = dag.successors(id);
        if successors.is_empty() {
            if !to.contains(&id) {
                broken.insert(id);
            }
            continue;
        }
        for succ in successors {
            if !covered(dag, *succ, a) || !visited.insert(*succ) {
                continue;
            }
            if to.contains(succ) {
                same.insert(*succ);
            } else {
                queue.push_back(*succ);
            }
        }
    }

    let layer_of = |id: &NodeId| dag.node(*id).map(|n| n.layer_id);
    FilePlan {
        same: same.iter().filter_map(layer_of).collect(),
        different: to
            .difference(&same)
            .chain(broken.iter())
            .filter_map(layer_of)
            .collect(),
    }
}

fn matches(key: &[u8], prefix: Option<&[u8]>) -> bool {
    prefix.map_or(true, |p| key.starts_with(p))
}

fn compute(
    core: &Core,
    a: Sequence,
    b: Sequence,
    prefix: Option<&[u8]>,
    cancel: &CancelToken,
) -> VaultResult<DiffReport> {
    let watermark = core.watermark()?;
    if a > b {
        return Err(VaultError::invalid_range(a, b, "lower bound is above upper bound"));
    }
    if b > watermark {
        return Err(VaultError::invalid_range(a, b, "upper bound is ahead of the watermark"));
    }
    core.index.check_readable(a)?;
    if a == b {
        return Ok(DiffReport::empty(a, b));
    }

    // Buffer before layers: a flush in between can only duplicate records
    let buffered = core.ingestor.buffered_between(a, b)?;
    let plan = {
        let dag = core.dag()?;
        plan_files(&dag, a, b)
    };
    let different: Vec<LayerId> = {
        let layers = core.layers()?;
        plan.different
            .iter()
            .copied()
            .filter(|id| match (prefix, layers.delta(*id)) {
                (Some(p), Some(meta)) => meta.may_match_prefix(p),
                _ => true,
            })
            .collect()
    };

    let mut keys = BTreeSet::new();
    for id in &different {
        cancel.check()?;
        for record in read_blob(&core.storage, BlobKind::Delta, *id)? {
            if record.sequence > a && record.sequence <= b && matches(&record.key, prefix) {
                keys.insert(record.key);
            }
        }
    }
    for record in buffered {
        if matches(&record.key, prefix) {
            keys.insert(record.key);
        }
    }

    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        cancel.check()?;
        let before = core.index.get_key_at_sequence(&key, a)?;
        let after = core.index.get_key_at_sequence(&key, b)?;
        entries.push(DiffEntry {
            kind: ChangeKind::classify(before.as_deref(), after.as_deref()),
            key,
            before,
            after,
        });
    }

    Ok(DiffReport {
        from: a,
        to: b,
        files: different,
        same_files: plan.same.into_iter().collect(),
        entries,
    })
}

/// Changed keys between `a` and `b`, optionally under `prefix`.
pub(crate) fn diff(
    core: &Core,
    a: Sequence,
    b: Sequence,
    prefix: Option<&[u8]>,
    cancel: &CancelToken,
) -> VaultResult<DiffReport> {
    let _gate = core.read_gate()?;
    match compute(core, a, b, prefix, cancel) {
        Ok(report) => {
            core.metrics.increment_diffs();
            log_event_with_fields(
                Event::DiffComplete,
                &[
                    ("from", &a.to_string()),
                    ("to", &b.to_string()),
                    ("prefix", &prefix.map(display_key).unwrap_or_default()),
                    ("files", &report.files.len().to_string()),
                    ("same_files", &report.same_files.len().to_string()),
                    ("entries", &report.entries.len().to_string()),
                ],
            );
            Ok(report)
        }
        Err(VaultError::Cancelled) => {
            core.metrics.increment_diffs_cancelled();
            log_event_with_fields(
                Event::DiffCancelled,
                &[("from", &a.to_string()), ("to", &b.to_string())],
            );
            Err(VaultError::Cancelled)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::CompactionNode;
    use crate::layer::LayerOrigin;
    use crate::record::SequenceRange;

    fn seq(v: u64) -> Sequence {
        Sequence::new(v)
    }

    fn flushed(dag: &mut CompactionDag, layer: u64, start: u64, end: u64) -> NodeId {
        let node = CompactionNode {
            node_id: dag.allocate_id(),
            layer_id: LayerId::new(layer),
            generation: seq(end - 1),
            range: SequenceRange::new(seq(start), seq(end)),
            origin: LayerOrigin::Flush,
            absorbed_at: None,
        };
        let id = node.node_id;
        dag.insert(node);
        id
    }

    fn compacted(dag: &mut CompactionDag, layer: u64, inputs: &[NodeId], start: u64, end: u64, at: u64) {
        let node = CompactionNode {
            node_id: dag.allocate_id(),
            layer_id: LayerId::new(layer),
            generation: seq(at),
            range: SequenceRange::new(seq(start), seq(end)),
            origin: LayerOrigin::Compaction,
            absorbed_at: None,
        };
        let id = node.node_id;
        dag.insert(node);
        for input in inputs {
            dag.mark_absorbed(*input, seq(at));
            dag.add_edge(*input, id);
        }
    }

    fn ids(values: &[u64]) -> BTreeSet<LayerId> {
        values.iter().map(|v| LayerId::new(*v)).collect()
    }

    #[test]
    fn test_classify() {
        assert_eq!(ChangeKind::classify(None, Some(b"x")), ChangeKind::Created);
        assert_eq!(ChangeKind::classify(Some(b"x"), None), ChangeKind::Deleted);
        assert_eq!(ChangeKind::classify(Some(b"x"), Some(b"y")), ChangeKind::Modified);
        assert_eq!(ChangeKind::classify(Some(b"x"), Some(b"x")), ChangeKind::Reverted);
        assert_eq!(ChangeKind::classify(None, None), ChangeKind::Reverted);
    }

    #[test]
    fn test_plan_includes_only_intersecting_layers() {
        let mut dag = CompactionDag::new();
        flushed(&mut dag, 1, 1, 3);
        flushed(&mut dag, 2, 3, 5);
        flushed(&mut dag, 3, 5, 7);
        flushed(&mut dag, 4, 7, 9);

        let plan = plan_files(&dag, seq(2), seq(6));
        assert_eq!(plan.same, ids(&[1]));
        assert_eq!(plan.different, ids(&[2, 3]));
    }

    #[test]
    fn test_plan_across_compaction() {
        let mut dag = CompactionDag::new();
        let l1 = flushed(&mut dag, 1, 1, 3);
        let l2 = flushed(&mut dag, 2, 3, 5);
        compacted(&mut dag, 10, &[l1, l2], 1, 5, 4);
        flushed(&mut dag, 3, 5, 7);

        // Target already holds the merged output
        let plan = plan_files(&dag, seq(4), seq(6));
        assert!(plan.same.contains(&LayerId::new(10)));
        assert_eq!(plan.different, ids(&[3]));

        // Target predates the merge
        let plan = plan_files(&dag, seq(2), seq(6));
        assert!(plan.different.contains(&LayerId::new(10)));
        assert!(!plan.same.contains(&LayerId::new(10)));
    }

    #[test]
    fn test_plan_follows_covered_successors() {
        let mut dag = CompactionDag::new();
        let l1 = flushed(&mut dag, 1, 1, 3);
        let l2 = flushed(&mut dag, 2, 3, 5);
        compacted(&mut dag, 10, &[l1, l2], 1, 5, 5);
        flushed(&mut dag, 3, 5, 7);

        // L1 and L2 were live at 4, only the output at 6
        let plan = plan_files(&dag, seq(4), seq(6));
        assert_eq!(plan.same, ids(&[10]));
        assert_eq!(plan.different, ids(&[3]));
    }
}
