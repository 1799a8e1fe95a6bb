//! Compaction dependency graph
//!
//! One node per physical delta layer, one edge per (input, output) pair of a
//! compaction. The graph lives in an arena indexed by node id with separate
//! successor and predecessor lists.
//!
//! Acyclicity: node ids are allocated monotonically and an edge is only ever
//! added from an existing node to a node created by the same commit, so every
//! edge points from a lower id to a higher one.
//!
//! Visibility: `live_set(x)` is the set of nodes that made up the layer set
//! when the watermark was `x`.
//! - a flushed layer is visible from the start of its range
//! - a compaction output is visible from its generation
//! - a node stops being visible once it is absorbed at or before `x`

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::layer::{LayerId, LayerOrigin};
use crate::record::{Sequence, SequenceRange};
use crate::substrate::meta::{self, NEXT_NODE_ID};
use crate::substrate::{StorageHandle, StoreError, StoreResult, Table, WriteBatch};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionNode {
    pub node_id: NodeId,
    pub layer_id: LayerId,
    /// Watermark when the layer was committed
    pub generation: Sequence,
    pub range: SequenceRange,
    pub origin: LayerOrigin,
    /// Watermark when the layer was merged into successors
    pub absorbed_at: Option<Sequence>,
}

impl CompactionNode {
    /// Was this node part of the layer set at watermark `x`?
    pub fn visible_at(&self, x: Sequence) -> bool {
        let from = match self.origin {
            LayerOrigin::Flush => self.range.start,
            LayerOrigin::Compaction => self.generation,
        };
        from <= x && self.absorbed_at.map_or(true, |absorbed| absorbed > x)
    }

    fn encode(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| StoreError::codec(Table::CompactionNodes.name(), e.to_string()))
    }
}

fn edge_key(from: NodeId, to: NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&from.value().to_be_bytes());
    key.extend_from_slice(&to.value().to_be_bytes());
    key
}

#[derive(Debug, Default)]
pub struct CompactionDag {
    nodes: Vec<Option<CompactionNode>>,
    successors: Vec<Vec<NodeId>>,
    predecessors: Vec<Vec<NodeId>>,
    by_layer: HashMap<LayerId, NodeId>,
    next_id: u64,
}

impl CompactionDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load nodes and edges from the substrate.
    pub fn load(storage: &StorageHandle) -> StoreResult<Self> {
        let mut dag = Self::new();
        for (_, value) in storage.range(Table::CompactionNodes, &[], None)? {
            let node: CompactionNode = serde_json::from_slice(&value)
                .map_err(|e| StoreError::codec(Table::CompactionNodes.name(), e.to_string()))?;
            dag.insert(node);
        }
        for (key, _) in storage.range(Table::CompactionEdges, &[], None)? {
            if key.len() != 16 {
                return Err(StoreError::codec(
                    Table::CompactionEdges.name(),
                    "bad edge key length",
                ));
            }
            let mut from = [0u8; 8];
            let mut to = [0u8; 8];
            from.copy_from_slice(&key[..8]);
            to.copy_from_slice(&key[8..]);
            dag.add_edge(
                NodeId::new(u64::from_be_bytes(from)),
                NodeId::new(u64::from_be_bytes(to)),
            );
        }
        let persisted = meta::get_u64(storage, NEXT_NODE_ID)?.unwrap_or(0);
        dag.next_id = dag.next_id.max(persisted);
        Ok(dag)
    }

    /// Reserve a node id; the counter is persisted by `stage_node`.
    pub fn allocate_id(&mut self) -> NodeId {
        let id = NodeId::new(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn stage_node(&self, batch: &mut WriteBatch, node: &CompactionNode) -> StoreResult<()> {
        batch.put(
            Table::CompactionNodes,
            node.node_id.value().to_be_bytes().to_vec(),
            node.encode()?,
        );
        meta::put_u64(batch, NEXT_NODE_ID, self.next_id);
        Ok(())
    }

    pub fn stage_edge(&self, batch: &mut WriteBatch, from: NodeId, to: NodeId) {
        batch.put(Table::CompactionEdges, edge_key(from, to), Vec::new());
    }

    /// Stage removal of a node and its outgoing edges.
    pub fn stage_remove(&self, batch: &mut WriteBatch, id: NodeId) {
        batch.delete(Table::CompactionNodes, id.value().to_be_bytes().to_vec());
        for succ in self.successors(id) {
            batch.delete(Table::CompactionEdges, edge_key(id, *succ));
        }
        for pred in self.predecessors(id) {
            batch.delete(Table::CompactionEdges, edge_key(*pred, id));
        }
    }

    /// Apply a committed node.
    pub fn insert(&mut self, node: CompactionNode) {
        let idx = node.node_id.index();
        if self.nodes.len() <= idx {
            self.nodes.resize(idx + 1, None);
            self.successors.resize(idx + 1, Vec::new());
            self.predecessors.resize(idx + 1, Vec::new());
        }
        self.next_id = self.next_id.max(node.node_id.value() + 1);
        self.by_layer.insert(node.layer_id, node.node_id);
        self.nodes[idx] = Some(node);
    }

    /// Apply a committed edge.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        let needed = from.index().max(to.index()) + 1;
        if self.successors.len() < needed {
            self.nodes.resize(needed, None);
            self.successors.resize(needed, Vec::new());
            self.predecessors.resize(needed, Vec::new());
        }
        if !self.successors[from.index()].contains(&to) {
            self.successors[from.index()].push(to);
            self.predecessors[to.index()].push(from);
        }
    }

    /// Apply a committed absorption.
    pub fn mark_absorbed(&mut self, id: NodeId, at: Sequence) {
        if let Some(Some(node)) = self.nodes.get_mut(id.index()) {
            node.absorbed_at = Some(at);
        }
    }

    /// Apply a committed removal.
    pub fn remove(&mut self, id: NodeId) -> Option<CompactionNode> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        self.by_layer.remove(&node.layer_id);
        let succs = std::mem::take(&mut self.successors[id.index()]);
        for succ in succs {
            self.predecessors[succ.index()].retain(|p| *p != id);
        }
        let preds = std::mem::take(&mut self.predecessors[id.index()]);
        for pred in preds {
            self.successors[pred.index()].retain(|s| *s != id);
        }
        Some(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&CompactionNode> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    pub fn node_for_layer(&self, layer: LayerId) -> Option<&CompactionNode> {
        self.by_layer.get(&layer).and_then(|id| self.node(*id))
    }

    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        self.successors.get(id.index()).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        self.predecessors.get(id.index()).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.successors(id).is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CompactionNode> {
        self.nodes.iter().flatten()
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn edge_count(&self) -> usize {
        self.successors.iter().map(|s| s.len()).sum()
    }

    /// Nodes that made up the layer set at watermark `x`.
    pub fn live_set(&self, x: Sequence) -> BTreeSet<NodeId> {
        self.nodes()
            .filter(|n| n.visible_at(x))
            .map(|n| n.node_id)
            .collect()
    }

    /// Nodes not yet absorbed into any compaction.
    pub fn current_nodes(&self) -> impl Iterator<Item = &CompactionNode> {
        self.nodes().filter(|n| n.absorbed_at.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64, start: u64, end: u64, generation: u64, origin: LayerOrigin) -> CompactionNode {
        CompactionNode {
            node_id: NodeId::new(id),
            layer_id: LayerId::new(id + 100),
            generation: Sequence::new(generation),
            range: SequenceRange::new(Sequence::new(start), Sequence::new(end)),
            origin,
            absorbed_at: None,
        }
    }

    fn compacted_pair() -> CompactionDag {
        let mut dag = CompactionDag::new();
        dag.insert(node(0, 1, 3, 2, LayerOrigin::Flush));
        dag.insert(node(1, 3, 5, 4, LayerOrigin::Flush));
        dag.insert(node(2, 1, 5, 6, LayerOrigin::Compaction));
        dag.add_edge(NodeId::new(0), NodeId::new(2));
        dag.add_edge(NodeId::new(1), NodeId::new(2));
        dag.mark_absorbed(NodeId::new(0), Sequence::new(6));
        dag.mark_absorbed(NodeId::new(1), Sequence::new(6));
        dag
    }

    #[test]
    fn test_live_set_follows_absorption() {
        let dag = compacted_pair();
        let ids = |x| dag.live_set(Sequence::new(x)).into_iter().map(|n| n.value()).collect::<Vec<_>>();
        assert_eq!(ids(0), Vec::<u64>::new());
        assert_eq!(ids(2), vec![0]);
        assert_eq!(ids(5), vec![0, 1]);
        assert_eq!(ids(6), vec![2]);
    }

    #[test]
    fn test_adjacency() {
        let dag = compacted_pair();
        assert_eq!(dag.successors(NodeId::new(0)), &[NodeId::new(2)]);
        assert_eq!(dag.predecessors(NodeId::new(2)).len(), 2);
        assert!(dag.is_leaf(NodeId::new(2)));
        assert!(!dag.is_leaf(NodeId::new(1)));
        assert_eq!(dag.edge_count(), 2);
    }

    #[test]
    fn test_remove_detaches_edges() {
        let mut dag = compacted_pair();
        dag.remove(NodeId::new(0)).unwrap();
        assert_eq!(dag.predecessors(NodeId::new(2)), &[NodeId::new(1)]);
        assert!(dag.node_for_layer(LayerId::new(100)).is_none());
        assert_eq!(dag.node_count(), 2);
    }

    #[test]
    fn test_persisted_graph_reloads() {
        let storage = StorageHandle::in_memory();
        let mut dag = CompactionDag::new();
        let mut batch = WriteBatch::new();
        let a = dag.allocate_id();
        let b = dag.allocate_id();
        let mut first = node(a.value(), 1, 3, 2, LayerOrigin::Flush);
        first.absorbed_at = Some(Sequence::new(4));
        dag.stage_node(&mut batch, &first).unwrap();
        dag.stage_node(&mut batch, &node(b.value(), 1, 3, 4, LayerOrigin::Compaction)).unwrap();
        dag.stage_edge(&mut batch, a, b);
        storage.commit(&batch).unwrap();

        let mut loaded = CompactionDag::load(&storage).unwrap();
        assert_eq!(loaded.node_count(), 2);
        assert_eq!(loaded.successors(a), &[b]);
        assert_eq!(loaded.allocate_id(), NodeId::new(2));
    }
}
