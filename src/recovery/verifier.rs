//! Consistency verifier for recovery
//!
//! Runs after orphan cleanup, before the catalog is published:
//! - every delta layer has a DAG node and every node a delta layer
//! - every layer row has a content blob
//! - current (unabsorbed) delta layers never overlap

use std::collections::HashSet;

use super::errors::{RecoveryError, RecoveryResult};
use crate::compaction::CompactionDag;
use crate::layer::{BlobKind, LayerCatalog, LayerId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationStats {
    pub deltas_verified: u64,
    pub images_verified: u64,
    pub current_layers: u64,
}

pub struct ConsistencyVerifier;

impl ConsistencyVerifier {
    /// `blobs` holds every blob present after orphan cleanup.
    pub fn verify(
        layers: &LayerCatalog,
        dag: &CompactionDag,
        blobs: &HashSet<(BlobKind, LayerId)>,
    ) -> RecoveryResult<VerificationStats> {
        let mut stats = VerificationStats::default();

        for meta in layers.deltas() {
            if dag.node_for_layer(meta.layer_id).is_none() {
                return Err(RecoveryError::LayerWithoutNode(meta.layer_id));
            }
            if !blobs.contains(&(BlobKind::Delta, meta.layer_id)) {
                return Err(RecoveryError::MissingBlob(meta.layer_id));
            }
            stats.deltas_verified += 1;
        }
        for node in dag.nodes() {
            if layers.delta(node.layer_id).is_none() {
                return Err(RecoveryError::NodeWithoutLayer {
                    node: node.node_id,
                    layer: node.layer_id,
                });
            }
        }
        for image in layers.images() {
            if !blobs.contains(&(BlobKind::Image, image.image_id)) {
                return Err(RecoveryError::MissingBlob(image.image_id));
            }
            stats.images_verified += 1;
        }

        let mut current: Vec<_> = dag.current_nodes().collect();
        current.sort_by_key(|n| n.range.start);
        for pair in current.windows(2) {
            if pair[0].range.end > pair[1].range.start {
                return Err(RecoveryError::OverlappingLayers {
                    first: pair[0].layer_id,
                    second: pair[1].layer_id,
                });
            }
        }
        stats.current_layers = current.len() as u64;
        Ok(stats)
    }
}
