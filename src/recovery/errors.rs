//! Recovery error types
//!
//! Error codes:
//! - VAULT_RECOVERY_VERIFICATION_FAILED (FATAL)
//!
//! Every recovery error is fatal: the engine refuses to serve reads over a
//! catalog it cannot trust.

use thiserror::Error;

use crate::compaction::NodeId;
use crate::errors::Severity;
use crate::layer::LayerId;

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("delta layer {0} has no compaction DAG node")]
    LayerWithoutNode(LayerId),

    #[error("current DAG node {node} points at unknown layer {layer}")]
    NodeWithoutLayer { node: NodeId, layer: LayerId },

    #[error("delta layer {0} has no content blob")]
    MissingBlob(LayerId),

    #[error("current delta layers overlap: {first} and {second}")]
    OverlappingLayers { first: LayerId, second: LayerId },
}

impl RecoveryError {
    pub fn code(&self) -> &'static str {
        "VAULT_RECOVERY_VERIFICATION_FAILED"
    }

    pub fn severity(&self) -> Severity {
        Severity::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_recovery_errors_are_fatal() {
        let err = RecoveryError::MissingBlob(LayerId::new(3));
        assert_eq!(err.severity(), Severity::Fatal);
        assert_eq!(err.code(), "VAULT_RECOVERY_VERIFICATION_FAILED");
        assert!(err.to_string().contains("L3"));
    }
}
