//! Snapshot registry errors
//!
//! Error codes:
//! - VAULT_SNAPSHOT_NOT_FOUND (ERROR severity)
//! - VAULT_SNAPSHOT_NOT_ACTIVE (ERROR severity)
//! - VAULT_SNAPSHOT_LIMIT (ERROR severity)
//! - VAULT_SNAPSHOT_SEQUENCE (ERROR severity)
//!
//! None of these is fatal: a rejected snapshot request leaves the registry
//! untouched.

use thiserror::Error;

use super::{SnapshotId, SnapshotState};
use crate::errors::Severity;
use crate::record::Sequence;

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {0} not found")]
    NotFound(SnapshotId),

    #[error("snapshot {id} is {state}, not active")]
    NotActive { id: SnapshotId, state: SnapshotState },

    #[error("snapshot limit of {limit} reached")]
    TooManySnapshots { limit: usize },

    #[error("cannot freeze sequence {requested}: watermark is {watermark}")]
    SequenceAhead { requested: Sequence, watermark: Sequence },
}

impl SnapshotError {
    pub fn code(&self) -> &'static str {
        match self {
            SnapshotError::NotFound(_) => "VAULT_SNAPSHOT_NOT_FOUND",
            SnapshotError::NotActive { .. } => "VAULT_SNAPSHOT_NOT_ACTIVE",
            SnapshotError::TooManySnapshots { .. } => "VAULT_SNAPSHOT_LIMIT",
            SnapshotError::SequenceAhead { .. } => "VAULT_SNAPSHOT_SEQUENCE",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_codes() {
        let id = Uuid::nil();
        assert_eq!(SnapshotError::NotFound(id).code(), "VAULT_SNAPSHOT_NOT_FOUND");
        assert_eq!(
            SnapshotError::TooManySnapshots { limit: 3 }.to_string(),
            "snapshot limit of 3 reached"
        );
        assert_eq!(SnapshotError::NotFound(id).severity(), Severity::Error);
    }
}
