//! Engine error types
//!
//! Error codes:
//! - VAULT_SEQUENCE_OUT_OF_ORDER (FATAL for the record stream)
//! - VAULT_SEQUENCE_GAP (FATAL for the record stream)
//! - VAULT_SEQUENCE_RESERVED (ERROR severity)
//! - VAULT_HISTORY_RECLAIMED (ERROR severity)
//! - VAULT_PAYLOAD_MISSING (FATAL severity)
//! - VAULT_LAYER_MISSING (FATAL severity)
//! - VAULT_CANCELLED (ERROR severity)
//! - VAULT_INVALID_RANGE (ERROR severity)
//! - VAULT_INVALID_PAGE_TOKEN (ERROR severity)
//! - VAULT_LOCK_POISONED (FATAL severity)
//! - VAULT_MAINTENANCE_STOPPED (ERROR severity)
//! - VAULT_DIFF_JOB_NOT_FOUND (ERROR severity)
//! - VAULT_DIFF_JOB_NOT_CANCELLABLE (ERROR severity)
//!
//! Substrate, snapshot, feed, recovery and config errors are wrapped and keep their own codes.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::ingest::FeedError;
use crate::layer::LayerId;
use crate::reconstruct::DiffJobState;
use crate::record::Sequence;
use crate::recovery::RecoveryError;
use crate::snapshot::{SnapshotError, SnapshotId};
use crate::substrate::StoreError;

/// Severity levels for engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, engine continues
    Error,
    /// State can no longer be trusted; the caller must stop the stream or process
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result type for engine operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Engine errors
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("sequence {sequence} for key {key:?} is not after last observed sequence {last}")]
    SequenceOutOfOrder {
        key: String,
        sequence: Sequence,
        last: Sequence,
    },

    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap {
        expected: Sequence,
        received: Sequence,
    },

    #[error("sequence {0} is reserved and cannot be ingested")]
    SequenceReserved(Sequence),

    #[error("history at sequence {requested} was reclaimed (retained from {floor})")]
    HistoryReclaimed {
        requested: Sequence,
        floor: Sequence,
    },

    #[error("externalized value for key {key:?} at sequence {sequence} is missing")]
    PayloadMissing { key: String, sequence: Sequence },

    #[error("content of layer {0} is missing")]
    LayerMissing(LayerId),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid sequence range {from}..{to}: {reason}")]
    InvalidRange {
        from: Sequence,
        to: Sequence,
        reason: String,
    },

    #[error("invalid page token {0:?}")]
    InvalidPageToken(String),

    #[error("engine lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("background maintenance worker is not running")]
    MaintenanceStopped,

    #[error("no diff job from snapshot {from} to snapshot {to}")]
    DiffJobNotFound { from: SnapshotId, to: SnapshotId },

    #[error("diff job {job_id} is {state} and cannot be cancelled")]
    DiffJobNotCancellable { job_id: uuid::Uuid, state: DiffJobState },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl VaultError {
    /// Out-of-order error with a printable key
    pub fn out_of_order(key: &[u8], sequence: Sequence, last: Sequence) -> Self {
        VaultError::SequenceOutOfOrder {
            key: display_key(key),
            sequence,
            last,
        }
    }

    pub fn payload_missing(key: &[u8], sequence: Sequence) -> Self {
        VaultError::PayloadMissing {
            key: display_key(key),
            sequence,
        }
    }

    pub fn invalid_range(from: Sequence, to: Sequence, reason: impl Into<String>) -> Self {
        VaultError::InvalidRange {
            from,
            to,
            reason: reason.into(),
        }
    }

    /// Returns the stable error code
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::SequenceOutOfOrder { .. } => "VAULT_SEQUENCE_OUT_OF_ORDER",
            VaultError::SequenceGap { .. } => "VAULT_SEQUENCE_GAP",
            VaultError::SequenceReserved(_) => "VAULT_SEQUENCE_RESERVED",
            VaultError::HistoryReclaimed { .. } => "VAULT_HISTORY_RECLAIMED",
            VaultError::PayloadMissing { .. } => "VAULT_PAYLOAD_MISSING",
            VaultError::LayerMissing(_) => "VAULT_LAYER_MISSING",
            VaultError::Cancelled => "VAULT_CANCELLED",
            VaultError::InvalidRange { .. } => "VAULT_INVALID_RANGE",
            VaultError::InvalidPageToken(_) => "VAULT_INVALID_PAGE_TOKEN",
            VaultError::LockPoisoned(_) => "VAULT_LOCK_POISONED",
            VaultError::MaintenanceStopped => "VAULT_MAINTENANCE_STOPPED",
            VaultError::DiffJobNotFound { .. } => "VAULT_DIFF_JOB_NOT_FOUND",
            VaultError::DiffJobNotCancellable { .. } => "VAULT_DIFF_JOB_NOT_CANCELLABLE",
            VaultError::Store(e) => e.code(),
            VaultError::Snapshot(e) => e.code(),
            VaultError::Feed(e) => e.code(),
            VaultError::Recovery(e) => e.code(),
            VaultError::Config(e) => e.code(),
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            VaultError::SequenceOutOfOrder { .. }
            | VaultError::SequenceGap { .. }
            | VaultError::PayloadMissing { .. }
            | VaultError::LayerMissing(_)
            | VaultError::LockPoisoned(_)
            | VaultError::Recovery(_)
            | VaultError::Config(_) => Severity::Fatal,
            VaultError::Store(e) => e.severity(),
            _ => Severity::Error,
        }
    }
}

/// Lossy UTF-8 rendering of a key for messages and logs.
pub fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_is_fatal() {
        let err = VaultError::out_of_order(b"a", Sequence::new(3), Sequence::new(5));
        assert_eq!(err.code(), "VAULT_SEQUENCE_OUT_OF_ORDER");
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(err.to_string().contains("\"a\""));
    }

    #[test]
    fn test_wrapped_store_error_keeps_code() {
        let err: VaultError = StoreError::LockPoisoned.into();
        assert_eq!(err.code(), "VAULT_STORE_LOCK_POISONED");
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[test]
    fn test_cancelled_is_not_fatal() {
        assert_eq!(VaultError::Cancelled.severity(), Severity::Error);
    }
}
