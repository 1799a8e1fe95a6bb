//! Substrate error types
//!
//! Error codes:
//! - VAULT_STORE_IO_ERROR (ERROR severity, retried when transient)
//! - VAULT_STORE_CORRUPTION (FATAL severity)
//! - VAULT_STORE_CODEC (ERROR severity)
//! - VAULT_STORE_RETRIES_EXHAUSTED (ERROR severity)
//! - VAULT_STORE_LOCK_POISONED (FATAL severity)

use std::io;

use thiserror::Error;

use crate::errors::Severity;

/// Result type for substrate operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Substrate errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("substrate I/O failed during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("substrate log corrupted at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("malformed row in table {table}: {reason}")]
    Codec { table: &'static str, reason: String },

    #[error("{operation} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },

    #[error("substrate lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// I/O error with context
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    /// Malformed row
    pub fn codec(table: &'static str, reason: impl Into<String>) -> Self {
        StoreError::Codec {
            table,
            reason: reason.into(),
        }
    }

    /// Returns the stable error code
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Io { .. } => "VAULT_STORE_IO_ERROR",
            StoreError::Corruption { .. } => "VAULT_STORE_CORRUPTION",
            StoreError::Codec { .. } => "VAULT_STORE_CODEC",
            StoreError::RetriesExhausted { .. } => "VAULT_STORE_RETRIES_EXHAUSTED",
            StoreError::LockPoisoned => "VAULT_STORE_LOCK_POISONED",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            StoreError::Corruption { .. } | StoreError::LockPoisoned => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// Transient failures are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let transient = StoreError::io("commit", io::Error::new(io::ErrorKind::Interrupted, "x"));
        let permanent = StoreError::io("commit", io::Error::new(io::ErrorKind::NotFound, "x"));
        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
    }

    #[test]
    fn test_corruption_is_fatal() {
        let err = StoreError::Corruption {
            offset: 12,
            reason: "checksum".into(),
        };
        assert_eq!(err.severity(), Severity::Fatal);
        assert_eq!(err.code(), "VAULT_STORE_CORRUPTION");
    }
}
