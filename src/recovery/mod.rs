//! Recovery subsystem
//!
//! Brings an engine back after a restart or crash: reloads persisted
//! metadata, discards outputs of interrupted maintenance, verifies the
//! catalog against the compaction DAG and rebuilds the unflushed buffer.
//!
//! # Invariants
//!
//! - Every acknowledged record is readable after recovery
//! - No blob survives without a metadata row referencing it
//! - Verification failures are fatal; the engine does not open

mod errors;
mod startup;
mod verifier;

pub use errors::{RecoveryError, RecoveryResult};
pub use startup::RecoveryReport;
pub use verifier::{ConsistencyVerifier, VerificationStats};

pub(crate) use startup::recover;
