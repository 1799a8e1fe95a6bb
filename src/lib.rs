//! seqvault - point-in-time reads, sequence diffs and safe reclamation
//! over an ordered key-value change feed

pub mod checkpoint;
pub mod cli;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod errors;
pub mod filter;
pub mod history;
pub mod ingest;
pub mod layer;
pub mod observability;
pub mod reclaim;
pub mod reconstruct;
pub mod record;
pub mod recovery;
pub mod snapshot;
pub mod substrate;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStats, MaintenancePass, MaintenanceTask};
pub use errors::{Severity, VaultError, VaultResult};
pub use reconstruct::{CancelToken, ChangeKind, DiffEntry, DiffJob, DiffJobState, DiffPage, DiffReport};
pub use record::{ChangeRecord, Operation, Payload, Sequence, SequenceRange};
pub use snapshot::{SnapshotId, SnapshotInfo, SnapshotState};
