//! Snapshot registry
//!
//! Snapshot points freeze a sequence for later reads and diffs.
//!
//! - Creation is zero-copy: only the frozen sequence is recorded
//! - Deletion is logical; a deleted snapshot keeps protecting its sequence
//!   for the reclamation grace window and is purged afterwards
//! - The visibility floor is the lowest sequence any snapshot protects;
//!   nothing at or above it is ever reclaimed
//! - The number of active snapshots is capped

mod chain;
mod errors;
mod info;
mod registry;

pub use chain::SnapshotChain;
pub use errors::{SnapshotError, SnapshotResult};
pub use info::{SnapshotId, SnapshotInfo, SnapshotState};
pub use registry::{RegistryState, SnapshotRegistry};
