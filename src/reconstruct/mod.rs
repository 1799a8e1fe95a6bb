//! Reconstructor
//!
//! Answers reads against past sequences:
//! - `read_at`: one key, through the key-sequence index
//! - `reconstruct_state`: every key, from the nearest image plus newer deltas
//! - `diff`: changed keys between two sequences, via the compaction DAG
//! - `diff_snapshots`: paged diff between two snapshot points, served from
//!   a finished diff job's stored report when there is one
//!
//! All readers hold the reclaim gate shared for their whole run.

mod cancel;
mod diff;
mod jobs;
mod page;
mod state;

pub use cancel::CancelToken;
pub use diff::{ChangeKind, DiffEntry, DiffReport};
pub use jobs::{DiffJob, DiffJobRegistry, DiffJobState};
pub use page::DiffPage;

pub(crate) use diff::diff;
pub(crate) use jobs::run_queued;
pub(crate) use page::{diff_snapshots, resolve_pair};
pub(crate) use state::{materialize, read_at, reconstruct_state};
