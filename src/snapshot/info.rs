//! Snapshot points
//!
//! A snapshot point is a logical marker: it freezes one sequence and copies
//! nothing. Only the lifecycle state ever changes after creation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::Sequence;
use crate::substrate::{StoreError, StoreResult, Table};

pub type SnapshotId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    Active,
    Deleted,
}

impl SnapshotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotState::Active => "active",
            SnapshotState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    /// Logical partition the snapshot belongs to
    pub scope: String,
    pub frozen_sequence: Sequence,
    pub created_at: DateTime<Utc>,
    pub state: SnapshotState,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Restricts diffs between snapshots to keys under this prefix
    pub key_prefix: Option<Vec<u8>>,
}

impl SnapshotInfo {
    pub fn new(scope: impl Into<String>, frozen_sequence: Sequence, key_prefix: Option<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope: scope.into(),
            frozen_sequence,
            created_at: Utc::now(),
            state: SnapshotState::Active,
            deleted_at: None,
            key_prefix,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SnapshotState::Active
    }

    /// Does this snapshot still hold back reclamation at `now`?
    ///
    /// Deleted snapshots keep protecting their sequence for `grace` after
    /// deletion.
    pub fn protects(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match (self.state, self.deleted_at) {
            (SnapshotState::Active, _) => true,
            (SnapshotState::Deleted, Some(at)) => !grace_elapsed(at, now, grace),
            (SnapshotState::Deleted, None) => false,
        }
    }

    /// Deleted and past its grace window.
    pub fn is_expired(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.state == SnapshotState::Deleted && !self.protects(now, grace)
    }

    pub fn row_key(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::codec(Table::Snapshots.name(), e.to_string()))
    }

    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(data).map_err(|e| StoreError::codec(Table::Snapshots.name(), e.to_string()))
    }
}

fn grace_elapsed(deleted_at: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> bool {
    match chrono::Duration::from_std(grace) {
        Ok(grace) => now >= deleted_at + grace,
        // Out of chrono's range: the window never closes
        Err(_) => false,
    }
}
