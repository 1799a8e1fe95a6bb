//! Snapshot registry
//!
//! Every snapshot is persisted in the `snapshots` table before it becomes
//! visible in memory. The registry lock doubles as the reclamation barrier:
//! reclamation computes the visibility floor and deletes under the same
//! guard, so a snapshot created concurrently is either seen by the floor
//! computation or created after the deletion finished.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::chain::SnapshotChain;
use super::errors::SnapshotError;
use super::info::{SnapshotId, SnapshotInfo, SnapshotState};
use crate::errors::{VaultError, VaultResult};
use crate::observability::{log_event_with_fields, Event};
use crate::record::Sequence;
use crate::substrate::{StorageHandle, Table, WriteBatch};

#[derive(Debug, Default)]
pub struct RegistryState {
    snapshots: HashMap<SnapshotId, SnapshotInfo>,
    chain: SnapshotChain,
}

impl RegistryState {
    pub fn get(&self, id: SnapshotId) -> Option<&SnapshotInfo> {
        self.snapshots.get(&id)
    }

    pub fn active_count(&self) -> usize {
        self.chain.len()
    }

    pub fn chain(&self) -> &SnapshotChain {
        &self.chain
    }

    /// Lowest sequence any snapshot still protects at `now`.
    ///
    /// `None` when no snapshot protects anything.
    pub fn visibility_floor(&self, now: DateTime<Utc>, grace: Duration) -> Option<Sequence> {
        let lingering = self
            .snapshots
            .values()
            .filter(|s| s.state == SnapshotState::Deleted && s.protects(now, grace))
            .map(|s| s.frozen_sequence)
            .min();
        match (self.chain.min_frozen(), lingering) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Deleted snapshots whose grace window has closed.
    pub fn expired(&self, now: DateTime<Utc>, grace: Duration) -> Vec<SnapshotInfo> {
        self.snapshots
            .values()
            .filter(|s| s.is_expired(now, grace))
            .cloned()
            .collect()
    }

    pub fn stage_purge(&self, batch: &mut WriteBatch, info: &SnapshotInfo) {
        batch.delete(Table::Snapshots, info.row_key());
    }

    /// Forget a purged snapshot after its batch committed.
    pub fn apply_purge(&mut self, id: SnapshotId) {
        if let Some(info) = self.snapshots.remove(&id) {
            self.chain.unlink(&info);
        }
    }

    fn insert(&mut self, info: SnapshotInfo) {
        if info.is_active() {
            self.chain.push(&info);
        }
        self.snapshots.insert(info.id, info);
    }
}

#[derive(Debug)]
pub struct SnapshotRegistry {
    storage: StorageHandle,
    state: Mutex<RegistryState>,
    max_snapshots: usize,
    grace: Duration,
}

impl SnapshotRegistry {
    pub fn new(storage: StorageHandle, max_snapshots: usize, grace: Duration) -> Self {
        Self {
            storage,
            state: Mutex::new(RegistryState::default()),
            max_snapshots,
            grace,
        }
    }

    /// Reload every persisted snapshot, in creation order.
    pub fn load(&self) -> VaultResult<()> {
        let mut loaded = Vec::new();
        for (_, value) in self.storage.range(Table::Snapshots, &[], None)? {
            loaded.push(SnapshotInfo::decode(&value)?);
        }
        loaded.sort_by_key(|s| s.created_at);

        let mut state = self.lock()?;
        *state = RegistryState::default();
        for info in loaded {
            state.insert(info);
        }
        Ok(())
    }

    pub fn lock(&self) -> VaultResult<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| VaultError::LockPoisoned("snapshot registry"))
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Register a new snapshot point.
    ///
    /// `validate` runs under the registry lock, after the limit check and
    /// before anything is persisted.
    pub fn create<F>(&self, info: SnapshotInfo, validate: F) -> VaultResult<SnapshotInfo>
    where
        F: FnOnce(&SnapshotInfo) -> VaultResult<()>,
    {
        let mut state = self.lock()?;
        if state.active_count() >= self.max_snapshots {
            return Err(SnapshotError::TooManySnapshots {
                limit: self.max_snapshots,
            }
            .into());
        }
        validate(&info)?;

        let mut batch = WriteBatch::new();
        batch.put(Table::Snapshots, info.row_key(), info.encode()?);
        self.storage.commit(&batch)?;
        state.insert(info.clone());

        log_event_with_fields(
            Event::SnapshotCreated,
            &[
                ("snapshot_id", &info.id.to_string()),
                ("scope", &info.scope),
                ("frozen_sequence", &info.frozen_sequence.to_string()),
            ],
        );
        Ok(info)
    }

    /// Move an active snapshot to `Deleted`.
    pub fn delete(&self, id: SnapshotId) -> VaultResult<SnapshotInfo> {
        let mut state = self.lock()?;
        let mut info = match state.get(id) {
            Some(info) if info.is_active() => info.clone(),
            _ => return Err(SnapshotError::NotFound(id).into()),
        };
        info.state = SnapshotState::Deleted;
        info.deleted_at = Some(Utc::now());

        let mut batch = WriteBatch::new();
        batch.put(Table::Snapshots, info.row_key(), info.encode()?);
        self.storage.commit(&batch)?;

        state.chain.unlink(&info);
        state.snapshots.insert(id, info.clone());
        log_event_with_fields(
            Event::SnapshotDeleted,
            &[
                ("snapshot_id", &id.to_string()),
                ("grace_secs", &self.grace.as_secs().to_string()),
            ],
        );
        Ok(info)
    }

    pub fn get(&self, id: SnapshotId) -> VaultResult<SnapshotInfo> {
        self.lock()?
            .get(id)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(id).into())
    }

    /// The snapshot, if it exists and is active.
    pub fn require_active(&self, id: SnapshotId) -> VaultResult<SnapshotInfo> {
        let info = self.get(id)?;
        if !info.is_active() {
            return Err(SnapshotError::NotActive { id, state: info.state }.into());
        }
        Ok(info)
    }

    /// All known snapshots, oldest first.
    pub fn list(&self) -> VaultResult<Vec<SnapshotInfo>> {
        let mut all: Vec<SnapshotInfo> = self.lock()?.snapshots.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    pub fn visibility_floor(&self) -> VaultResult<Option<Sequence>> {
        Ok(self.lock()?.visibility_floor(Utc::now(), self.grace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(limit: usize, grace: Duration) -> SnapshotRegistry {
        SnapshotRegistry::new(StorageHandle::in_memory(), limit, grace)
    }

    fn create(registry: &SnapshotRegistry, seq: u64) -> VaultResult<SnapshotInfo> {
        registry.create(SnapshotInfo::new("default", Sequence::new(seq), None), |_| Ok(()))
    }

    #[test]
    fn test_floor_tracks_active_minimum() {
        let registry = registry(10, Duration::ZERO);
        assert_eq!(registry.visibility_floor().unwrap(), None);

        let _high = create(&registry, 100).unwrap();
        let low = create(&registry, 50).unwrap();
        assert_eq!(registry.visibility_floor().unwrap(), Some(Sequence::new(50)));

        registry.delete(low.id).unwrap();
        assert_eq!(registry.visibility_floor().unwrap(), Some(Sequence::new(100)));
    }

    #[test]
    fn test_deleted_snapshot_protects_during_grace() {
        let registry = registry(10, Duration::from_secs(3600));
        let snap = create(&registry, 7).unwrap();
        registry.delete(snap.id).unwrap();

        assert_eq!(registry.visibility_floor().unwrap(), Some(Sequence::new(7)));
        let state = registry.lock().unwrap();
        assert!(state.expired(Utc::now(), registry.grace()).is_empty());
    }

    #[test]
    fn test_delete_unknown_or_twice() {
        let registry = registry(10, Duration::ZERO);
        let snap = create(&registry, 1).unwrap();
        registry.delete(snap.id).unwrap();

        let err = registry.delete(snap.id).unwrap_err();
        assert_eq!(err.code(), "VAULT_SNAPSHOT_NOT_FOUND");
        assert!(registry.delete(uuid::Uuid::new_v4()).is_err());
        assert_eq!(
            registry.require_active(snap.id).unwrap_err().code(),
            "VAULT_SNAPSHOT_NOT_ACTIVE"
        );
    }

    #[test]
    fn test_limit() {
        let registry = registry(2, Duration::ZERO);
        create(&registry, 1).unwrap();
        create(&registry, 2).unwrap();
        let err = create(&registry, 3).unwrap_err();
        assert_eq!(err.code(), "VAULT_SNAPSHOT_LIMIT");
    }

    #[test]
    fn test_validation_failure_persists_nothing() {
        let registry = registry(2, Duration::ZERO);
        let result = registry.create(SnapshotInfo::new("s", Sequence::new(1), None), |_| {
            Err(VaultError::Cancelled)
        });
        assert!(result.is_err());
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_reload() {
        let storage = StorageHandle::in_memory();
        let registry = SnapshotRegistry::new(storage.clone(), 10, Duration::ZERO);
        let kept = registry
            .create(SnapshotInfo::new("s", Sequence::new(4), None), |_| Ok(()))
            .unwrap();
        let dropped = registry
            .create(SnapshotInfo::new("s", Sequence::new(2), None), |_| Ok(()))
            .unwrap();
        registry.delete(dropped.id).unwrap();

        let reloaded = SnapshotRegistry::new(storage, 10, Duration::ZERO);
        reloaded.load().unwrap();
        assert_eq!(reloaded.list().unwrap().len(), 2);
        assert_eq!(reloaded.visibility_floor().unwrap(), Some(Sequence::new(4)));
        assert!(reloaded.require_active(kept.id).is_ok());
    }
}
