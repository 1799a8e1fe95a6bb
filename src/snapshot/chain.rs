//! Snapshot chains
//!
//! Active snapshots are linked in creation order within their scope, and all
//! of them are indexed by frozen sequence so the global minimum is a single
//! ordered-set lookup.

use std::collections::{BTreeMap, BTreeSet};

use super::info::{SnapshotId, SnapshotInfo};
use crate::record::Sequence;

#[derive(Debug, Default)]
pub struct SnapshotChain {
    by_scope: BTreeMap<String, Vec<SnapshotId>>,
    by_frozen: BTreeSet<(Sequence, SnapshotId)>,
}

impl SnapshotChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link an active snapshot at the end of its scope.
    pub fn push(&mut self, info: &SnapshotInfo) {
        self.by_scope.entry(info.scope.clone()).or_default().push(info.id);
        self.by_frozen.insert((info.frozen_sequence, info.id));
    }

    /// Unlink a snapshot that stopped being active.
    pub fn unlink(&mut self, info: &SnapshotInfo) {
        if let Some(ids) = self.by_scope.get_mut(&info.scope) {
            ids.retain(|id| *id != info.id);
            if ids.is_empty() {
                self.by_scope.remove(&info.scope);
            }
        }
        self.by_frozen.remove(&(info.frozen_sequence, info.id));
    }

    /// Lowest frozen sequence of any active snapshot.
    pub fn min_frozen(&self) -> Option<Sequence> {
        self.by_frozen.iter().next().map(|(seq, _)| *seq)
    }

    /// Active snapshots of `scope`, oldest first.
    pub fn scope(&self, scope: &str) -> &[SnapshotId] {
        self.by_scope.get(scope).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// The active snapshot created just before `id` in its scope.
    pub fn previous(&self, scope: &str, id: SnapshotId) -> Option<SnapshotId> {
        let ids = self.scope(scope);
        let pos = ids.iter().position(|s| *s == id)?;
        pos.checked_sub(1).map(|p| ids[p])
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.by_scope.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_frozen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_frozen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_and_order() {
        let mut chain = SnapshotChain::new();
        let a = SnapshotInfo::new("s", Sequence::new(100), None);
        let b = SnapshotInfo::new("s", Sequence::new(50), None);
        let c = SnapshotInfo::new("t", Sequence::new(70), None);
        chain.push(&a);
        chain.push(&b);
        chain.push(&c);

        assert_eq!(chain.min_frozen(), Some(Sequence::new(50)));
        assert_eq!(chain.scope("s"), &[a.id, b.id]);
        assert_eq!(chain.previous("s", b.id), Some(a.id));
        assert_eq!(chain.previous("s", a.id), None);

        chain.unlink(&b);
        assert_eq!(chain.min_frozen(), Some(Sequence::new(70)));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.scopes().count(), 2);
    }
}
