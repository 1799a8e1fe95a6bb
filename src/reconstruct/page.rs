//! Paged diffs between two snapshot points

use serde::Serialize;

use super::diff::{diff, DiffEntry};
use super::jobs::DiffJobState;
use super::CancelToken;
use crate::engine::Core;
use crate::errors::{VaultError, VaultResult};
use crate::record::Sequence;
use crate::snapshot::{SnapshotId, SnapshotInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffPage {
    pub from_snapshot: SnapshotId,
    pub to_snapshot: SnapshotId,
    pub from: Sequence,
    pub to: Sequence,
    pub entries: Vec<DiffEntry>,
    /// Pass back to fetch the following page; `None` on the last page
    pub next_page_token: Option<String>,
    /// Entries across all pages
    pub total: usize,
}

fn parse_token(token: Option<&str>) -> VaultResult<usize> {
    match token {
        None => Ok(0),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| VaultError::InvalidPageToken(raw.to_string())),
    }
}

/// Both snapshots, active and in order.
pub(crate) fn resolve_pair(
    core: &Core,
    from_id: SnapshotId,
    to_id: SnapshotId,
) -> VaultResult<(SnapshotInfo, SnapshotInfo)> {
    let from = core.registry.require_active(from_id)?;
    let to = core.registry.require_active(to_id)?;
    if from.frozen_sequence > to.frozen_sequence {
        return Err(VaultError::invalid_range(
            from.frozen_sequence,
            to.frozen_sequence,
            "source snapshot is newer than target snapshot",
        ));
    }
    Ok((from, to))
}

/// Every entry of the diff between two resolved snapshots.
pub(crate) fn diff_entries(
    core: &Core,
    from: &SnapshotInfo,
    to: &SnapshotInfo,
    cancel: &CancelToken,
) -> VaultResult<Vec<DiffEntry>> {
    if from.id == to.id {
        return Ok(Vec::new());
    }
    let prefix = to.key_prefix.as_ref().or(from.key_prefix.as_ref());
    let report = diff(
        core,
        from.frozen_sequence,
        to.frozen_sequence,
        prefix.map(|p| p.as_slice()),
        cancel,
    )?;

    // Either side may have been deleted while the diff ran
    core.registry.require_active(from.id)?;
    core.registry.require_active(to.id)?;
    Ok(report.entries)
}

pub(crate) fn diff_snapshots(
    core: &Core,
    from_id: SnapshotId,
    to_id: SnapshotId,
    page_token: Option<&str>,
    page_size: usize,
    cancel: &CancelToken,
) -> VaultResult<DiffPage> {
    let start = parse_token(page_token)?;
    let page_size = page_size.clamp(1, core.config.max_diff_page_size.max(1));
    let (from, to) = resolve_pair(core, from_id, to_id)?;

    let stored = core
        .diff_jobs
        .get(from_id, to_id)?
        .filter(|job| job.state == DiffJobState::Done);
    let (entries, total) = match stored {
        Some(job) => {
            let total = job.total_entries.unwrap_or(0);
            check_start(start, total)?;
            (core.diff_jobs.report_page(&job, start, page_size)?, total)
        }
        None => {
            let all = diff_entries(core, &from, &to, cancel)?;
            let total = all.len();
            check_start(start, total)?;
            let end = (start + page_size).min(total);
            (all[start..end].to_vec(), total)
        }
    };

    let end = start + entries.len();
    Ok(DiffPage {
        from_snapshot: from_id,
        to_snapshot: to_id,
        from: from.frozen_sequence,
        to: to.frozen_sequence,
        entries,
        next_page_token: (end < total).then(|| end.to_string()),
        total,
    })
}

fn check_start(start: usize, total: usize) -> VaultResult<()> {
    if start > total {
        return Err(VaultError::InvalidPageToken(start.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_past_end_is_rejected() {
        assert!(check_start(3, 3).is_ok());
        assert!(matches!(check_start(4, 3), Err(VaultError::InvalidPageToken(_))));
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token(None).unwrap(), 0);
        assert_eq!(parse_token(Some("25")).unwrap(), 25);
        assert!(matches!(parse_token(Some("-1")), Err(VaultError::InvalidPageToken(_))));
        assert!(matches!(parse_token(Some("abc")), Err(VaultError::InvalidPageToken(_))));
    }
}
