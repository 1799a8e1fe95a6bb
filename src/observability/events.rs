//! Lifecycle events
//!
//! Every background or state-changing step of the engine logs one of these.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Engine lifecycle
    EngineOpen,
    EngineReady,
    EngineShutdown,
    ConfigLoaded,

    // Recovery
    RecoveryBegin,
    RecoveryOrphanRemoved,
    RecoveryBufferRebuilt,
    RecoveryComplete,
    RecoveryFailed,

    // Ingest
    IngestRejected,
    FeedTruncated,

    // Layers
    FlushComplete,
    CompactionComplete,
    ImageCreated,

    // Snapshots
    SnapshotCreated,
    SnapshotDeleted,
    SnapshotPurged,

    // Reads
    DiffComplete,
    DiffCancelled,
    DiffJobSubmitted,
    DiffJobFinished,
    DiffJobCancelled,

    // Reclamation
    ReclaimComplete,
    LogRewritten,

    // Maintenance worker
    MaintenanceFailed,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::EngineOpen => "ENGINE_OPEN",
            Event::EngineReady => "ENGINE_READY",
            Event::EngineShutdown => "ENGINE_SHUTDOWN",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::RecoveryBegin => "RECOVERY_BEGIN",
            Event::RecoveryOrphanRemoved => "RECOVERY_ORPHAN_REMOVED",
            Event::RecoveryBufferRebuilt => "RECOVERY_BUFFER_REBUILT",
            Event::RecoveryComplete => "RECOVERY_COMPLETE",
            Event::RecoveryFailed => "RECOVERY_FAILED",

            Event::IngestRejected => "INGEST_REJECTED",
            Event::FeedTruncated => "FEED_TRUNCATED",

            Event::FlushComplete => "FLUSH_COMPLETE",
            Event::CompactionComplete => "COMPACTION_COMPLETE",
            Event::ImageCreated => "IMAGE_CREATED",

            Event::SnapshotCreated => "SNAPSHOT_CREATED",
            Event::SnapshotDeleted => "SNAPSHOT_DELETED",
            Event::SnapshotPurged => "SNAPSHOT_PURGED",

            Event::DiffComplete => "DIFF_COMPLETE",
            Event::DiffCancelled => "DIFF_CANCELLED",
            Event::DiffJobSubmitted => "DIFF_JOB_SUBMITTED",
            Event::DiffJobFinished => "DIFF_JOB_FINISHED",
            Event::DiffJobCancelled => "DIFF_JOB_CANCELLED",

            Event::ReclaimComplete => "RECLAIM_COMPLETE",
            Event::LogRewritten => "LOG_REWRITTEN",

            Event::MaintenanceFailed => "MAINTENANCE_FAILED",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::RecoveryFailed)
    }

    /// Events that report a rejected or degraded operation.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Event::FeedTruncated
                | Event::RecoveryOrphanRemoved
                | Event::DiffCancelled
                | Event::DiffJobCancelled
                | Event::MaintenanceFailed
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_screaming_snake_case() {
        let events = [
            Event::EngineOpen,
            Event::RecoveryBufferRebuilt,
            Event::FlushComplete,
            Event::SnapshotPurged,
            Event::ReclaimComplete,
            Event::LogRewritten,
            Event::DiffJobCancelled,
            Event::MaintenanceFailed,
        ];
        for event in events {
            let name = event.as_str();
            assert!(name.chars().all(|c| c.is_ascii_uppercase() || c == '_'), "{}", name);
        }
    }

    #[test]
    fn test_only_recovery_failure_is_fatal() {
        assert!(Event::RecoveryFailed.is_fatal());
        assert!(!Event::IngestRejected.is_fatal());
        assert!(Event::FeedTruncated.is_warning());
    }
}
