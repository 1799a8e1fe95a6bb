//! Upstream change feeds
//!
//! A feed hands out records in sequence order starting at a requested
//! position. A feed with limited retention reports `Truncated` when the
//! requested position is no longer available.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::Severity;
use crate::record::{ChangeRecord, Sequence};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed truncated: earliest available sequence is {earliest_available}")]
    Truncated { earliest_available: Sequence },

    #[error("cannot read feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad feed line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

impl FeedError {
    pub fn code(&self) -> &'static str {
        match self {
            FeedError::Truncated { .. } => "VAULT_FEED_TRUNCATED",
            FeedError::Io { .. } => "VAULT_FEED_IO",
            FeedError::Parse { .. } => "VAULT_FEED_PARSE",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Error
    }
}

/// Source of change records.
pub trait ChangeFeed: Send {
    /// Up to `max` records with sequence >= `from`, in sequence order.
    ///
    /// An empty batch means the feed is drained for now.
    fn next_batch(&mut self, from: Sequence, max: usize) -> Result<Vec<ChangeRecord>, FeedError>;
}

/// Feed over an in-memory record list with optional retention.
#[derive(Debug, Default)]
pub struct MemoryFeed {
    records: Vec<ChangeRecord>,
    retained_from: Option<Sequence>,
}

impl MemoryFeed {
    pub fn new(mut records: Vec<ChangeRecord>) -> Self {
        records.sort_by_key(|r| r.sequence);
        Self {
            records,
            retained_from: None,
        }
    }

    pub fn push(&mut self, record: ChangeRecord) {
        let pos = self.records.partition_point(|r| r.sequence <= record.sequence);
        self.records.insert(pos, record);
    }

    /// Expire every record below `sequence`.
    pub fn truncate_before(&mut self, sequence: Sequence) {
        self.records.retain(|r| r.sequence >= sequence);
        self.retained_from = Some(sequence);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ChangeFeed for MemoryFeed {
    fn next_batch(&mut self, from: Sequence, max: usize) -> Result<Vec<ChangeRecord>, FeedError> {
        if let Some(retained) = self.retained_from {
            if from < retained {
                return Err(FeedError::Truncated {
                    earliest_available: retained,
                });
            }
        }
        let start = self.records.partition_point(|r| r.sequence < from);
        Ok(self.records[start..].iter().take(max).cloned().collect())
    }
}

/// Operation of one JSON-lines feed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedOp {
    Put,
    Delete,
}

/// One line of a JSON-lines feed:
/// `{"key":"a","sequence":1,"op":"put","value":"x"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedLine {
    pub key: String,
    pub sequence: u64,
    pub op: FeedOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl FeedLine {
    pub fn into_record(self) -> Result<ChangeRecord, String> {
        match (self.op, self.value) {
            (FeedOp::Put, Some(value)) => Ok(ChangeRecord::put(self.key, self.sequence, value)),
            (FeedOp::Put, None) => Err("put without value".to_string()),
            (FeedOp::Delete, _) => Ok(ChangeRecord::delete(self.key, self.sequence)),
        }
    }
}

/// Parse a JSON-lines document; blank lines are skipped.
pub fn parse_jsonl(content: &str) -> Result<Vec<ChangeRecord>, FeedError> {
    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: FeedLine = serde_json::from_str(line).map_err(|e| FeedError::Parse {
            line: idx + 1,
            reason: e.to_string(),
        })?;
        let record = parsed.into_record().map_err(|reason| FeedError::Parse {
            line: idx + 1,
            reason,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Feed read from a JSON-lines file.
///
/// Records are kept in file order. Leading lines below the requested
/// position are skipped, so a file can be re-read after a restart; an
/// out-of-order line further on surfaces as an ingest error.
#[derive(Debug)]
pub struct JsonlFeed {
    records: Vec<ChangeRecord>,
    position: usize,
}

impl JsonlFeed {
    pub fn open(path: &Path) -> Result<Self, FeedError> {
        let content = fs::read_to_string(path).map_err(|source| FeedError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            records: parse_jsonl(&content)?,
            position: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ChangeFeed for JsonlFeed {
    fn next_batch(&mut self, from: Sequence, max: usize) -> Result<Vec<ChangeRecord>, FeedError> {
        while self.position < self.records.len() && self.records[self.position].sequence < from {
            self.position += 1;
        }
        let end = (self.position + max).min(self.records.len());
        let batch = self.records[self.position..end].to_vec();
        self.position = end;
        Ok(batch)
    }
}
