//! Change record vocabulary
//!
//! This module provides:
//! - `Sequence` / `SequenceRange` - upstream write positions
//! - `ChangeRecord` - one mutation, `Operation` + `Payload`
//! - `HistoryEntry` - the persisted form of one (key, sequence) pair
//! - Binary codecs with CRC32 checksums

mod change;
pub mod checksum;
pub mod codec;
mod sequence;

pub use change::{ChangeRecord, HistoryEntry, Operation, Payload};
pub use sequence::{Sequence, SequenceRange};
