//! Per-key version history
//!
//! - `key_history`: (key, sequence) → operation + payload
//! - `value_blobs`: externalized values too large to keep inline
//! - `deleted_keys`: superseded entries awaiting reclamation

mod cache;
mod deleted;
mod index;
mod keys;

pub use cache::CacheStats;
pub use deleted::DeletedKeyInfo;
pub use index::KeySequenceIndex;
pub use keys::{history_key, history_prefix};
