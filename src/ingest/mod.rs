//! Change feed ingestion
//!
//! - `Ingestor`: ordering checks, index commit, in-memory write buffer
//! - `ChangeFeed`: upstream source (`MemoryFeed`, `JsonlFeed`)
//! - `FeedReader`: pulls a feed into the engine, recovering from truncation
//!
//! A record is acknowledged only after its key-sequence entry is durable.
//! Sequences come from upstream and must strictly increase.

mod buffer;
mod feed;
mod ingestor;
mod reader;

pub use buffer::WriteBuffer;
pub use feed::{parse_jsonl, ChangeFeed, FeedError, FeedLine, FeedOp, JsonlFeed, MemoryFeed};
pub use ingestor::Ingestor;
pub use reader::FeedReader;
