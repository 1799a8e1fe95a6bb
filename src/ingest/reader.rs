//! Feed reader
//!
//! Pulls batches from a `ChangeFeed` into the engine. When the feed reports
//! that the position it needs has expired, the reader has the engine fold
//! everything it holds into an image, accepts the gap once and resumes at the
//! earliest available sequence.

use super::feed::{ChangeFeed, FeedError};
use crate::engine::Engine;
use crate::errors::VaultResult;
use crate::record::Sequence;

pub struct FeedReader<F: ChangeFeed> {
    feed: F,
    batch_size: usize,
    /// Next sequence to request; taken from the engine on first use
    position: Option<Sequence>,
}

impl<F: ChangeFeed> FeedReader<F> {
    pub fn new(feed: F, batch_size: usize) -> Self {
        Self {
            feed,
            batch_size: batch_size.max(1),
            position: None,
        }
    }

    /// Ingest one batch. Returns the number of records ingested, 0 once the
    /// feed is drained.
    pub fn pump(&mut self, engine: &Engine) -> VaultResult<usize> {
        let from = match self.position {
            Some(position) => position,
            None => engine.watermark()?.next(),
        };
        let batch = match self.feed.next_batch(from, self.batch_size) {
            Ok(batch) => batch,
            Err(FeedError::Truncated { earliest_available }) => {
                engine.recover_from_truncation(from, earliest_available)?;
                self.position = Some(earliest_available);
                self.feed.next_batch(earliest_available, self.batch_size)?
            }
            Err(err) => return Err(err.into()),
        };

        let count = batch.len();
        for record in batch {
            let next = record.sequence.next();
            engine.ingest(record)?;
            self.position = Some(next);
        }
        Ok(count)
    }

    /// Pump until the feed is drained; returns the total ingested.
    pub fn run_until_drained(&mut self, engine: &Engine) -> VaultResult<u64> {
        let mut total = 0u64;
        loop {
            let count = self.pump(engine)?;
            if count == 0 {
                return Ok(total);
            }
            total += count as u64;
        }
    }

    pub fn feed_mut(&mut self) -> &mut F {
        &mut self.feed
    }

    pub fn into_inner(self) -> F {
        self.feed
    }
}
