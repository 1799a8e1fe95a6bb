//! Sequence - Totally ordered write position
//!
//! Every mutation in the upstream store carries a sequence number. The engine
//! never invents one: it only observes what the change feed hands it.
//!
//! - Totally orders all mutations
//! - Usable as a "point in time" for reads and diffs
//! - No two mutations share the same sequence

use serde::{Deserialize, Serialize};
use std::fmt;

/// A totally ordered, opaque write position.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    /// The position before any mutation was observed.
    pub const ZERO: Sequence = Sequence(0);

    /// Never ingested: a layer holding it would have no exclusive end.
    pub const MAX: Sequence = Sequence(u64::MAX);

    /// Creates a new Sequence with the given value.
    ///
    /// No Default implementation exists to prevent accidental construction.
    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying value.
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next position.
    #[inline]
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the previous position, saturating at zero.
    #[inline]
    pub fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Big-endian encoding, so byte order matches numeric order in tables.
    #[inline]
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decodes a big-endian sequence.
    #[inline]
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open sequence range `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SequenceRange {
    pub start: Sequence,
    pub end: Sequence,
}

impl SequenceRange {
    /// Creates a range. Callers guarantee `end > start`.
    pub fn new(start: Sequence, end: Sequence) -> Self {
        debug_assert!(end > start, "empty sequence range");
        Self { start, end }
    }

    /// Returns true if `seq` lies inside the range.
    #[inline]
    pub fn contains(&self, seq: Sequence) -> bool {
        seq >= self.start && seq < self.end
    }

    /// Last sequence held by the range.
    #[inline]
    pub fn last(&self) -> Sequence {
        self.end.prev()
    }

    /// True if any sequence in `(after, upto]` falls inside the range.
    #[inline]
    pub fn intersects_open_closed(&self, after: Sequence, upto: Sequence) -> bool {
        self.start <= upto && self.last() > after
    }

    /// True if every sequence of the range is `<= seq`.
    #[inline]
    pub fn ends_at_or_before(&self, seq: Sequence) -> bool {
        self.last() <= seq
    }
}

impl fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_ordering() {
        assert!(Sequence::new(1) < Sequence::new(2));
        assert_eq!(Sequence::new(7).next(), Sequence::new(8));
        assert_eq!(Sequence::ZERO.prev(), Sequence::ZERO);
    }

    #[test]
    fn test_be_bytes_preserve_order() {
        let a = Sequence::new(255).to_be_bytes();
        let b = Sequence::new(256).to_be_bytes();
        assert!(a < b);
        assert_eq!(Sequence::from_be_bytes(b), Sequence::new(256));
    }

    #[test]
    fn test_range_intersection() {
        // [3, 5) holds 3 and 4
        let range = SequenceRange::new(Sequence::new(3), Sequence::new(5));
        assert!(range.intersects_open_closed(Sequence::new(2), Sequence::new(6)));
        assert!(range.intersects_open_closed(Sequence::new(3), Sequence::new(4)));
        assert!(!range.intersects_open_closed(Sequence::new(4), Sequence::new(9)));
        assert!(!range.intersects_open_closed(Sequence::new(0), Sequence::new(2)));
    }

    #[test]
    fn test_range_ends_before() {
        let range = SequenceRange::new(Sequence::new(1), Sequence::new(3));
        assert!(range.ends_at_or_before(Sequence::new(2)));
        assert!(!range.ends_at_or_before(Sequence::new(1)));
    }
}
