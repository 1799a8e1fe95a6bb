//! Membership filters for layers
//!
//! Every delta and image layer carries a `MembershipFilter` built from its
//! keys. Two lookups are supported:
//! - exact key membership (point reads skip layers that cannot hold a key)
//! - fixed-length prefix membership (diffs skip layers that cannot hold any
//!   key under the caller's prefix)
//!
//! Both answer "maybe" or "definitely not"; a "maybe" must always be checked
//! against real content.

mod bloom;

pub use bloom::BloomFilter;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipFilter {
    keys: BloomFilter,
    prefixes: BloomFilter,
    prefix_len: usize,
}

impl MembershipFilter {
    /// Build a filter over `keys`.
    pub fn build<'a, I>(keys: I, false_positive_rate: f64, prefix_len: usize) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
        I::IntoIter: Clone,
    {
        let iter = keys.into_iter();
        let expected = iter.clone().count();
        let mut filter = Self {
            keys: BloomFilter::new(expected, false_positive_rate),
            prefixes: BloomFilter::new(expected, false_positive_rate),
            prefix_len,
        };
        for key in iter {
            filter.keys.insert(key);
            // keys shorter than prefix_len are indexed whole
            filter.prefixes.insert(&key[..key.len().min(prefix_len)]);
        }
        filter
    }

    /// Might `key` be in the layer?
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.keys.may_contain(key)
    }

    /// Might any key starting with `prefix` be in the layer?
    ///
    /// Prefixes shorter than the indexed length cannot be checked and always
    /// answer "maybe".
    pub fn may_contain_prefix(&self, prefix: &[u8]) -> bool {
        if prefix.len() < self.prefix_len {
            return true;
        }
        self.prefixes.may_contain(&prefix[..self.prefix_len])
    }
}

/// True if some key starting with `prefix` may lie within `[min_key, max_key]`.
pub fn prefix_overlaps(prefix: &[u8], min_key: &[u8], max_key: &[u8]) -> bool {
    if prefix.is_empty() {
        return true;
    }
    // Keys under `prefix` form the interval [prefix, successor(prefix)).
    let reaches_max = prefix <= max_key;
    let below_successor = min_key < prefix || min_key.starts_with(prefix);
    reaches_max && below_successor
}
