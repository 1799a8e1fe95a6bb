//! Bloom filter with double hashing
//!
//! - Any checked bit 0 → key is definitely absent
//! - All checked bits 1 → key is probably present
//!
//! Sizing:
//!   bits_per_key = -1.44 * log2(false_positive_rate)
//!   num_hashes = bits_per_key * ln(2)
//!
//! The k bit positions come from one xxh3-128 hash split into two 64-bit
//! halves: h_i = h1 + i * h2 (mod m).

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
    num_bits: u64,
}

impl BloomFilter {
    /// Filter sized for `expected_items` at the given false positive rate.
    ///
    /// Out-of-range rates are clamped; zero items still allocates the
    /// 64-bit minimum.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let fpr = false_positive_rate.clamp(1e-9, 0.5);
        let bits_per_key = -1.44 * fpr.log2();

        let num_bits = ((expected_items.max(1) as f64) * bits_per_key).ceil() as u64;
        let num_bits = num_bits.max(64);

        let num_hashes = ((bits_per_key * 2.0f64.ln()).ceil() as u32).max(1);

        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0u64; words],
            num_hashes,
            num_bits,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_key(key);
        for i in 0..self.num_hashes {
            let pos = self.position(h1, h2, i);
            self.bits[(pos / 64) as usize] |= 1u64 << (pos % 64);
        }
    }

    /// false → definitely not here. true → probably here.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_key(key);
        (0..self.num_hashes).all(|i| {
            let pos = self.position(h1, h2, i);
            self.bits
                .get((pos / 64) as usize)
                .map(|word| word & (1u64 << (pos % 64)) != 0)
                .unwrap_or(true)
        })
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[inline]
    fn position(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }
}

fn hash_key(key: &[u8]) -> (u64, u64) {
    let hash = xxh3_128(key);
    let h1 = hash as u64;
    // An even h2 would cycle through half the positions at best
    let h2 = ((hash >> 64) as u64) | 1;
    (h1, h2)
}
