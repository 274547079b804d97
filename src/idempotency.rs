//! Idempotency filters
//!
//! A filter answers "was this transaction ID already applied?" for one
//! partition. Two variants with distinct semantics:
//!
//! - [`LruFilter`]: exact set with access-ordered eviction. `contains` is
//!   authoritative for every key added since the last eviction.
//! - [`BloomFilter`]: probabilistic set. `contains` may report a false
//!   positive (a genuinely new command gets rejected as a duplicate) at the
//!   configured rate, but never a false negative.
//!
//! Filters are serialized into snapshots as a whole, so a recovered
//! partition rejects duplicates exactly as the crashed one would have.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::config::{FilterConfig, IdempotencyKind};

/// Fixed SipHash keys for Bloom bit selection; changing them invalidates
/// every persisted filter.
const BLOOM_HASH_KEY_A: (u64, u64) = (0x626c_6f6f_6d2d_6861, 0x7368_2d6b_6579_2d41);
const BLOOM_HASH_KEY_B: (u64, u64) = (0x626c_6f6f_6d2d_6861, 0x7368_2d6b_6579_2d42);

/// Snapshot-serializable idempotency filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IdempotencyFilter {
    /// Exact, access-ordered, capacity-bounded
    Lru(LruFilter),
    /// Probabilistic, fixed memory
    Bloom(BloomFilter),
}

impl IdempotencyFilter {
    /// Build the filter selected by configuration.
    pub fn from_config(kind: IdempotencyKind, filter: &FilterConfig) -> Self {
        match kind {
            IdempotencyKind::Lru => IdempotencyFilter::Lru(LruFilter::new(filter.lru_capacity)),
            IdempotencyKind::Bloom => IdempotencyFilter::Bloom(BloomFilter::new(
                filter.bloom_expected_items,
                filter.bloom_false_positive_rate,
            )),
        }
    }

    /// True if `key` was (probably) already applied.
    ///
    /// Takes `&mut self` because an LRU hit refreshes the key's access
    /// position.
    pub fn contains(&mut self, key: &str) -> bool {
        match self {
            IdempotencyFilter::Lru(f) => f.contains(key),
            IdempotencyFilter::Bloom(f) => f.contains(key),
        }
    }

    /// Record `key` as applied.
    pub fn add(&mut self, key: &str) {
        match self {
            IdempotencyFilter::Lru(f) => f.add(key),
            IdempotencyFilter::Bloom(f) => f.add(key),
        }
    }

    /// Reset the filter.
    pub fn clear(&mut self) {
        match self {
            IdempotencyFilter::Lru(f) => f.clear(),
            IdempotencyFilter::Bloom(f) => f.clear(),
        }
    }

    /// Variant name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            IdempotencyFilter::Lru(_) => "lru",
            IdempotencyFilter::Bloom(_) => "bloom",
        }
    }
}

/// Exact LRU set.
///
/// Keeps at most `capacity` keys; inserting beyond capacity evicts the
/// least-recently-accessed key. Both `contains` hits and `add` refresh a
/// key's position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LruFilter {
    capacity: usize,
    tick: u64,
    by_key: HashMap<String, u64>,
    by_tick: BTreeMap<u64, String>,
}

impl LruFilter {
    /// Filter holding up to `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            by_key: HashMap::new(),
            by_tick: BTreeMap::new(),
        }
    }

    /// Exact membership test; refreshes access order on hit.
    pub fn contains(&mut self, key: &str) -> bool {
        if self.by_key.contains_key(key) {
            self.touch(key);
            true
        } else {
            false
        }
    }

    /// Insert `key`, evicting the least recently used entry at capacity.
    pub fn add(&mut self, key: &str) {
        if self.by_key.contains_key(key) {
            self.touch(key);
            return;
        }
        if self.by_key.len() >= self.capacity {
            if let Some((&oldest_tick, _)) = self.by_tick.iter().next() {
                if let Some(evicted) = self.by_tick.remove(&oldest_tick) {
                    self.by_key.remove(&evicted);
                }
            }
        }
        self.tick += 1;
        self.by_key.insert(key.to_string(), self.tick);
        self.by_tick.insert(self.tick, key.to_string());
    }

    /// Remove every key.
    pub fn clear(&mut self) {
        self.by_key.clear();
        self.by_tick.clear();
        self.tick = 0;
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// True when no key is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn touch(&mut self, key: &str) {
        if let Some(old_tick) = self.by_key.get(key).copied() {
            self.by_tick.remove(&old_tick);
            self.tick += 1;
            self.by_key.insert(key.to_string(), self.tick);
            self.by_tick.insert(self.tick, key.to_string());
        }
    }
}

/// Probabilistic Bloom set.
///
/// Sized from the expected insertion count and target false positive rate.
/// Deletion is unsupported; `clear` resets the whole bit array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    inserted: u64,
}

impl BloomFilter {
    /// Filter sized for `expected_items` insertions at `fpp` false positive
    /// probability.
    pub fn new(expected_items: usize, fpp: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = fpp.clamp(1e-10, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;
        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0u64; words],
            num_bits,
            num_hashes,
            inserted: 0,
        }
    }

    /// Membership test: false means definitely absent, true means probably
    /// present.
    pub fn contains(&self, key: &str) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            if self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Set the key's bits.
    pub fn add(&mut self, key: &str) {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.inserted += 1;
    }

    /// Zero the bit array.
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
        self.inserted = 0;
    }

    /// Approximate number of insertions since the last clear.
    #[must_use]
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    // Double hashing: bit_i = h1 + i * h2 (mod m)
    #[inline]
    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }

    #[inline]
    fn hash_pair(key: &str) -> (u64, u64) {
        let mut a = SipHasher13::new_with_keys(BLOOM_HASH_KEY_A.0, BLOOM_HASH_KEY_A.1);
        a.write(key.as_bytes());
        let mut b = SipHasher13::new_with_keys(BLOOM_HASH_KEY_B.0, BLOOM_HASH_KEY_B.1);
        b.write(key.as_bytes());
        // An even h2 would cycle over a subset of bits; force odd
        (a.finish(), b.finish() | 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_add_then_contains() {
        let mut f = LruFilter::new(16);
        assert!(!f.contains("tx-1"));
        f.add("tx-1");
        assert!(f.contains("tx-1"));
        assert!(!f.contains("tx-2"));
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let mut f = LruFilter::new(2);
        f.add("a");
        f.add("b");
        // Touch "a" so "b" becomes the eviction candidate
        assert!(f.contains("a"));
        f.add("c");
        assert!(f.contains("a"));
        assert!(!f.contains("b"));
        assert!(f.contains("c"));
        assert_eq!(f.len(), 2);
    }

    #[test]
    fn test_lru_clear() {
        let mut f = LruFilter::new(4);
        f.add("a");
        f.add("b");
        f.clear();
        assert!(f.is_empty());
        assert!(!f.contains("a"));
    }

    #[test]
    fn test_bloom_no_false_negatives() {
        let mut f = BloomFilter::new(10_000, 0.001);
        for i in 0..5_000 {
            f.add(&format!("tx-{}", i));
        }
        for i in 0..5_000 {
            assert!(f.contains(&format!("tx-{}", i)));
        }
    }

    #[test]
    fn test_bloom_false_positive_rate_bounded() {
        let mut f = BloomFilter::new(10_000, 0.01);
        for i in 0..10_000 {
            f.add(&format!("present-{}", i));
        }
        let mut false_positives = 0u32;
        let probes = 20_000;
        for i in 0..probes {
            if f.contains(&format!("absent-{}", i)) {
                false_positives += 1;
            }
        }
        let rate = f64::from(false_positives) / f64::from(probes);
        assert!(rate < 0.03, "false positive rate too high: {}", rate);
    }

    #[test]
    fn test_bloom_clear() {
        let mut f = BloomFilter::new(100, 0.01);
        f.add("tx-1");
        f.clear();
        assert!(!f.contains("tx-1"));
        assert_eq!(f.inserted(), 0);
    }

    #[test]
    fn test_filter_serde_roundtrip() {
        let mut filter = IdempotencyFilter::Lru(LruFilter::new(8));
        filter.add("tx-1");
        filter.add("tx-2");
        let bytes = bincode::serialize(&filter).unwrap();
        let mut back: IdempotencyFilter = bincode::deserialize(&bytes).unwrap();
        assert!(back.contains("tx-1"));
        assert!(back.contains("tx-2"));
        assert!(!back.contains("tx-3"));
        assert_eq!(back.name(), "lru");
    }

    #[test]
    fn test_bloom_serde_roundtrip() {
        let mut filter = IdempotencyFilter::Bloom(BloomFilter::new(1_000, 0.001));
        filter.add("tx-a");
        let bytes = bincode::serialize(&filter).unwrap();
        let mut back: IdempotencyFilter = bincode::deserialize(&bytes).unwrap();
        assert!(back.contains("tx-a"));
        assert_eq!(back.name(), "bloom");
    }

    #[test]
    fn test_from_config() {
        let cfg = FilterConfig::default();
        let f = IdempotencyFilter::from_config(IdempotencyKind::Lru, &cfg);
        assert_eq!(f.name(), "lru");
        let f = IdempotencyFilter::from_config(IdempotencyKind::Bloom, &cfg);
        assert_eq!(f.name(), "bloom");
    }
}
