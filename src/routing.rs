//! Routing strategies
//!
//! A strategy maps `(routing_key, partition_count)` to a partition index.
//! Both variants are stateless and deterministic: same inputs, same index,
//! on every node. The hash is seeded with fixed keys so the mapping is
//! consistent across processes and machines.

use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::config::RoutingKind;

/// Fixed SipHash keys; must never change or every key remaps.
const ROUTING_HASH_KEY: (u64, u64) = (0x6c65_6467_6572_2d72, 0x6f75_7465_2d6b_6579);

#[inline]
fn hash_key(key: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(ROUTING_HASH_KEY.0, ROUTING_HASH_KEY.1);
    hasher.write(key.as_bytes());
    hasher.finish()
}

#[inline]
fn hash_key_slot(key: &str, slot: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(ROUTING_HASH_KEY.0, ROUTING_HASH_KEY.1);
    hasher.write(key.as_bytes());
    hasher.write_u64(slot);
    hasher.finish()
}

/// Partition routing strategy.
///
/// `Modulo` is the fastest mapping but remaps almost every key when the
/// partition count changes. `Rendezvous` (highest random weight) costs one
/// hash per candidate partition and remaps only ~`1/(n+1)` of keys when
/// growing from `n` to `n+1` partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingStrategy {
    /// `(hash32(key) & i32::MAX) % n`
    Modulo,
    /// Highest-random-weight over `(key, i)` hashes, ties to the lowest `i`
    Rendezvous,
}

impl RoutingStrategy {
    /// Partition index for `key`, in `[0, partition_count)`.
    ///
    /// `partition_count` must be non-zero.
    #[must_use]
    pub fn partition_of(&self, key: &str, partition_count: usize) -> usize {
        debug_assert!(partition_count > 0);
        match self {
            RoutingStrategy::Modulo => {
                let h32 = (hash_key(key) as u32) & (i32::MAX as u32);
                (h32 as usize) % partition_count
            }
            RoutingStrategy::Rendezvous => {
                let mut max_hash = 0u64;
                let mut selected = 0usize;
                for i in 0..partition_count {
                    let h = hash_key_slot(key, i as u64);
                    // Strict comparison keeps the lowest index on ties
                    if i == 0 || h > max_hash {
                        max_hash = h;
                        selected = i;
                    }
                }
                selected
            }
        }
    }

    /// Strategy name for logs and config echo.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RoutingStrategy::Modulo => "modulo",
            RoutingStrategy::Rendezvous => "rendezvous",
        }
    }
}

impl From<RoutingKind> for RoutingStrategy {
    fn from(kind: RoutingKind) -> Self {
        match kind {
            RoutingKind::Modulo => RoutingStrategy::Modulo,
            RoutingKind::Rendezvous => RoutingStrategy::Rendezvous,
        }
    }
}
