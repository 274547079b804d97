//! Convenience state and boundary helpers
//!
//! The engine core works on opaque state and integer amounts. This module
//! carries the two pieces most hosts want anyway: a simple keyed counter
//! state for wallet/balance workloads, and the conversions between external
//! decimal amounts and the engine's minimum-unit integers.

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Simple map-of-counters state for balance and inventory workloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedLongState {
    values: HashMap<String, i64>,
}

impl KeyedLongState {
    /// Current value for `key`, 0 when absent.
    #[must_use]
    pub fn get(&self, key: &str) -> i64 {
        self.values.get(key).copied().unwrap_or(0)
    }

    /// Add `delta` (may be negative) to `key`.
    pub fn add(&mut self, key: &str, delta: i64) {
        *self.values.entry(key.to_string()).or_insert(0) += delta;
    }

    /// Overwrite `key` with `value`.
    pub fn set(&mut self, key: &str, value: i64) {
        self.values.insert(key.to_string(), value);
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no key is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Minor-unit money conversion.
///
/// The engine core never touches arbitrary-precision decimals: amounts are
/// `i64` in the system's minimum unit (one ten-thousandth), and conversion
/// to and from `Decimal` lives here at the boundary. Extra precision is
/// truncated, never rounded.
pub mod money {
    use super::*;

    /// Decimal places carried by the minor unit.
    pub const SCALE: u32 = 4;

    const MULTIPLIER: i64 = 10_000;

    /// External decimal amount to minor units; `100.00` becomes
    /// `1_000_000`, `10.55559` truncates to `105_555`.
    #[must_use]
    pub fn to_minor(amount: Decimal) -> i64 {
        (amount * Decimal::from(MULTIPLIER))
            .trunc()
            .to_i64()
            .unwrap_or(0)
    }

    /// Minor units to an external decimal with [`SCALE`] places;
    /// `1_000_000` becomes `100.0000`.
    #[must_use]
    pub fn to_decimal(minor: i64) -> Decimal {
        Decimal::new(minor, SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_get_default_zero() {
        let state = KeyedLongState::default();
        assert_eq!(state.get("u1"), 0);
        assert!(state.is_empty());
    }

    #[test]
    fn test_state_add_accumulates() {
        let mut state = KeyedLongState::default();
        state.add("u1", 100);
        state.add("u1", -30);
        state.add("u2", 5);
        assert_eq!(state.get("u1"), 70);
        assert_eq!(state.get("u2"), 5);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = KeyedLongState::default();
        state.add("u1", 42);
        let bytes = bincode::serialize(&state).unwrap();
        let back: KeyedLongState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_money_to_minor() {
        assert_eq!(money::to_minor(Decimal::new(10000, 2)), 1_000_000); // 100.00
        assert_eq!(money::to_minor(Decimal::new(1, 4)), 1); // 0.0001
        // Truncation, not rounding: 10.55559 -> 105555
        assert_eq!(money::to_minor(Decimal::new(1055559, 5)), 105_555);
    }

    #[test]
    fn test_money_to_decimal() {
        assert_eq!(money::to_decimal(1_000_000), Decimal::new(1_000_000, 4));
        assert_eq!(money::to_decimal(1).to_string(), "0.0001");
    }

    #[test]
    fn test_money_roundtrip() {
        for minor in [0i64, 1, -1, 105_555, 1_000_000, -42_000] {
            assert_eq!(money::to_minor(money::to_decimal(minor)), minor);
        }
    }
}
