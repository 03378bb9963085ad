use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::models::Position;

/// Cached copy of an exchange position, with its staleness visible
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedPosition {
    pub position: Position,
    pub fetched_at: DateTime<Utc>,
    /// New submissions refused until reconciliations agree again
    pub suspended: bool,
}

/// Result of comparing a fresh exchange position with the cache
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Nothing cached yet
    First,
    Agreed,
    /// Agreement after a desync; the symbol is released
    Resumed,
    Diverged { expected: f64, observed: f64 },
}

/// Read-through projection of exchange positions
///
/// Only `observe` writes positions. Confirmed fills are kept as pending
/// signed deltas until the next observation accounts for them.
#[derive(Debug, Default)]
pub struct PositionBook {
    entries: HashMap<String, CachedPosition>,
    pending: HashMap<String, f64>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<&CachedPosition> {
        self.entries.get(symbol)
    }

    pub fn all(&self) -> Vec<CachedPosition> {
        let mut all: Vec<CachedPosition> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| a.position.symbol.cmp(&b.position.symbol));
        all
    }

    pub fn is_suspended(&self, symbol: &str) -> bool {
        self.entries.get(symbol).is_some_and(|e| e.suspended)
    }

    /// Remember a confirmed fill (positive buys, negative sells)
    pub fn record_fill(&mut self, symbol: &str, signed_quantity: f64) {
        *self.pending.entry(symbol.to_string()).or_insert(0.0) += signed_quantity;
    }

    /// Compare with the exchange, then take the exchange value
    pub fn observe(&mut self, observed: Position, tolerance: f64) -> Observation {
        let pending = self.pending.remove(&observed.symbol).unwrap_or(0.0);
        let symbol = observed.symbol.clone();
        let fetched_at = observed.updated_at;

        let Some(entry) = self.entries.get_mut(&symbol) else {
            self.entries.insert(
                symbol,
                CachedPosition {
                    position: observed,
                    fetched_at,
                    suspended: false,
                },
            );
            return Observation::First;
        };

        let expected = entry.position.signed_size() + pending;
        let actual = observed.signed_size();

        let outcome = if (expected - actual).abs() > tolerance {
            entry.suspended = true;
            Observation::Diverged {
                expected,
                observed: actual,
            }
        } else if entry.suspended {
            entry.suspended = false;
            Observation::Resumed
        } else {
            Observation::Agreed
        };

        entry.position = observed;
        entry.fetched_at = fetched_at;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSide;

    fn long(size: f64) -> Position {
        let mut position = Position::flat("BTCUSDT", Utc::now());
        if size > 0.0 {
            position.side = PositionSide::Long;
            position.size = size;
            position.entry_price = 100.0;
        }
        position
    }

    #[test]
    fn test_fill_accounted_for_by_next_observation() {
        let mut book = PositionBook::new();
        assert_eq!(book.observe(long(0.0), 1e-9), Observation::First);

        book.record_fill("BTCUSDT", 2.0);
        assert_eq!(book.observe(long(2.0), 1e-9), Observation::Agreed);
        assert_eq!(book.get("BTCUSDT").unwrap().position.size, 2.0);
    }

    #[test]
    fn test_divergence_suspends_until_two_observations_agree() {
        let mut book = PositionBook::new();
        book.observe(long(1.0), 1e-9);

        // position changed outside the engine
        assert_eq!(
            book.observe(long(3.0), 1e-9),
            Observation::Diverged {
                expected: 1.0,
                observed: 3.0
            }
        );
        assert!(book.is_suspended("BTCUSDT"));
        // the cache takes the exchange value anyway
        assert_eq!(book.get("BTCUSDT").unwrap().position.size, 3.0);

        // the exchange keeps moving: still suspended
        assert!(matches!(
            book.observe(long(2.0), 1e-9),
            Observation::Diverged { .. }
        ));
        assert!(book.is_suspended("BTCUSDT"));

        assert_eq!(book.observe(long(2.0), 1e-9), Observation::Resumed);
        assert!(!book.is_suspended("BTCUSDT"));
        assert_eq!(book.observe(long(2.0), 1e-9), Observation::Agreed);
    }
}
