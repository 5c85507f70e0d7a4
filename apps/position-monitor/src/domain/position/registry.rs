//! Position registry: symbol → tracked position.

use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;

use super::{Position, PositionSnapshot};
use crate::domain::stop_loss::StopLossPolicy;
use crate::domain::symbol::Symbol;

/// Outcome of replacing the registry contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    /// Symbols tracked for the first time (including side flips).
    pub opened: Vec<Symbol>,
    /// Symbols no longer reported by the venue.
    pub closed: Vec<Symbol>,
    /// Snapshots that could not be tracked (flat, bad entry, duplicate).
    pub rejected: Vec<Symbol>,
}

impl RegistryDiff {
    /// Whether the tracked symbol set changed.
    #[must_use]
    pub fn changes_symbols(&self) -> bool {
        !self.opened.is_empty() || !self.closed.is_empty()
    }
}

/// Authoritative mapping of symbol to open position.
///
/// The registry is owned by the monitor and mutated under its lock; it has
/// no interior synchronization of its own.
#[derive(Debug, Default)]
pub struct PositionRegistry {
    positions: HashMap<Symbol, Position>,
}

impl PositionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Look up a position.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Tracked symbols.
    #[must_use]
    pub fn symbols(&self) -> HashSet<Symbol> {
        self.positions.keys().cloned().collect()
    }

    /// Iterate positions in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Positions sorted by symbol, for stable presentation.
    #[must_use]
    pub fn sorted(&self) -> Vec<&Position> {
        let mut positions: Vec<&Position> = self.positions.values().collect();
        positions.sort_by(|a, b| a.symbol().cmp(b.symbol()));
        positions
    }

    /// Replace the registry wholesale with the venue's current view.
    ///
    /// Closed positions are dropped. Positions that persist with the same
    /// side keep their ratcheted stop; everything else is seeded fresh by
    /// `policy`.
    pub fn replace(
        &mut self,
        snapshots: impl IntoIterator<Item = PositionSnapshot>,
        policy: &StopLossPolicy,
    ) -> RegistryDiff {
        let mut previous = std::mem::take(&mut self.positions);
        let mut diff = RegistryDiff::default();

        for snapshot in snapshots {
            if !snapshot.is_trackable() || self.positions.contains_key(&snapshot.symbol) {
                diff.rejected.push(snapshot.symbol);
                continue;
            }

            let carried = previous
                .remove(&snapshot.symbol)
                .filter(|existing| Some(existing.side()) == snapshot.side());

            let position = if let Some(mut existing) = carried {
                existing.update_from(&snapshot);
                existing
            } else if let Some(position) = Position::open(&snapshot, policy) {
                diff.opened.push(snapshot.symbol.clone());
                position
            } else {
                diff.rejected.push(snapshot.symbol);
                continue;
            };

            self.positions.insert(position.symbol().clone(), position);
        }

        diff.closed = previous
            .into_keys()
            .filter(|symbol| !self.positions.contains_key(symbol))
            .collect();

        diff.opened.sort();
        diff.closed.sort();
        diff
    }

    /// Record a stop that the venue has accepted.
    ///
    /// Returns `false` (and leaves the registry unchanged) if the symbol is
    /// no longer tracked or the stop would loosen protection.
    pub fn record_stop(&mut self, symbol: &str, stop: Decimal) -> bool {
        self.positions
            .get_mut(symbol)
            .is_some_and(|position| position.ratchet_stop(stop))
    }
}
