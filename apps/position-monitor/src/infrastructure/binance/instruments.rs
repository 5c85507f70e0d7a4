//! Instrument filter cache.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::messages::ExchangeInfo;
use crate::domain::instrument::InstrumentFilters;
use crate::domain::symbol::Symbol;

/// Trading rules per symbol, loaded from `exchangeInfo`.
#[derive(Debug, Default)]
pub struct InstrumentCatalog {
    filters: RwLock<HashMap<Symbol, InstrumentFilters>>,
}

impl InstrumentCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached filters for `symbol`.
    #[must_use]
    pub fn get(&self, symbol: &Symbol) -> Option<InstrumentFilters> {
        self.filters.read().get(symbol).copied()
    }

    /// Replace the catalog contents. Returns how many instruments loaded.
    pub fn load(&self, info: &ExchangeInfo) -> usize {
        let loaded: HashMap<Symbol, InstrumentFilters> = info
            .symbols
            .iter()
            .filter_map(|s| s.instrument_filters().map(|f| (Symbol::new(&s.symbol), f)))
            .collect();
        let count = loaded.len();
        *self.filters.write() = loaded;
        count
    }

    /// Number of cached instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.read().is_empty()
    }
}
