//! Subscription Tracking
//!
//! The set of symbols currently subscribed on the price stream, and the
//! diff that brings it in line with the tracked positions.
//!
//! # Design
//!
//! The set only records what the transport has confirmed. A reconcile pass
//! computes [`SubscriptionChanges`] against the desired symbols, the caller
//! issues unsubscribes first and subscribes second, and marks each batch
//! once the transport accepts it. A batch that fails is left out of the set
//! and is retried by the next pass.

use std::collections::HashSet;

use crate::domain::symbol::Symbol;

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to stream subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Symbols to subscribe to.
    pub subscribe: HashSet<Symbol>,
    /// Symbols to unsubscribe from.
    pub unsubscribe: HashSet<Symbol>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Symbols to subscribe, sorted for deterministic requests.
    #[must_use]
    pub fn to_subscribe(&self) -> Vec<Symbol> {
        sorted(&self.subscribe)
    }

    /// Symbols to unsubscribe, sorted for deterministic requests.
    #[must_use]
    pub fn to_unsubscribe(&self) -> Vec<Symbol> {
        sorted(&self.unsubscribe)
    }
}

fn sorted(symbols: &HashSet<Symbol>) -> Vec<Symbol> {
    let mut list: Vec<Symbol> = symbols.iter().cloned().collect();
    list.sort();
    list
}

// =============================================================================
// Subscription Set
// =============================================================================

/// Symbols the stream is confirmed to be delivering.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    monitored: HashSet<Symbol>,
}

impl SubscriptionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the changes needed to reach `desired`.
    ///
    /// `unsubscribe = monitored - desired`, `subscribe = desired - monitored`.
    #[must_use]
    pub fn diff(&self, desired: &HashSet<Symbol>) -> SubscriptionChanges {
        SubscriptionChanges {
            subscribe: desired.difference(&self.monitored).cloned().collect(),
            unsubscribe: self.monitored.difference(desired).cloned().collect(),
        }
    }

    /// Record symbols the transport accepted a subscribe for.
    pub fn mark_subscribed(&mut self, symbols: impl IntoIterator<Item = Symbol>) {
        self.monitored.extend(symbols);
    }

    /// Record symbols the transport accepted an unsubscribe for.
    pub fn mark_unsubscribed<'a>(&mut self, symbols: impl IntoIterator<Item = &'a Symbol>) {
        for symbol in symbols {
            self.monitored.remove(symbol);
        }
    }

    /// Forget everything; a new stream session starts with no subscriptions.
    pub fn clear(&mut self) {
        self.monitored.clear();
    }

    /// Whether `symbol` is subscribed.
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.monitored.contains(symbol)
    }

    /// Number of subscribed symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.monitored.len()
    }

    /// Whether nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.monitored.is_empty()
    }

    /// Snapshot of subscribed symbols.
    #[must_use]
    pub fn symbols(&self) -> HashSet<Symbol> {
        self.monitored.clone()
    }
}
