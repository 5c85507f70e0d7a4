//! Position Tracking Types
//!
//! Domain types for the authoritative in-memory view of open positions.
//!
//! # Lifecycle
//!
//! - A position is created when a refresh observes a non-zero size for a
//!   symbol that is not tracked (or whose side flipped). Its stop-loss is
//!   seeded by the [`StopLossPolicy`].
//! - Its stop-loss is mutated only through [`PositionRegistry::record_stop`],
//!   after a successful order replacement, and only in the favorable direction.
//! - It is destroyed when a refresh no longer reports it.

mod registry;

pub use registry::{PositionRegistry, RegistryDiff};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::stop_loss::StopLossPolicy;
use crate::domain::symbol::Symbol;

// =============================================================================
// Side
// =============================================================================

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    /// Positive size; profits when price rises.
    Long,
    /// Negative size; profits when price falls.
    Short,
}

impl PositionSide {
    /// Derive the side from a signed size. Zero size has no side.
    #[must_use]
    pub fn from_signed_size(size: Decimal) -> Option<Self> {
        if size.is_sign_positive() && !size.is_zero() {
            Some(Self::Long)
        } else if size.is_sign_negative() && !size.is_zero() {
            Some(Self::Short)
        } else {
            None
        }
    }

    /// Order side that reduces a position of this side.
    #[must_use]
    pub const fn closing_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

/// Side of an order sent to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

impl OrderSide {
    /// Venue wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

// =============================================================================
// Snapshot (venue view)
// =============================================================================

/// A position as reported by the venue, before stop state is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Instrument.
    pub symbol: Symbol,
    /// Signed quantity; the sign encodes the side.
    pub signed_size: Decimal,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Unrealized profit reported by the venue (advisory).
    pub unrealized_profit: Decimal,
    /// Protective stop the venue already holds for this position, if known.
    pub venue_stop_loss: Option<Decimal>,
}

impl PositionSnapshot {
    /// Create a snapshot without a venue stop.
    #[must_use]
    pub fn new(
        symbol: impl Into<Symbol>,
        signed_size: Decimal,
        entry_price: Decimal,
        unrealized_profit: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            signed_size,
            entry_price,
            unrealized_profit,
            venue_stop_loss: None,
        }
    }

    /// Attach the stop the venue reports for this position.
    #[must_use]
    pub fn with_venue_stop(mut self, stop: Decimal) -> Self {
        self.venue_stop_loss = Some(stop);
        self
    }

    /// Side of the snapshot, `None` for flat.
    #[must_use]
    pub fn side(&self) -> Option<PositionSide> {
        PositionSide::from_signed_size(self.signed_size)
    }

    /// Whether this snapshot can be tracked (non-zero size, positive entry).
    #[must_use]
    pub fn is_trackable(&self) -> bool {
        self.side().is_some() && self.entry_price > Decimal::ZERO
    }
}

// =============================================================================
// Position
// =============================================================================

/// A tracked open position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    symbol: Symbol,
    side: PositionSide,
    signed_size: Decimal,
    entry_price: Decimal,
    current_stop_loss: Decimal,
    unrealized_profit: Decimal,
    opened_at: DateTime<Utc>,
}

impl Position {
    /// Open a new tracked position, seeding its stop from the policy.
    ///
    /// Returns `None` for snapshots that are flat or carry a non-positive
    /// entry price.
    #[must_use]
    pub fn open(snapshot: &PositionSnapshot, policy: &StopLossPolicy) -> Option<Self> {
        if !snapshot.is_trackable() {
            return None;
        }
        let side = snapshot.side()?;
        let stop = policy.initial_stop(side, snapshot.entry_price, snapshot.venue_stop_loss);

        Some(Self {
            symbol: snapshot.symbol.clone(),
            side,
            signed_size: snapshot.signed_size,
            entry_price: snapshot.entry_price,
            current_stop_loss: stop,
            unrealized_profit: snapshot.unrealized_profit,
            opened_at: Utc::now(),
        })
    }

    /// Refresh venue-owned fields from a newer snapshot of the same position.
    ///
    /// The stop-loss and opening time are retained.
    pub fn update_from(&mut self, snapshot: &PositionSnapshot) {
        self.signed_size = snapshot.signed_size;
        self.entry_price = snapshot.entry_price;
        self.unrealized_profit = snapshot.unrealized_profit;
    }

    /// Instrument.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Position side.
    #[must_use]
    pub const fn side(&self) -> PositionSide {
        self.side
    }

    /// Signed size.
    #[must_use]
    pub const fn signed_size(&self) -> Decimal {
        self.signed_size
    }

    /// Absolute size, used as the stop order quantity.
    #[must_use]
    pub fn quantity(&self) -> Decimal {
        self.signed_size.abs()
    }

    /// Average entry price.
    #[must_use]
    pub const fn entry_price(&self) -> Decimal {
        self.entry_price
    }

    /// Current protective stop.
    #[must_use]
    pub const fn current_stop_loss(&self) -> Decimal {
        self.current_stop_loss
    }

    /// Unrealized profit as last reported.
    #[must_use]
    pub const fn unrealized_profit(&self) -> Decimal {
        self.unrealized_profit
    }

    /// When the registry first observed this position.
    #[must_use]
    pub const fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Favorable price change in percent at `price`.
    #[must_use]
    pub fn price_change_percent(&self, price: Decimal) -> Option<Decimal> {
        StopLossPolicy::price_change_percent(self.side, self.entry_price, price)
    }

    /// Move the stop to `stop` if it is strictly more favorable.
    ///
    /// Returns whether the stop changed.
    pub fn ratchet_stop(&mut self, stop: Decimal) -> bool {
        if StopLossPolicy::is_more_favorable(self.side, stop, self.current_stop_loss) {
            self.current_stop_loss = stop;
            true
        } else {
            false
        }
    }
}
