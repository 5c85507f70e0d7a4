//! Exchange Port (Driven Port)
//!
//! Interface for the trading venue: position queries, mark prices,
//! instrument constraints and stop order replacement. One implementation
//! per venue; the monitor is venue-agnostic.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::position::{OrderSide, PositionSnapshot};
use crate::domain::symbol::Symbol;

/// Request to replace the protective stop for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOrderRequest {
    /// Instrument.
    pub symbol: Symbol,
    /// Order side (opposite the position).
    pub side: OrderSide,
    /// Trigger price, already rounded to tick.
    pub stop_price: Decimal,
    /// Quantity to close.
    pub quantity: Decimal,
}

impl StopOrderRequest {
    /// Create a stop replacement request.
    #[must_use]
    pub const fn new(symbol: Symbol, side: OrderSide, stop_price: Decimal, quantity: Decimal) -> Self {
        Self {
            symbol,
            side,
            stop_price,
            quantity,
        }
    }
}

/// Reference to an order accepted by the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    /// Venue order id.
    pub order_id: String,
    /// Client order id sent with the request.
    pub client_order_id: String,
    /// Instrument.
    pub symbol: Symbol,
}

/// Errors from exchange operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// Network or HTTP failure; retried on the next scheduled cycle.
    #[error("transient failure: {message}")]
    TransientFetch {
        /// Error message.
        message: String,
    },

    /// Price outside the instrument's valid band.
    #[error("price {price} out of range for {symbol}")]
    OutOfRange {
        /// Instrument.
        symbol: Symbol,
        /// Offending price.
        price: Decimal,
    },

    /// Quantity below the instrument minimum.
    #[error("quantity {quantity} below minimum {min} for {symbol}")]
    BelowMinimumSize {
        /// Instrument.
        symbol: Symbol,
        /// Computed quantity.
        quantity: Decimal,
        /// Minimum order size.
        min: Decimal,
    },

    /// The venue rejected the new stop; existing stops were left in place.
    #[error("order rejected for {symbol}: {reason}")]
    OrderRejected {
        /// Instrument.
        symbol: Symbol,
        /// Venue reason.
        reason: String,
    },

    /// Existing stops were cancelled but the new stop was rejected. The
    /// position has no protective stop.
    #[error("stop removed for {symbol} and replacement rejected: {reason}")]
    StopRemoved {
        /// Instrument.
        symbol: Symbol,
        /// Venue reason.
        reason: String,
    },

    /// The streaming session credential is no longer valid.
    #[error("session credential expired: {message}")]
    SessionExpired {
        /// Error message.
        message: String,
    },

    /// No instrument metadata for the symbol.
    #[error("unknown instrument: {symbol}")]
    UnknownInstrument {
        /// Instrument.
        symbol: Symbol,
    },

    /// Credentials rejected.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Error message.
        message: String,
    },

    /// The call did not complete in time.
    #[error("{operation} timed out")]
    Timeout {
        /// Operation name.
        operation: &'static str,
    },
}

impl ExchangeError {
    /// Stable label for metrics.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TransientFetch { .. } => "transient",
            Self::OutOfRange { .. } => "out_of_range",
            Self::BelowMinimumSize { .. } => "below_minimum_size",
            Self::OrderRejected { .. } => "order_rejected",
            Self::StopRemoved { .. } => "stop_removed",
            Self::SessionExpired { .. } => "session_expired",
            Self::UnknownInstrument { .. } => "unknown_instrument",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Port for venue operations.
///
/// Implementations must be safe to call concurrently and must not retry
/// failed calls themselves.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Fetch all positions with non-zero size, keyed by symbol.
    async fn fetch_active_positions(&self) -> Result<HashMap<Symbol, PositionSnapshot>, ExchangeError>;

    /// Current mark price.
    async fn quote_mark_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError>;

    /// Round a price to the instrument tick.
    ///
    /// Fails with [`ExchangeError::OutOfRange`] if `price` lies outside the
    /// instrument's valid band.
    async fn round_to_tick(&self, symbol: &Symbol, price: Decimal) -> Result<Decimal, ExchangeError>;

    /// Cancel existing stop orders for the symbol, then place the new one.
    ///
    /// If the cancel succeeded but the new order was rejected the error is
    /// [`ExchangeError::StopRemoved`].
    async fn replace_stop_order(&self, request: &StopOrderRequest) -> Result<OrderRef, ExchangeError>;

    /// Quantity for `notional` at `price`, floored to the lot step.
    ///
    /// Fails with [`ExchangeError::BelowMinimumSize`] under the minimum.
    async fn quantize_quantity(
        &self,
        symbol: &Symbol,
        notional: Decimal,
        price: Decimal,
    ) -> Result<Decimal, ExchangeError>;
}
