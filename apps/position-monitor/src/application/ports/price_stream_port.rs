//! Price Stream Port (Driven Port)
//!
//! Interface for the persistent streaming connection that carries mark
//! prices and account activity.
//!
//! # Event Delivery
//!
//! Implementations are constructed with an `mpsc::Sender<StreamEvent>` and
//! push every inbound event into it; nothing is polled. The sending side
//! runs on the transport's own task and must never block on the consumer:
//! price ticks are dropped (and counted) when the channel is full.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use super::credential_port::SessionToken;
use crate::domain::position::OrderSide;
use crate::domain::symbol::Symbol;

// =============================================================================
// Session
// =============================================================================

/// Identifier of one connection; events from an older session are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// An open stream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// When the connection opened.
    pub opened_at: DateTime<Utc>,
}

impl Session {
    /// Create a session record opened now.
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            opened_at: Utc::now(),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Mark price update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTick {
    /// Instrument.
    pub symbol: Symbol,
    /// Mark price.
    pub mark_price: Decimal,
    /// Venue event time.
    pub event_time: DateTime<Utc>,
}

/// Session lifecycle signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// Connection established.
    Opened,
    /// Liveness reply or other keep-alive traffic.
    Pong,
    /// Connection closed.
    Closed {
        /// Close reason.
        reason: String,
    },
    /// Transport error; the session is unusable.
    Error {
        /// Error message.
        message: String,
    },
    /// The venue reported the session credential expired.
    CredentialExpired,
}

/// Lifecycle event tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// Session that produced the event.
    pub session: SessionId,
    /// What happened.
    pub kind: SessionEventKind,
}

/// Account activity pushed by the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    /// Balance and position change.
    BalanceUpdate {
        /// Venue reason code.
        reason: String,
        /// Updated positions as (symbol, signed size).
        positions: Vec<(Symbol, Decimal)>,
    },
    /// Order lifecycle update.
    OrderUpdate {
        /// Instrument.
        symbol: Symbol,
        /// Order side.
        side: OrderSide,
        /// Venue order type (e.g., `STOP_MARKET`).
        order_type: String,
        /// Venue order status (e.g., `FILLED`).
        status: String,
        /// Average fill price.
        average_price: Decimal,
    },
}

impl AccountEvent {
    /// Whether this reports a protective stop order filling.
    #[must_use]
    pub fn is_stop_fill(&self) -> bool {
        match self {
            Self::OrderUpdate {
                order_type, status, ..
            } => status == "FILLED" && order_type.starts_with("STOP"),
            Self::BalanceUpdate { .. } => false,
        }
    }
}

/// Everything the transport delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Mark price update.
    Tick(PriceTick),
    /// Session lifecycle.
    Session(SessionEvent),
    /// Account activity.
    Account(AccountEvent),
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from stream operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// No session is open.
    #[error("not connected")]
    NotConnected,

    /// The venue rejected a subscription request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The session closed while a request was pending.
    #[error("session closed")]
    Closed,

    /// The request was not acknowledged in time.
    #[error("request timed out")]
    Timeout,
}

// =============================================================================
// Port
// =============================================================================

/// Port for the streaming connection.
#[async_trait]
pub trait PriceStreamPort: Send + Sync {
    /// Open a session authorized by `token`. Any previous session is closed.
    async fn connect(&self, token: &SessionToken) -> Result<Session, StreamError>;

    /// Subscribe to mark prices. Idempotent; empty input is a no-op.
    async fn subscribe(&self, symbols: &[Symbol]) -> Result<(), StreamError>;

    /// Unsubscribe from mark prices. Idempotent; empty input is a no-op.
    async fn unsubscribe(&self, symbols: &[Symbol]) -> Result<(), StreamError>;

    /// Close `session` if it is still the active one.
    async fn close(&self, session: &Session);
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn stop_fill_detection() {
        let fill = AccountEvent::OrderUpdate {
            symbol: Symbol::new("BTCUSDT"),
            side: OrderSide::Sell,
            order_type: "STOP_MARKET".into(),
            status: "FILLED".into(),
            average_price: dec!(104.9),
        };
        let limit = AccountEvent::OrderUpdate {
            symbol: Symbol::new("BTCUSDT"),
            side: OrderSide::Sell,
            order_type: "LIMIT".into(),
            status: "FILLED".into(),
            average_price: dec!(120),
        };

        assert!(fill.is_stop_fill());
        assert!(!limit.is_stop_fill());
    }

    #[test]
    fn session_id_display() {
        assert_eq!(SessionId(7).to_string(), "session-7");
    }
}
