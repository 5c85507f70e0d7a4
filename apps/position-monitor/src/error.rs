//! Monitor error taxonomy.
//!
//! Every failure the monitor observes is classified into a [`MonitorError`]
//! and handled according to its [`Disposition`]:
//!
//! | Error | Disposition | Handling |
//! |-------|-------------|----------|
//! | `TransientFetch` | `Skip` | Retried on the next scheduled cycle |
//! | `Timeout` | `Skip` | Failure of that call only |
//! | `OutOfRange` | `Skip` | Symbol skipped for this cycle |
//! | `BelowMinimumSize` | `Skip` | Symbol skipped for this cycle |
//! | `OrderRejected` | `Alert` | Critical alert, stop unchanged |
//! | `Unprotected` | `Alert` | Critical alert, position has no stop |
//! | `SessionExpired` | `Reconnect` | Forced credential renewal and reconnect |
//! | `Stream` | `Skip` | Retried by the next reconcile pass |
//! | `GiveUp` | `Fatal` | Monitoring halted, operator restart |

use rust_decimal::Decimal;
use thiserror::Error;

use crate::application::ports::{ExchangeError, StreamError};
use crate::domain::symbol::Symbol;

/// How the monitor reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Log, skip the affected symbol or cycle, continue.
    Skip,
    /// Enqueue a high-severity alert.
    Alert,
    /// Force a credential renewal and reconnect.
    Reconnect,
    /// Stop monitoring.
    Fatal,
}

/// Classified monitor failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MonitorError {
    /// Network or HTTP failure.
    #[error("transient failure: {0}")]
    TransientFetch(String),

    /// Outbound call exceeded its timeout.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Price outside the valid band.
    #[error("price {price} out of range for {symbol}")]
    OutOfRange {
        /// Instrument.
        symbol: Symbol,
        /// Offending price.
        price: Decimal,
    },

    /// Quantity below the instrument minimum.
    #[error("quantity below minimum for {0}")]
    BelowMinimumSize(Symbol),

    /// Stop replacement rejected; the previous stop remains.
    #[error("order rejected for {symbol}: {reason}")]
    OrderRejected {
        /// Instrument.
        symbol: Symbol,
        /// Venue reason.
        reason: String,
    },

    /// Stop replacement rejected after the previous stop was cancelled.
    #[error("{symbol} left without a stop: {reason}")]
    Unprotected {
        /// Instrument.
        symbol: Symbol,
        /// Venue reason.
        reason: String,
    },

    /// Session credential invalid.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Stream request failed.
    #[error("stream: {0}")]
    Stream(#[from] StreamError),

    /// Reconnection abandoned.
    #[error("gave up after {0} consecutive connection failures")]
    GiveUp(u32),
}

impl MonitorError {
    /// Reaction for this error.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::TransientFetch(_)
            | Self::Timeout(_)
            | Self::OutOfRange { .. }
            | Self::BelowMinimumSize(_)
            | Self::Stream(_) => Disposition::Skip,
            Self::OrderRejected { .. } | Self::Unprotected { .. } => Disposition::Alert,
            Self::SessionExpired(_) => Disposition::Reconnect,
            Self::GiveUp(_) => Disposition::Fatal,
        }
    }
}

impl From<ExchangeError> for MonitorError {
    fn from(error: ExchangeError) -> Self {
        match error {
            ExchangeError::TransientFetch { message } | ExchangeError::Unauthorized { message } => {
                Self::TransientFetch(message)
            }
            ExchangeError::UnknownInstrument { symbol } => {
                Self::TransientFetch(format!("unknown instrument {symbol}"))
            }
            ExchangeError::OutOfRange { symbol, price } => Self::OutOfRange { symbol, price },
            ExchangeError::BelowMinimumSize { symbol, .. } => Self::BelowMinimumSize(symbol),
            ExchangeError::OrderRejected { symbol, reason } => Self::OrderRejected { symbol, reason },
            ExchangeError::StopRemoved { symbol, reason } => Self::Unprotected { symbol, reason },
            ExchangeError::SessionExpired { message } => Self::SessionExpired(message),
            ExchangeError::Timeout { operation } => Self::Timeout(operation),
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn exchange_errors_map_to_dispositions() {
        let cases = [
            (
                ExchangeError::TransientFetch {
                    message: "502".into(),
                },
                Disposition::Skip,
            ),
            (
                ExchangeError::OutOfRange {
                    symbol: Symbol::new("BTCUSDT"),
                    price: dec!(1),
                },
                Disposition::Skip,
            ),
            (
                ExchangeError::OrderRejected {
                    symbol: Symbol::new("BTCUSDT"),
                    reason: "-2021".into(),
                },
                Disposition::Alert,
            ),
            (
                ExchangeError::StopRemoved {
                    symbol: Symbol::new("BTCUSDT"),
                    reason: "-2021".into(),
                },
                Disposition::Alert,
            ),
            (
                ExchangeError::SessionExpired {
                    message: "-1125".into(),
                },
                Disposition::Reconnect,
            ),
            (
                ExchangeError::Timeout {
                    operation: "replace_stop_order",
                },
                Disposition::Skip,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(MonitorError::from(error).disposition(), expected);
        }
    }

    #[test]
    fn stop_removed_becomes_unprotected() {
        let error = MonitorError::from(ExchangeError::StopRemoved {
            symbol: Symbol::new("ETHUSDT"),
            reason: "margin".into(),
        });
        assert!(matches!(error, MonitorError::Unprotected { .. }));
    }

    #[test]
    fn give_up_is_fatal() {
        assert_eq!(MonitorError::GiveUp(10).disposition(), Disposition::Fatal);
        assert_eq!(
            MonitorError::from(StreamError::Timeout).disposition(),
            Disposition::Skip
        );
    }
}
