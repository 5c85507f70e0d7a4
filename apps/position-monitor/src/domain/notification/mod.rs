//! Operator notifications produced by the monitor.
//!
//! Rendering is plain text; the sink owns channel-specific limits such as
//! message length.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::position::{OrderSide, Position, PositionSide};
use crate::domain::symbol::Symbol;

/// Urgency of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine information.
    Info,
    /// Needs attention, nothing at risk yet.
    Warning,
    /// A position may be unprotected or monitoring has stopped.
    Critical,
}

impl Severity {
    /// Stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Compact view of a tracked position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionSummary {
    /// Instrument.
    pub symbol: Symbol,
    /// Side.
    pub side: PositionSide,
    /// Absolute size.
    pub quantity: Decimal,
    /// Entry price.
    pub entry_price: Decimal,
    /// Current stop.
    pub stop_loss: Decimal,
}

impl From<&Position> for PositionSummary {
    fn from(position: &Position) -> Self {
        Self {
            symbol: position.symbol().clone(),
            side: position.side(),
            quantity: position.quantity(),
            entry_price: position.entry_price(),
            stop_loss: position.current_stop_loss(),
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    /// Monitoring began with these positions.
    MonitoringStarted {
        /// Positions at start-up.
        positions: Vec<PositionSummary>,
    },
    /// The tracked symbol set changed.
    PositionsChanged {
        /// Newly tracked symbols.
        opened: Vec<Symbol>,
        /// Symbols no longer open.
        closed: Vec<Symbol>,
    },
    /// A stop was moved in the favorable direction.
    StopRaised {
        /// Instrument.
        symbol: Symbol,
        /// Position side.
        side: PositionSide,
        /// Entry price.
        entry_price: Decimal,
        /// Mark price that triggered the move.
        mark_price: Decimal,
        /// Favorable change in percent.
        change_percent: Decimal,
        /// Stop before the move.
        previous_stop: Decimal,
        /// Stop submitted to the venue.
        new_stop: Decimal,
    },
    /// The venue rejected a stop replacement; the previous stop should still
    /// be in place.
    OrderRejected {
        /// Instrument.
        symbol: Symbol,
        /// Stop that was attempted.
        stop_price: Decimal,
        /// Venue reason.
        reason: String,
    },
    /// Existing stops were cancelled but the new one was not placed.
    PositionUnprotected {
        /// Instrument.
        symbol: Symbol,
        /// Stop that was attempted.
        stop_price: Decimal,
        /// Venue reason.
        reason: String,
    },
    /// The price stream dropped.
    StreamDisconnected {
        /// Cause.
        reason: String,
    },
    /// The price stream is back.
    StreamReconnected {
        /// Failed attempts before success.
        attempts: u32,
    },
    /// Reconnection was abandoned.
    ReconnectAbandoned {
        /// Consecutive failures.
        attempts: u32,
    },
    /// Balance or position change reported by the account stream.
    AccountActivity {
        /// Venue reason code (e.g., ORDER, FUNDING_FEE).
        reason: String,
        /// Positions reported in the update as (symbol, signed size).
        positions: Vec<(Symbol, Decimal)>,
    },
    /// A protective stop order filled.
    StopTriggered {
        /// Instrument.
        symbol: Symbol,
        /// Order side.
        side: OrderSide,
        /// Average fill price.
        fill_price: Decimal,
    },
}

/// A notification with its creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Payload.
    pub kind: NotificationKind,
    /// When it was produced.
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Create a notification stamped now.
    #[must_use]
    pub fn new(kind: NotificationKind) -> Self {
        Self {
            kind,
            created_at: Utc::now(),
        }
    }

    /// Urgency derived from the kind.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match &self.kind {
            NotificationKind::MonitoringStarted { .. }
            | NotificationKind::PositionsChanged { .. }
            | NotificationKind::StopRaised { .. }
            | NotificationKind::StreamReconnected { .. }
            | NotificationKind::AccountActivity { .. } => Severity::Info,
            NotificationKind::StreamDisconnected { .. } | NotificationKind::StopTriggered { .. } => {
                Severity::Warning
            }
            NotificationKind::OrderRejected { .. }
            | NotificationKind::PositionUnprotected { .. }
            | NotificationKind::ReconnectAbandoned { .. } => Severity::Critical,
        }
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match &self.kind {
            NotificationKind::MonitoringStarted { .. } => "monitoring_started",
            NotificationKind::PositionsChanged { .. } => "positions_changed",
            NotificationKind::StopRaised { .. } => "stop_raised",
            NotificationKind::OrderRejected { .. } => "order_rejected",
            NotificationKind::PositionUnprotected { .. } => "position_unprotected",
            NotificationKind::StreamDisconnected { .. } => "stream_disconnected",
            NotificationKind::StreamReconnected { .. } => "stream_reconnected",
            NotificationKind::ReconnectAbandoned { .. } => "reconnect_abandoned",
            NotificationKind::AccountActivity { .. } => "account_activity",
            NotificationKind::StopTriggered { .. } => "stop_triggered",
        }
    }

    /// Plain-text rendering.
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = String::new();
        let time = self.created_at.format("%Y-%m-%d %H:%M:%S UTC");

        match &self.kind {
            NotificationKind::MonitoringStarted { positions } => {
                let _ = writeln!(text, "Position monitor started ({} open)", positions.len());
                for p in positions {
                    let _ = writeln!(
                        text,
                        "{} {} qty={} entry={} stop={}",
                        p.symbol,
                        p.side.as_str(),
                        p.quantity,
                        p.entry_price,
                        p.stop_loss
                    );
                }
            }
            NotificationKind::PositionsChanged { opened, closed } => {
                let _ = writeln!(text, "Positions changed");
                if !opened.is_empty() {
                    let _ = writeln!(text, "opened: {}", join(opened));
                }
                if !closed.is_empty() {
                    let _ = writeln!(text, "closed: {}", join(closed));
                }
            }
            NotificationKind::StopRaised {
                symbol,
                side,
                entry_price,
                mark_price,
                change_percent,
                previous_stop,
                new_stop,
            } => {
                let _ = writeln!(text, "Stop-loss moved: {symbol} ({})", side.as_str());
                let _ = writeln!(text, "entry={entry_price} mark={mark_price} change={change_percent:.2}%");
                let _ = writeln!(text, "stop {previous_stop} -> {new_stop}");
            }
            NotificationKind::OrderRejected {
                symbol,
                stop_price,
                reason,
            } => {
                let _ = writeln!(text, "ALERT stop-loss rejected: {symbol} stop={stop_price}");
                let _ = writeln!(text, "reason: {reason}");
            }
            NotificationKind::PositionUnprotected {
                symbol,
                stop_price,
                reason,
            } => {
                let _ = writeln!(text, "ALERT {symbol} has NO protective stop");
                let _ = writeln!(text, "previous stops cancelled, new stop {stop_price} failed: {reason}");
            }
            NotificationKind::StreamDisconnected { reason } => {
                let _ = writeln!(text, "Price stream disconnected: {reason}");
            }
            NotificationKind::StreamReconnected { attempts } => {
                let _ = writeln!(text, "Price stream reconnected after {attempts} failed attempt(s)");
            }
            NotificationKind::ReconnectAbandoned { attempts } => {
                let _ = writeln!(
                    text,
                    "ALERT price stream reconnection abandoned after {attempts} attempts; restart required"
                );
            }
            NotificationKind::AccountActivity { reason, positions } => {
                let _ = writeln!(text, "Account update ({reason})");
                for (symbol, size) in positions {
                    let _ = writeln!(text, "{symbol} size={size}");
                }
            }
            NotificationKind::StopTriggered {
                symbol,
                side,
                fill_price,
            } => {
                let _ = writeln!(text, "Stop-loss triggered: {symbol} {} @ {fill_price}", side.as_str());
            }
        }

        let _ = write!(text, "{time}");
        text
    }
}

fn join(symbols: &[Symbol]) -> String {
    symbols
        .iter()
        .map(Symbol::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
