//! Stream Connection Lifecycle
//!
//! State machine for the price stream session:
//!
//! ```text
//!                 connect()            success
//! DISCONNECTED ─────────────► CONNECTING ───────► CONNECTED
//!      ▲  ▲                        │                │   ▲
//!      │  └────── failure ─────────┘      heartbeat │   │ heartbeat
//!      │                                  missed    ▼   │ resumed
//!      └──────────── grace expired ───────────── DEGRADED
//!
//! any live state ── session expired / closed ──► DISCONNECTED
//! DISCONNECTED ── attempts exhausted ──► GAVE_UP (terminal)
//! ```

mod backoff;

pub use backoff::{ReconnectConfig, ReconnectPolicy};

use serde::Serialize;
use thiserror::Error;

/// State of the stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No session.
    Disconnected,
    /// Session being opened.
    Connecting,
    /// Session open and heartbeats current.
    Connected,
    /// Session nominally open but silent past the heartbeat timeout.
    Degraded,
    /// Reconnection abandoned; requires a restart.
    GaveUp,
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// A connection attempt starts.
    ConnectRequested,
    /// The transport opened a session.
    ConnectSucceeded,
    /// The attempt failed or timed out.
    ConnectFailed,
    /// No inbound traffic within the heartbeat timeout.
    HeartbeatMissed,
    /// Traffic resumed while degraded.
    HeartbeatResumed,
    /// Still silent after the degraded grace period.
    GraceExpired,
    /// The transport reported the session closed or errored.
    SessionClosed,
    /// The venue reported the session credential invalid.
    SessionExpired,
    /// Consecutive failures reached the configured maximum.
    AttemptsExhausted,
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid connection transition: {event:?} in state {from}")]
pub struct InvalidTransition {
    /// State the event arrived in.
    pub from: ConnectionState,
    /// Rejected event.
    pub event: ConnectionEvent,
}

impl ConnectionState {
    /// Apply `event`, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for events that are not meaningful in
    /// the current state. `GaveUp` accepts no events.
    pub const fn apply(self, event: ConnectionEvent) -> Result<Self, InvalidTransition> {
        use ConnectionEvent as E;

        let next = match (self, event) {
            (Self::Disconnected, E::ConnectRequested) => Self::Connecting,
            (Self::Disconnected, E::AttemptsExhausted) => Self::GaveUp,
            (Self::Connecting, E::ConnectSucceeded) => Self::Connected,
            (Self::Connecting, E::ConnectFailed) => Self::Disconnected,
            (Self::Connected, E::HeartbeatMissed) => Self::Degraded,
            (Self::Degraded, E::HeartbeatResumed) => Self::Connected,
            (Self::Degraded, E::GraceExpired)
            | (Self::Connected | Self::Degraded, E::SessionClosed)
            | (Self::Disconnected | Self::Connecting | Self::Connected | Self::Degraded, E::SessionExpired) => {
                Self::Disconnected
            }
            _ => {
                return Err(InvalidTransition { from: self, event });
            }
        };

        Ok(next)
    }

    /// Whether a session is open (possibly degraded).
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }

    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::GaveUp)
    }

    /// Stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::GaveUp => "gave_up",
        }
    }

    /// Numeric encoding for the connection state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Degraded => 3.0,
            Self::GaveUp => -1.0,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
