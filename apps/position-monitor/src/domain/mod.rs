//! Domain Layer - Core monitoring types and business logic.
//!
//! Pure types and rules with no I/O: positions and their registry, the
//! stop-loss policy, subscription diffs, the connection state machine and
//! instrument constraints.

/// Connection lifecycle state machine and reconnect backoff.
pub mod connection;

/// Instrument price and quantity constraints.
pub mod instrument;

/// Operator notifications.
pub mod notification;

/// Tracked positions and the registry.
pub mod position;

/// Stop-loss escalation policy.
pub mod stop_loss;

/// Stream subscription tracking.
pub mod subscription;

/// Instrument symbol value object.
pub mod symbol;
