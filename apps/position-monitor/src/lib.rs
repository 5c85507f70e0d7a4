#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Position Monitor - Dynamic Stop-Loss Engine
//!
//! Keeps an in-memory view of open futures positions, follows their mark
//! prices over one streaming connection and ratchets a protective stop order
//! upward (or downward for shorts) as each position moves into profit.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Pure monitoring types and rules
//!   - `position`: Tracked positions and the registry
//!   - `stop_loss`: Stepped and banded escalation policy
//!   - `subscription`: Desired vs. confirmed stream subscriptions
//!   - `connection`: Connection state machine and reconnect backoff
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Exchange, credential, stream and notification interfaces
//!   - `services`: Monitor, supervisor, credential renewal, dispatcher, router
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: REST client, stream transport, request signing
//!   - `telegram`: Notification delivery
//!   - `config`: Environment configuration
//!   - `metrics` / `telemetry`: Prometheus and tracing setup
//!
//! # Data Flow
//!
//! ```text
//!                       ┌─────────────┐  ticks   ┌───────────────┐  replace  ┌──────────┐
//! Binance stream ──────►│ EventRouter │─────────►│ PositionMonitor│─────────►│ Exchange │
//!                       └──────┬──────┘          └───────┬───────┘           └──────────┘
//!                              │ session events          │ notifications
//!                              ▼                         ▼
//!                       ┌─────────────┐          ┌───────────────┐
//!                       │ Supervisor  │          │  Dispatcher   │──► Telegram / log
//!                       └─────────────┘          └───────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Monitoring types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Service-level error type.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::position::{OrderSide, Position, PositionRegistry, PositionSide, PositionSnapshot, RegistryDiff};
pub use domain::stop_loss::{PolicyError, StopLossPolicy, StopLossRule, TrailingBand};
pub use domain::symbol::Symbol;

// Ports
pub use application::ports::{
    ExchangeError, ExchangePort, NotificationSink, PriceStreamPort, PriceTick, SessionCredentialPort,
    StreamError, StreamEvent,
};

// Services
pub use application::services::{
    ConnectionSupervisor, CredentialManager, EventRouter, NotificationDispatcher, PositionMonitorService,
};

// Errors
pub use error::MonitorError;

// Infrastructure config
pub use infrastructure::config::{ConfigError, MonitorConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
