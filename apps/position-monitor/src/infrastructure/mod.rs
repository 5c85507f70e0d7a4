//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Binance USDT-M futures REST and stream adapters.
pub mod binance;

/// Configuration loaded from the environment.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Telegram and log notification sinks.
pub mod telegram;

/// OpenTelemetry tracing integration.
pub mod telemetry;
