//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the monitor interacts with the exchange, the stream and
//! the operator.

/// Port interfaces for external systems (exchange, stream, notifications).
pub mod ports;

/// Monitoring, supervision and notification services.
pub mod services;
