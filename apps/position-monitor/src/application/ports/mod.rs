//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `ExchangePort`: Positions, mark prices and stop order replacement
//! - `SessionCredentialPort`: Streaming session token lifecycle
//! - `PriceStreamPort`: Persistent mark price / account event stream
//! - `NotificationSink`: Operator message delivery

mod credential_port;
mod exchange_port;
mod notification_port;
mod price_stream_port;

pub use credential_port::{SessionCredentialPort, SessionToken};
pub use exchange_port::{ExchangeError, ExchangePort, OrderRef, StopOrderRequest};
pub use notification_port::NotificationSink;
pub use price_stream_port::{
    AccountEvent, PriceStreamPort, PriceTick, Session, SessionEvent, SessionEventKind, SessionId,
    StreamError, StreamEvent,
};
