//! Binance USDT-M Futures Adapter
//!
//! Implements the exchange, credential and price stream ports against the
//! Binance futures REST API and combined WebSocket stream:
//! - Signed REST requests behind a pluggable [`RequestSigner`]
//! - Instrument filters cached from `exchangeInfo`
//! - Cancel-then-place stop replacement
//! - Listen-key session credentials
//! - Combined mark price and user-data stream

mod adapter;
mod error;
mod instruments;
mod messages;
mod rest;
mod signer;
mod stream;

pub use adapter::BinanceAdapter;
pub use error::BinanceError;
pub use instruments::InstrumentCatalog;
pub use messages::{InboundFrame, parse_frame};
pub use rest::BinanceRestClient;
pub use signer::{HmacSha256Signer, RequestSigner};
pub use stream::{BinanceStream, StreamConfig};
