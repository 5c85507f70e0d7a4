//! Binance wire types.
//!
//! REST response bodies and the frames of the combined stream. All numeric
//! fields arrive as JSON strings and are parsed into [`Decimal`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::application::ports::{AccountEvent, PriceTick, StreamEvent};
use crate::domain::instrument::InstrumentFilters;
use crate::domain::position::OrderSide;
use crate::domain::symbol::Symbol;

// =============================================================================
// REST Responses
// =============================================================================

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    /// Venue error code.
    pub code: i64,
    /// Venue message.
    pub msg: String,
}

/// One entry of `GET /fapi/v2/positionRisk`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    /// Instrument.
    pub symbol: String,
    /// Signed size.
    pub position_amt: Decimal,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Unrealized profit.
    #[serde(rename = "unRealizedProfit")]
    pub unrealized_profit: Decimal,
}

/// `GET /fapi/v1/premiumIndex` for one symbol.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndex {
    /// Mark price.
    pub mark_price: Decimal,
}

/// `GET /fapi/v1/exchangeInfo`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    /// Listed instruments.
    pub symbols: Vec<SymbolInfo>,
}

/// One listed instrument.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    /// Instrument.
    pub symbol: String,
    /// Trading rules.
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

/// Trading rule entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    /// Price band and tick.
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price {
        /// Lowest price.
        min_price: Decimal,
        /// Highest price (zero = unbounded).
        max_price: Decimal,
        /// Tick size.
        tick_size: Decimal,
    },
    /// Quantity band and step.
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        /// Smallest quantity.
        min_qty: Decimal,
        /// Largest quantity.
        max_qty: Decimal,
        /// Quantity step.
        step_size: Decimal,
    },
    /// Filters this adapter does not use.
    #[serde(other)]
    Other,
}

impl SymbolInfo {
    /// Filters needed for stop placement, if both are present.
    #[must_use]
    pub fn instrument_filters(&self) -> Option<InstrumentFilters> {
        let mut price = None;
        let mut lot = None;
        for filter in &self.filters {
            match filter {
                SymbolFilter::Price {
                    min_price,
                    max_price,
                    tick_size,
                } => price = Some((*min_price, *max_price, *tick_size)),
                SymbolFilter::LotSize {
                    min_qty,
                    max_qty,
                    step_size,
                } => lot = Some((*min_qty, *max_qty, *step_size)),
                SymbolFilter::Other => {}
            }
        }
        let ((min_price, max_price, tick_size), (min_quantity, max_quantity, step_size)) = (price?, lot?);
        Some(InstrumentFilters {
            min_price,
            max_price,
            tick_size,
            min_quantity,
            max_quantity,
            step_size,
        })
    }
}

/// Open order as listed by `GET /fapi/v1/openOrders`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    /// Venue id.
    pub order_id: i64,
    /// Instrument.
    pub symbol: String,
    /// Order type.
    #[serde(rename = "type")]
    pub order_type: String,
    /// Order side.
    pub side: String,
    /// Trigger price.
    #[serde(default)]
    pub stop_price: Decimal,
}

impl OpenOrder {
    /// Whether this is a protective stop this adapter manages.
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(self.order_type.as_str(), "STOP_MARKET" | "STOP")
    }
}

/// Response to `POST /fapi/v1/order`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    /// Venue id.
    pub order_id: i64,
    /// Client id echoed back.
    pub client_order_id: String,
    /// Instrument.
    pub symbol: String,
}

/// Response to `POST /fapi/v1/listenKey`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKeyResponse {
    /// Session credential.
    pub listen_key: String,
}

// =============================================================================
// Stream Requests
// =============================================================================

/// Subscription control request.
#[derive(Debug, Clone, Serialize)]
pub struct StreamRequest {
    /// `SUBSCRIBE` or `UNSUBSCRIBE`.
    pub method: &'static str,
    /// Stream names.
    pub params: Vec<String>,
    /// Correlation id.
    pub id: u64,
}

impl StreamRequest {
    /// Subscribe to mark prices for `symbols`.
    #[must_use]
    pub fn subscribe(symbols: &[Symbol], id: u64) -> Self {
        Self::new("SUBSCRIBE", symbols, id)
    }

    /// Unsubscribe from mark prices for `symbols`.
    #[must_use]
    pub fn unsubscribe(symbols: &[Symbol], id: u64) -> Self {
        Self::new("UNSUBSCRIBE", symbols, id)
    }

    fn new(method: &'static str, symbols: &[Symbol], id: u64) -> Self {
        Self {
            method,
            params: symbols.iter().map(mark_price_stream).collect(),
            id,
        }
    }
}

/// Stream name for one symbol's mark price.
#[must_use]
pub fn mark_price_stream(symbol: &Symbol) -> String {
    format!("{}@markPrice@1s", symbol.to_stream_case())
}

// =============================================================================
// Stream Frames
// =============================================================================

/// Decoded inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Request acknowledged.
    Ack {
        /// Correlation id.
        id: u64,
    },
    /// Request failed.
    Failure {
        /// Correlation id.
        id: u64,
        /// Venue message.
        message: String,
    },
    /// Market or account event.
    Event(StreamEvent),
    /// The listen key backing this session expired.
    ListenKeyExpired,
    /// Nothing actionable.
    Ignored,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFrame {
    Response {
        id: u64,
        #[serde(default)]
        error: Option<ApiErrorBody>,
    },
    Combined {
        data: Payload,
    },
    Bare(Payload),
}

#[derive(Deserialize)]
#[serde(tag = "e")]
enum Payload {
    #[serde(rename = "markPriceUpdate")]
    MarkPrice(MarkPriceUpdate),
    #[serde(rename = "ACCOUNT_UPDATE")]
    Account(AccountUpdate),
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTrade(OrderTradeUpdate),
    #[serde(rename = "listenKeyExpired")]
    ListenKeyExpired,
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MarkPriceUpdate {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: Decimal,
}

#[derive(Deserialize)]
struct AccountUpdate {
    #[serde(rename = "a")]
    account: AccountData,
}

#[derive(Deserialize)]
struct AccountData {
    #[serde(rename = "m")]
    reason: String,
    #[serde(rename = "P", default)]
    positions: Vec<AccountPosition>,
}

#[derive(Deserialize)]
struct AccountPosition {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "pa")]
    amount: Decimal,
}

#[derive(Deserialize)]
struct OrderTradeUpdate {
    #[serde(rename = "o")]
    order: OrderData,
}

#[derive(Deserialize)]
struct OrderData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "o")]
    order_type: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "ap", default)]
    average_price: Decimal,
}

/// Decode one text frame.
///
/// # Errors
///
/// Returns the JSON error for frames that match no known shape.
pub fn parse_frame(text: &str) -> Result<InboundFrame, serde_json::Error> {
    let frame = match serde_json::from_str::<RawFrame>(text)? {
        RawFrame::Response { id, error: None } => InboundFrame::Ack { id },
        RawFrame::Response {
            id,
            error: Some(error),
        } => InboundFrame::Failure {
            id,
            message: format!("{} ({})", error.msg, error.code),
        },
        RawFrame::Combined { data, .. } | RawFrame::Bare(data) => decode_payload(data),
    };
    Ok(frame)
}

fn decode_payload(payload: Payload) -> InboundFrame {
    match payload {
        Payload::MarkPrice(update) => InboundFrame::Event(StreamEvent::Tick(PriceTick {
            symbol: Symbol::new(update.symbol),
            mark_price: update.mark_price,
            event_time: DateTime::from_timestamp_millis(update.event_time).unwrap_or_else(Utc::now),
        })),
        Payload::Account(update) => InboundFrame::Event(StreamEvent::Account(AccountEvent::BalanceUpdate {
            reason: update.account.reason,
            positions: update
                .account
                .positions
                .into_iter()
                .map(|p| (Symbol::new(p.symbol), p.amount))
                .collect(),
        })),
        Payload::OrderTrade(update) => {
            let side = if update.order.side == "BUY" {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            InboundFrame::Event(StreamEvent::Account(AccountEvent::OrderUpdate {
                symbol: Symbol::new(update.order.symbol),
                side,
                order_type: update.order.order_type,
                status: update.order.status,
                average_price: update.order.average_price,
            }))
        }
        Payload::ListenKeyExpired => InboundFrame::ListenKeyExpired,
        Payload::Other => InboundFrame::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn parses_mark_price_update() {
        let text = r#"{"stream":"btcusdt@markPrice@1s","data":{"e":"markPriceUpdate","E":1562305380000,"s":"BTCUSDT","p":"11794.15000000","i":"11784.62659091","r":"0.00038167","T":1562306400000}}"#;

        let frame = parse_frame(text).unwrap();

        let InboundFrame::Event(StreamEvent::Tick(tick)) = frame else {
            panic!("expected tick, got {frame:?}");
        };
        assert_eq!(tick.symbol, Symbol::new("BTCUSDT"));
        assert_eq!(tick.mark_price, dec!(11794.15));
        assert_eq!(tick.event_time.timestamp_millis(), 1_562_305_380_000);
    }

    #[test]
    fn parses_subscription_ack_and_failure() {
        assert_eq!(parse_frame(r#"{"result":null,"id":7}"#).unwrap(), InboundFrame::Ack { id: 7 });
        assert_eq!(
            parse_frame(r#"{"error":{"code":2,"msg":"Invalid request"},"id":8}"#).unwrap(),
            InboundFrame::Failure {
                id: 8,
                message: "Invalid request (2)".into()
            }
        );
    }

    #[test]
    fn parses_account_update() {
        let text = r#"{"stream":"abc","data":{"e":"ACCOUNT_UPDATE","E":1564745798939,"T":1564745798938,"a":{"m":"ORDER","B":[],"P":[{"s":"BTCUSDT","pa":"0.002","ep":"9000","up":"0","mt":"cross","iw":"0","ps":"BOTH"}]}}}"#;

        let frame = parse_frame(text).unwrap();

        assert_eq!(
            frame,
            InboundFrame::Event(StreamEvent::Account(AccountEvent::BalanceUpdate {
                reason: "ORDER".into(),
                positions: vec![(Symbol::new("BTCUSDT"), dec!(0.002))],
            }))
        );
    }

    #[test]
    fn parses_filled_stop_order() {
        let text = r#"{"stream":"abc","data":{"e":"ORDER_TRADE_UPDATE","E":1568879465651,"T":1568879465650,"o":{"s":"BTCUSDT","c":"x","S":"SELL","o":"STOP_MARKET","f":"GTC","q":"0.001","p":"0","ap":"9638.9","sp":"9640","x":"TRADE","X":"FILLED","i":8886774}}}"#;

        let InboundFrame::Event(StreamEvent::Account(event)) = parse_frame(text).unwrap() else {
            panic!("expected account event");
        };
        assert!(event.is_stop_fill());
    }

    #[test]
    fn recognizes_listen_key_expiry_and_ignores_unknown() {
        assert_eq!(
            parse_frame(r#"{"stream":"abc","data":{"e":"listenKeyExpired","E":1576653824250}}"#).unwrap(),
            InboundFrame::ListenKeyExpired
        );
        assert_eq!(
            parse_frame(r#"{"stream":"abc","data":{"e":"MARGIN_CALL","E":1}}"#).unwrap(),
            InboundFrame::Ignored
        );
        assert!(parse_frame("not json").is_err());
    }

    #[test]
    fn subscription_request_uses_mark_price_streams() {
        let request = StreamRequest::subscribe(&[Symbol::new("BTCUSDT"), Symbol::new("ethusdt")], 3);
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"method":"SUBSCRIBE","params":["btcusdt@markPrice@1s","ethusdt@markPrice@1s"],"id":3}"#
        );
    }

    #[test]
    fn extracts_instrument_filters() {
        let text = r#"{"symbols":[{"symbol":"BTCUSDT","filters":[
            {"filterType":"PRICE_FILTER","minPrice":"556.80","maxPrice":"4529764","tickSize":"0.10"},
            {"filterType":"LOT_SIZE","minQty":"0.001","maxQty":"1000","stepSize":"0.001"},
            {"filterType":"MIN_NOTIONAL","notional":"100"}]}]}"#;

        let info: ExchangeInfo = serde_json::from_str(text).unwrap();
        let filters = info.symbols[0].instrument_filters().unwrap();

        assert_eq!(filters.tick_size, dec!(0.10));
        assert_eq!(filters.step_size, dec!(0.001));
        assert_eq!(filters.max_price, dec!(4529764));
    }

    #[test]
    fn parses_position_risk() {
        let text = r#"[{"symbol":"BTCUSDT","positionAmt":"-0.010","entryPrice":"63000.5","markPrice":"62000","unRealizedProfit":"10.005","positionSide":"BOTH"}]"#;
        let positions: Vec<PositionRisk> = serde_json::from_str(text).unwrap();
        assert_eq!(positions[0].position_amt, dec!(-0.010));
        assert_eq!(positions[0].unrealized_profit, dec!(10.005));
    }
}
