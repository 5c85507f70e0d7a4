//! Binance implementation of the exchange and credential ports.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::error::BinanceError;
use super::instruments::InstrumentCatalog;
use super::messages::{ExchangeInfo, ListenKeyResponse, OpenOrder, OrderResponse, PositionRisk, PremiumIndex};
use super::rest::BinanceRestClient;
use crate::application::ports::{
    ExchangeError, ExchangePort, OrderRef, SessionCredentialPort, SessionToken, StopOrderRequest,
};
use crate::domain::instrument::{FilterError, InstrumentFilters};
use crate::domain::position::{PositionSide, PositionSnapshot};
use crate::domain::symbol::Symbol;

const POSITION_RISK: &str = "/fapi/v2/positionRisk";
const PREMIUM_INDEX: &str = "/fapi/v1/premiumIndex";
const EXCHANGE_INFO: &str = "/fapi/v1/exchangeInfo";
const OPEN_ORDERS: &str = "/fapi/v1/openOrders";
const ORDER: &str = "/fapi/v1/order";
const LISTEN_KEY: &str = "/fapi/v1/listenKey";

/// Exchange and credential adapter for Binance USDT-M futures.
#[derive(Debug)]
pub struct BinanceAdapter {
    rest: BinanceRestClient,
    catalog: InstrumentCatalog,
}

impl BinanceAdapter {
    /// Create an adapter over `rest`.
    #[must_use]
    pub fn new(rest: BinanceRestClient) -> Self {
        Self {
            rest,
            catalog: InstrumentCatalog::new(),
        }
    }

    /// Load instrument filters from `exchangeInfo`.
    ///
    /// # Errors
    ///
    /// Returns the request failure.
    pub async fn load_instruments(&self) -> Result<usize, BinanceError> {
        let info: ExchangeInfo = self.rest.public(EXCHANGE_INFO, &[]).await?;
        let count = self.catalog.load(&info);
        tracing::info!(instruments = count, "Loaded instrument filters");
        Ok(count)
    }

    async fn filters(&self, symbol: &Symbol) -> Result<InstrumentFilters, ExchangeError> {
        if let Some(filters) = self.catalog.get(symbol) {
            return Ok(filters);
        }
        self.load_instruments().await?;
        self.catalog
            .get(symbol)
            .ok_or_else(|| ExchangeError::UnknownInstrument { symbol: symbol.clone() })
    }

    async fn open_stop_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<OpenOrder>, BinanceError> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", s.as_str().to_string())])
            .unwrap_or_default();
        let orders: Vec<OpenOrder> = self.rest.signed(Method::GET, OPEN_ORDERS, &params).await?;
        Ok(orders.into_iter().filter(OpenOrder::is_stop).collect())
    }

    async fn cancel_order(&self, order: &OpenOrder) -> Result<(), BinanceError> {
        let params = [
            ("symbol", order.symbol.clone()),
            ("orderId", order.order_id.to_string()),
        ];
        let _: serde_json::Value = self.rest.signed(Method::DELETE, ORDER, &params).await?;
        Ok(())
    }

    async fn place_stop(&self, request: &StopOrderRequest, client_order_id: &str) -> Result<OrderResponse, BinanceError> {
        let params = [
            ("symbol", request.symbol.as_str().to_string()),
            ("side", request.side.as_str().to_string()),
            ("type", "STOP_MARKET".to_string()),
            ("stopPrice", request.stop_price.normalize().to_string()),
            ("quantity", request.quantity.normalize().to_string()),
            ("reduceOnly", "true".to_string()),
            ("workingType", "MARK_PRICE".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("newClientOrderId", client_order_id.to_string()),
        ];
        self.rest.signed(Method::POST, ORDER, &params).await
    }
}

/// Attach each position's existing protective stop, if the venue has one.
fn attach_venue_stops(positions: &mut HashMap<Symbol, PositionSnapshot>, stops: &[OpenOrder]) {
    for snapshot in positions.values_mut() {
        let Some(side) = snapshot.side() else { continue };
        let closing = side.closing_side().as_str();
        let best = stops
            .iter()
            .filter(|o| o.symbol == snapshot.symbol.as_str() && o.side == closing && o.stop_price > Decimal::ZERO)
            .map(|o| o.stop_price)
            .reduce(|a, b| match side {
                PositionSide::Long => a.max(b),
                PositionSide::Short => a.min(b),
            });
        if let Some(stop) = best {
            snapshot.venue_stop_loss = Some(stop);
        }
    }
}

fn filter_error(symbol: &Symbol, error: FilterError) -> ExchangeError {
    match error {
        FilterError::OutOfRange { price, .. } | FilterError::InvalidPrice(price) => ExchangeError::OutOfRange {
            symbol: symbol.clone(),
            price,
        },
        FilterError::BelowMinimumSize { quantity, min } => ExchangeError::BelowMinimumSize {
            symbol: symbol.clone(),
            quantity,
            min,
        },
    }
}

#[async_trait]
impl ExchangePort for BinanceAdapter {
    async fn fetch_active_positions(&self) -> Result<HashMap<Symbol, PositionSnapshot>, ExchangeError> {
        let risks: Vec<PositionRisk> = self.rest.signed(Method::GET, POSITION_RISK, &[]).await?;

        let mut positions = HashMap::new();
        for risk in risks.into_iter().filter(|r| !r.position_amt.is_zero()) {
            let symbol = Symbol::new(risk.symbol);
            if positions.contains_key(&symbol) {
                tracing::warn!(symbol = %symbol, "Multiple open legs for symbol, keeping the first");
                continue;
            }
            let snapshot = PositionSnapshot::new(
                symbol.clone(),
                risk.position_amt,
                risk.entry_price,
                risk.unrealized_profit,
            );
            positions.insert(symbol, snapshot);
        }

        if !positions.is_empty() {
            let stops = self.open_stop_orders(None).await?;
            attach_venue_stops(&mut positions, &stops);
        }

        tracing::debug!(positions = positions.len(), "Fetched active positions");
        Ok(positions)
    }

    async fn quote_mark_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        let index: PremiumIndex = self
            .rest
            .public(PREMIUM_INDEX, &[("symbol", symbol.as_str().to_string())])
            .await?;
        Ok(index.mark_price)
    }

    async fn round_to_tick(&self, symbol: &Symbol, price: Decimal) -> Result<Decimal, ExchangeError> {
        let filters = self.filters(symbol).await?;
        filters.round_price(price).map_err(|e| filter_error(symbol, e))
    }

    async fn replace_stop_order(&self, request: &StopOrderRequest) -> Result<OrderRef, ExchangeError> {
        let symbol = &request.symbol;
        let existing = self.open_stop_orders(Some(symbol)).await?;

        let mut cancelled = 0_usize;
        for order in &existing {
            if let Err(error) = self.cancel_order(order).await {
                tracing::error!(symbol = %symbol, order_id = order.order_id, error = %error, "Failed to cancel stop order");
                return Err(if cancelled > 0 {
                    ExchangeError::StopRemoved {
                        symbol: symbol.clone(),
                        reason: format!("cancel failed after removing {cancelled} stop(s): {}", error.reason()),
                    }
                } else if error.is_rejection() {
                    ExchangeError::OrderRejected {
                        symbol: symbol.clone(),
                        reason: format!("cancel rejected: {}", error.reason()),
                    }
                } else {
                    error.into()
                });
            }
            cancelled += 1;
        }

        let client_order_id = Uuid::new_v4().to_string();
        match self.place_stop(request, &client_order_id).await {
            Ok(order) => {
                tracing::info!(
                    symbol = %symbol,
                    order_id = order.order_id,
                    stop_price = %request.stop_price,
                    replaced = cancelled,
                    "Placed stop order"
                );
                Ok(OrderRef {
                    order_id: order.order_id.to_string(),
                    client_order_id: order.client_order_id,
                    symbol: Symbol::new(order.symbol),
                })
            }
            Err(error) if cancelled > 0 => Err(ExchangeError::StopRemoved {
                symbol: symbol.clone(),
                reason: error.reason(),
            }),
            Err(error) if error.is_rejection() => Err(ExchangeError::OrderRejected {
                symbol: symbol.clone(),
                reason: error.reason(),
            }),
            Err(error) => Err(error.into()),
        }
    }

    async fn quantize_quantity(
        &self,
        symbol: &Symbol,
        notional: Decimal,
        price: Decimal,
    ) -> Result<Decimal, ExchangeError> {
        let filters = self.filters(symbol).await?;
        filters
            .quantize_quantity(notional, price)
            .map_err(|e| filter_error(symbol, e))
    }
}

#[async_trait]
impl SessionCredentialPort for BinanceAdapter {
    async fn create_session_token(&self) -> Result<SessionToken, ExchangeError> {
        let response: ListenKeyResponse = self.rest.keyed(Method::POST, LISTEN_KEY).await?;
        Ok(SessionToken::new(response.listen_key))
    }

    async fn renew_session_token(&self, _token: &SessionToken) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self.rest.keyed(Method::PUT, LISTEN_KEY).await?;
        Ok(())
    }
}
