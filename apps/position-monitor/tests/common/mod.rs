//! Fake ports shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use position_monitor::application::ports::{
    ExchangeError, ExchangePort, NotificationSink, OrderRef, PriceStreamPort, Session, SessionCredentialPort,
    SessionId, SessionToken, StopOrderRequest, StreamError,
};
use position_monitor::domain::position::PositionSnapshot;
use position_monitor::domain::symbol::Symbol;

/// Exchange with scripted positions and stop replies. Prices round to one
/// decimal place.
#[derive(Default)]
pub struct FakeExchange {
    positions: Mutex<Option<HashMap<Symbol, PositionSnapshot>>>,
    replies: Mutex<VecDeque<Result<OrderRef, ExchangeError>>>,
    placed: Mutex<Vec<StopOrderRequest>>,
    tokens: AtomicU64,
}

impl FakeExchange {
    pub fn with_positions(snapshots: Vec<PositionSnapshot>) -> Self {
        let exchange = Self::default();
        exchange.set_positions(snapshots);
        exchange
    }

    pub fn set_positions(&self, snapshots: Vec<PositionSnapshot>) {
        *self.positions.lock() = Some(snapshots.into_iter().map(|s| (s.symbol.clone(), s)).collect());
    }

    pub fn fail_fetch(&self) {
        *self.positions.lock() = None;
    }

    pub fn reply_with(&self, reply: Result<OrderRef, ExchangeError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn placed(&self) -> Vec<StopOrderRequest> {
        self.placed.lock().clone()
    }
}

#[async_trait]
impl ExchangePort for FakeExchange {
    async fn fetch_active_positions(&self) -> Result<HashMap<Symbol, PositionSnapshot>, ExchangeError> {
        self.positions.lock().clone().ok_or_else(|| ExchangeError::TransientFetch {
            message: "connection reset".into(),
        })
    }

    async fn quote_mark_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        Err(ExchangeError::UnknownInstrument { symbol: symbol.clone() })
    }

    async fn round_to_tick(&self, _symbol: &Symbol, price: Decimal) -> Result<Decimal, ExchangeError> {
        Ok(price.round_dp(1))
    }

    async fn replace_stop_order(&self, request: &StopOrderRequest) -> Result<OrderRef, ExchangeError> {
        self.placed.lock().push(request.clone());
        self.replies.lock().pop_front().unwrap_or_else(|| {
            Ok(OrderRef {
                order_id: "1".into(),
                client_order_id: "c-1".into(),
                symbol: request.symbol.clone(),
            })
        })
    }

    async fn quantize_quantity(
        &self,
        _symbol: &Symbol,
        notional: Decimal,
        price: Decimal,
    ) -> Result<Decimal, ExchangeError> {
        Ok((notional / price).floor())
    }
}

#[async_trait]
impl SessionCredentialPort for FakeExchange {
    async fn create_session_token(&self) -> Result<SessionToken, ExchangeError> {
        let n = self.tokens.fetch_add(1, Ordering::Relaxed);
        Ok(SessionToken::new(format!("listen-key-{n}")))
    }

    async fn renew_session_token(&self, _token: &SessionToken) -> Result<(), ExchangeError> {
        Ok(())
    }
}

/// Stream that accepts everything and records each call.
#[derive(Default)]
pub struct FakeStream {
    next_session: AtomicU64,
    sessions: Mutex<Vec<SessionId>>,
    subscribe_calls: Mutex<Vec<Vec<Symbol>>>,
    unsubscribe_calls: Mutex<Vec<Vec<Symbol>>>,
}

impl FakeStream {
    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.lock().clone()
    }

    pub fn subscribe_calls(&self) -> Vec<Vec<Symbol>> {
        self.subscribe_calls.lock().clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<Vec<Symbol>> {
        self.unsubscribe_calls.lock().clone()
    }
}

#[async_trait]
impl PriceStreamPort for FakeStream {
    async fn connect(&self, _token: &SessionToken) -> Result<Session, StreamError> {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        self.sessions.lock().push(id);
        Ok(Session::new(id))
    }

    async fn subscribe(&self, symbols: &[Symbol]) -> Result<(), StreamError> {
        self.subscribe_calls.lock().push(symbols.to_vec());
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[Symbol]) -> Result<(), StreamError> {
        self.unsubscribe_calls.lock().push(symbols.to_vec());
        Ok(())
    }

    async fn close(&self, _session: &Session) {}
}

/// Sink that keeps every delivered message.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.delivered.lock().iter().filter(|text| text.contains(needle)).count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, text: &str) {
        self.delivered.lock().push(text.to_string());
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

pub fn snapshot(symbol: &str, size: Decimal, entry: Decimal) -> PositionSnapshot {
    PositionSnapshot::new(Symbol::new(symbol), size, entry, Decimal::ZERO)
}

/// Poll `condition` every 10ms until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
