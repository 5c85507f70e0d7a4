//! Position Monitor Service
//!
//! Owns the position registry and the subscription set and drives them from
//! two contexts:
//!
//! - the refresh loop: scheduled registry refresh, reconciliation, session
//!   lifecycle signals, account-triggered refreshes and the mark-price
//!   fallback while the stream is down;
//! - the tick loop: sequential stop-loss escalation for price ticks.
//!
//! Both take the same state lock around every read-decide-write sequence,
//! including the order replacement itself, so two ticks can never escalate
//! from the same stale stop and ticks for one symbol apply in arrival order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::dispatcher::NotificationDispatcher;
use super::supervisor::{LifecycleSignal, SharedConnectionState};
use super::with_timeout;
use crate::application::ports::{AccountEvent, ExchangePort, PriceStreamPort, PriceTick, StopOrderRequest};
use crate::domain::notification::{Notification, NotificationKind, PositionSummary};
use crate::domain::position::{PositionRegistry, RegistryDiff};
use crate::domain::stop_loss::StopLossPolicy;
use crate::domain::subscription::SubscriptionSet;
use crate::domain::symbol::Symbol;
use crate::error::{Disposition, MonitorError};
use crate::infrastructure::metrics;

/// Configuration for the position monitor service.
#[derive(Debug, Clone)]
pub struct PositionMonitorConfig {
    /// Interval between scheduled registry refreshes.
    pub refresh_interval: Duration,
    /// Timeout applied to every exchange and stream call.
    pub call_timeout: Duration,
    /// Hold-off before retrying a symbol whose stop replacement failed.
    pub retry_cooldown: Duration,
}

impl Default for PositionMonitorConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
            retry_cooldown: Duration::from_secs(30),
        }
    }
}

/// Subscription calls made by one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Symbols confirmed subscribed.
    pub subscribed: Vec<Symbol>,
    /// Symbols confirmed unsubscribed.
    pub unsubscribed: Vec<Symbol>,
    /// Batches that failed and will be retried.
    pub failed_batches: usize,
}

impl ReconcileReport {
    /// Whether the pass changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.subscribed.is_empty() && self.unsubscribed.is_empty() && self.failed_batches == 0
    }
}

/// Result of a successful refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Registry changes.
    pub diff: RegistryDiff,
    /// Subscription changes.
    pub reconcile: ReconcileReport,
    /// Positions tracked after the refresh.
    pub positions: usize,
}

#[derive(Debug, Clone, Copy)]
struct FailedStop {
    stop: Decimal,
    outcome: &'static str,
    at: Instant,
}

#[derive(Debug, Default)]
struct MonitorState {
    registry: PositionRegistry,
    subscriptions: SubscriptionSet,
    failed_stops: HashMap<Symbol, FailedStop>,
    announced: bool,
}

/// Venue-agnostic monitor orchestrating registry, subscriptions and stops.
pub struct PositionMonitorService<E: ExchangePort, S: PriceStreamPort> {
    exchange: Arc<E>,
    stream: Arc<S>,
    policy: StopLossPolicy,
    config: PositionMonitorConfig,
    state: Mutex<MonitorState>,
    dispatcher: Arc<NotificationDispatcher>,
    connection: Arc<SharedConnectionState>,
}

impl<E: ExchangePort, S: PriceStreamPort> PositionMonitorService<E, S> {
    /// Create a new monitor.
    #[must_use]
    pub fn new(
        exchange: Arc<E>,
        stream: Arc<S>,
        policy: StopLossPolicy,
        config: PositionMonitorConfig,
        dispatcher: Arc<NotificationDispatcher>,
        connection: Arc<SharedConnectionState>,
    ) -> Self {
        Self {
            exchange,
            stream,
            policy,
            config,
            state: Mutex::new(MonitorState::default()),
            dispatcher,
            connection,
        }
    }

    // =========================================================================
    // Registry and Subscriptions
    // =========================================================================

    /// Refresh the registry from the exchange and reconcile subscriptions.
    ///
    /// # Errors
    ///
    /// If fetching positions fails the registry and subscriptions are left
    /// untouched and the classified error is returned.
    pub async fn refresh(&self) -> Result<RefreshOutcome, MonitorError> {
        let snapshots = match with_timeout(
            "fetch_active_positions",
            self.config.call_timeout,
            self.exchange.fetch_active_positions(),
        )
        .await
        {
            Ok(snapshots) => snapshots,
            Err(error) => {
                metrics::record_refresh("failed");
                tracing::warn!(error = %error, "Position refresh failed, keeping previous state");
                return Err(error);
            }
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let diff = state.registry.replace(snapshots.into_values(), &self.policy);
        let registry = &state.registry;
        state
            .failed_stops
            .retain(|symbol, _| registry.get(symbol.as_str()).is_some() && !diff.opened.contains(symbol));

        for symbol in &diff.rejected {
            tracing::warn!(symbol = %symbol, "Ignoring malformed position snapshot");
        }

        if !state.announced {
            state.announced = true;
            let positions = state.registry.sorted().into_iter().map(PositionSummary::from).collect();
            self.dispatcher
                .enqueue(Notification::new(NotificationKind::MonitoringStarted { positions }));
        } else if diff.changes_symbols() {
            tracing::info!(opened = ?diff.opened, closed = ?diff.closed, "Tracked positions changed");
            self.dispatcher.enqueue(Notification::new(NotificationKind::PositionsChanged {
                opened: diff.opened.clone(),
                closed: diff.closed.clone(),
            }));
        }

        let reconcile = self.reconcile_locked(state).await;
        let positions = state.registry.len();
        metrics::set_monitored_positions(positions);
        metrics::record_refresh("ok");

        Ok(RefreshOutcome {
            diff,
            reconcile,
            positions,
        })
    }

    /// Bring stream subscriptions in line with the registry.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut guard = self.state.lock().await;
        self.reconcile_locked(&mut guard).await
    }

    async fn reconcile_locked(&self, state: &mut MonitorState) -> ReconcileReport {
        let changes = state.subscriptions.diff(&state.registry.symbols());
        let mut report = ReconcileReport::default();
        if changes.is_empty() {
            return report;
        }

        // Unsubscribe first to bound the number of open streams.
        let remove = changes.to_unsubscribe();
        if !remove.is_empty() {
            match with_timeout("unsubscribe", self.config.call_timeout, self.stream.unsubscribe(&remove)).await {
                Ok(()) => {
                    state.subscriptions.mark_unsubscribed(&remove);
                    tracing::info!(symbols = ?remove, "Unsubscribed mark prices");
                    report.unsubscribed = remove;
                }
                Err(error) => {
                    report.failed_batches += 1;
                    tracing::warn!(error = %error, symbols = ?remove, "Unsubscribe failed, will retry");
                }
            }
        }

        let add = changes.to_subscribe();
        if !add.is_empty() {
            match with_timeout("subscribe", self.config.call_timeout, self.stream.subscribe(&add)).await {
                Ok(()) => {
                    state.subscriptions.mark_subscribed(add.iter().cloned());
                    tracing::info!(symbols = ?add, "Subscribed mark prices");
                    report.subscribed = add;
                }
                Err(error) => {
                    report.failed_batches += 1;
                    tracing::warn!(error = %error, symbols = ?add, "Subscribe failed, will retry");
                }
            }
        }

        metrics::set_subscriptions(state.subscriptions.len());
        report
    }

    // =========================================================================
    // Stop Escalation
    // =========================================================================

    /// Apply one mark price observation.
    ///
    /// Returns the new stop when one was placed. The in-memory stop only
    /// changes after the venue accepted the replacement.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of rounding or replacement. Rejections
    /// have already been alerted on when this returns. A replacement that
    /// times out is reported as [`MonitorError::Unprotected`].
    pub async fn handle_tick(&self, tick: &PriceTick) -> Result<Option<Decimal>, MonitorError> {
        metrics::record_tick_processed();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(position) = state.registry.get(tick.symbol.as_str()) else {
            return Ok(None);
        };
        let side = position.side();
        let entry_price = position.entry_price();
        let previous_stop = position.current_stop_loss();
        let quantity = position.quantity();
        let change_percent = position.price_change_percent(tick.mark_price).unwrap_or_default();

        let Some(candidate) = self
            .policy
            .evaluate(side, entry_price, previous_stop, tick.mark_price)
        else {
            return Ok(None);
        };

        if let Some(failed) = state.failed_stops.get(&tick.symbol)
            && failed.at.elapsed() < self.config.retry_cooldown
        {
            tracing::debug!(symbol = %tick.symbol, "Stop replacement cooling down after failure");
            return Ok(None);
        }

        let stop_price = match with_timeout(
            "round_to_tick",
            self.config.call_timeout,
            self.exchange.round_to_tick(&tick.symbol, candidate),
        )
        .await
        {
            Ok(price) => price,
            Err(error) => {
                metrics::record_stop_update(error_outcome(&error));
                return Err(error);
            }
        };

        let request = StopOrderRequest::new(tick.symbol.clone(), side.closing_side(), stop_price, quantity);
        let started = Instant::now();
        // Dropped mid-replacement: existing stops may already be cancelled.
        let result = match tokio::time::timeout(
            self.config.call_timeout,
            self.exchange.replace_stop_order(&request),
        )
        .await
        {
            Ok(result) => result.map_err(MonitorError::from),
            Err(_) => Err(MonitorError::Unprotected {
                symbol: tick.symbol.clone(),
                reason: "replacement timed out, venue stop state unknown".to_owned(),
            }),
        };
        metrics::record_order_replacement_latency(started.elapsed());

        match result {
            Ok(order) => {
                state.registry.record_stop(tick.symbol.as_str(), candidate);
                state.failed_stops.remove(&tick.symbol);
                metrics::record_stop_update("raised");
                tracing::info!(
                    symbol = %tick.symbol,
                    order_id = %order.order_id,
                    mark_price = %tick.mark_price,
                    previous_stop = %previous_stop,
                    new_stop = %stop_price,
                    "Stop-loss raised"
                );
                self.dispatcher.enqueue(Notification::new(NotificationKind::StopRaised {
                    symbol: tick.symbol.clone(),
                    side,
                    entry_price,
                    mark_price: tick.mark_price,
                    change_percent,
                    previous_stop,
                    new_stop: stop_price,
                }));
                Ok(Some(candidate))
            }
            Err(error) => {
                let outcome = error_outcome(&error);
                metrics::record_stop_update(outcome);
                let repeated = state
                    .failed_stops
                    .get(&tick.symbol)
                    .is_some_and(|failed| failed.stop == candidate && failed.outcome == outcome);
                state.failed_stops.insert(
                    tick.symbol.clone(),
                    FailedStop {
                        stop: candidate,
                        outcome,
                        at: Instant::now(),
                    },
                );

                if !repeated {
                    if let Some(kind) = alert_for(&error, stop_price) {
                        self.dispatcher.enqueue(Notification::new(kind));
                    }
                }
                Err(error)
            }
        }
    }

    /// Record account activity and report whether a refresh is warranted.
    pub fn handle_account_event(&self, event: &AccountEvent) -> bool {
        match event {
            AccountEvent::BalanceUpdate { reason, positions } => {
                tracing::info!(%reason, updates = positions.len(), "Account update received");
                self.dispatcher.enqueue(Notification::new(NotificationKind::AccountActivity {
                    reason: reason.clone(),
                    positions: positions.clone(),
                }));
                true
            }
            AccountEvent::OrderUpdate {
                symbol,
                side,
                average_price,
                ..
            } if event.is_stop_fill() => {
                tracing::warn!(symbol = %symbol, fill_price = %average_price, "Protective stop filled");
                self.dispatcher.enqueue(Notification::new(NotificationKind::StopTriggered {
                    symbol: symbol.clone(),
                    side: *side,
                    fill_price: *average_price,
                }));
                true
            }
            AccountEvent::OrderUpdate {
                symbol, status, ..
            } => {
                tracing::debug!(symbol = %symbol, %status, "Order update");
                false
            }
        }
    }

    /// Quote mark prices over REST and feed them through the tick path.
    ///
    /// Used while the stream is down. Returns how many quotes were applied.
    pub async fn poll_mark_prices(&self) -> usize {
        let symbols: Vec<Symbol> = {
            let state = self.state.lock().await;
            state.registry.sorted().into_iter().map(|p| p.symbol().clone()).collect()
        };

        let mut applied = 0;
        for symbol in symbols {
            let mark_price = match with_timeout(
                "quote_mark_price",
                self.config.call_timeout,
                self.exchange.quote_mark_price(&symbol),
            )
            .await
            {
                Ok(price) => price,
                Err(error) => {
                    tracing::warn!(symbol = %symbol, error = %error, "Mark price fallback quote failed");
                    continue;
                }
            };

            let tick = PriceTick {
                symbol,
                mark_price,
                event_time: Utc::now(),
            };
            if let Err(error) = self.handle_tick(&tick).await {
                log_tick_error(&tick, &error);
            }
            applied += 1;
        }
        applied
    }

    // =========================================================================
    // Session Lifecycle
    // =========================================================================

    async fn on_session_established(&self) {
        {
            let mut state = self.state.lock().await;
            state.subscriptions.clear();
        }
        if self.refresh().await.is_err() {
            self.reconcile().await;
        }
    }

    async fn on_session_lost(&self) {
        let mut state = self.state.lock().await;
        state.subscriptions.clear();
        metrics::set_subscriptions(0);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current stop for `symbol`, if tracked.
    pub async fn current_stop(&self, symbol: &str) -> Option<Decimal> {
        let state = self.state.lock().await;
        state.registry.get(symbol).map(|p| p.current_stop_loss())
    }

    /// Tracked symbols.
    pub async fn tracked_symbols(&self) -> HashSet<Symbol> {
        self.state.lock().await.registry.symbols()
    }

    /// Symbols with confirmed stream subscriptions.
    pub async fn monitored_symbols(&self) -> HashSet<Symbol> {
        self.state.lock().await.subscriptions.symbols()
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Refresh context: the only caller of [`Self::refresh`] in production,
    /// so refreshes never overlap.
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        mut lifecycle: mpsc::Receiver<LifecycleSignal>,
        mut refresh_requests: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) {
        let _ = self.refresh().await;

        let period = self.config.refresh_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Refresh loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let _ = self.refresh().await;
                    if !self.connection.is_live() {
                        let applied = self.poll_mark_prices().await;
                        tracing::debug!(applied, "Applied fallback mark prices while stream is down");
                    }
                }
                Some(signal) = lifecycle.recv() => match signal {
                    LifecycleSignal::SessionEstablished { session, reconnected } => {
                        tracing::info!(%session, reconnected, "Resubscribing for new session");
                        self.on_session_established().await;
                    }
                    LifecycleSignal::SessionLost { session } => {
                        tracing::debug!(%session, "Session lost, subscriptions cleared");
                        self.on_session_lost().await;
                    }
                },
                Some(()) = refresh_requests.recv() => {
                    let _ = self.refresh().await;
                }
            }
        }
    }

    /// Tick context: applies ticks one at a time in arrival order.
    pub async fn run_tick_loop(self: Arc<Self>, mut ticks: mpsc::Receiver<PriceTick>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = ticks.recv() => {
                    let Some(tick) = next else { break };
                    if let Err(error) = self.handle_tick(&tick).await {
                        log_tick_error(&tick, &error);
                    }
                }
            }
        }
        tracing::info!("Tick loop stopped");
    }
}

fn alert_for(error: &MonitorError, stop_price: Decimal) -> Option<NotificationKind> {
    match error {
        MonitorError::OrderRejected { symbol, reason } => Some(NotificationKind::OrderRejected {
            symbol: symbol.clone(),
            stop_price,
            reason: reason.clone(),
        }),
        MonitorError::Unprotected { symbol, reason } => Some(NotificationKind::PositionUnprotected {
            symbol: symbol.clone(),
            stop_price,
            reason: reason.clone(),
        }),
        _ => None,
    }
}

const fn error_outcome(error: &MonitorError) -> &'static str {
    match error {
        MonitorError::OutOfRange { .. } | MonitorError::BelowMinimumSize(_) => "invalid",
        MonitorError::OrderRejected { .. } => "rejected",
        MonitorError::Unprotected { .. } => "unprotected",
        MonitorError::Timeout(_) => "timeout",
        _ => "failed",
    }
}

fn log_tick_error(tick: &PriceTick, error: &MonitorError) {
    match error.disposition() {
        Disposition::Alert | Disposition::Fatal => {
            tracing::error!(symbol = %tick.symbol, mark_price = %tick.mark_price, error = %error, "Stop-loss update failed");
        }
        Disposition::Skip | Disposition::Reconnect => {
            tracing::warn!(symbol = %tick.symbol, mark_price = %tick.mark_price, error = %error, "Stop-loss update skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::application::ports::{ExchangeError, OrderRef, Session, SessionId, SessionToken, StreamError};
    use crate::application::services::dispatcher::DispatcherConfig;
    use crate::domain::position::{OrderSide, PositionSnapshot};

    #[derive(Default)]
    struct FakeExchange {
        positions: SyncMutex<Option<HashMap<Symbol, PositionSnapshot>>>,
        marks: SyncMutex<HashMap<Symbol, Decimal>>,
        replies: SyncMutex<VecDeque<Result<OrderRef, ExchangeError>>>,
        placed: SyncMutex<Vec<StopOrderRequest>>,
        replace_delay: SyncMutex<Duration>,
    }

    impl FakeExchange {
        fn with_positions(snapshots: Vec<PositionSnapshot>) -> Self {
            let exchange = Self::default();
            exchange.set_positions(snapshots);
            exchange
        }

        fn set_positions(&self, snapshots: Vec<PositionSnapshot>) {
            *self.positions.lock() = Some(snapshots.into_iter().map(|s| (s.symbol.clone(), s)).collect());
        }

        fn fail_fetch(&self) {
            *self.positions.lock() = None;
        }

        fn reply_with(&self, reply: Result<OrderRef, ExchangeError>) {
            self.replies.lock().push_back(reply);
        }

        fn placed(&self) -> Vec<StopOrderRequest> {
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
            self.marks
                .lock()
                .get(symbol)
                .copied()
                .ok_or_else(|| ExchangeError::UnknownInstrument { symbol: symbol.clone() })
        }

        async fn round_to_tick(&self, _symbol: &Symbol, price: Decimal) -> Result<Decimal, ExchangeError> {
            Ok(price.round_dp(1))
        }

        async fn replace_stop_order(&self, request: &StopOrderRequest) -> Result<OrderRef, ExchangeError> {
            self.placed.lock().push(request.clone());
            let delay = *self.replace_delay.lock();
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
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

    #[derive(Default)]
    struct FakeStream {
        subscribe_calls: SyncMutex<Vec<Vec<Symbol>>>,
        unsubscribe_calls: SyncMutex<Vec<Vec<Symbol>>>,
        reject_subscribe: SyncMutex<bool>,
    }

    #[async_trait]
    impl PriceStreamPort for FakeStream {
        async fn connect(&self, _token: &SessionToken) -> Result<Session, StreamError> {
            Ok(Session::new(SessionId(1)))
        }

        async fn subscribe(&self, symbols: &[Symbol]) -> Result<(), StreamError> {
            self.subscribe_calls.lock().push(symbols.to_vec());
            if *self.reject_subscribe.lock() {
                return Err(StreamError::Rejected("invalid request".into()));
            }
            Ok(())
        }

        async fn unsubscribe(&self, symbols: &[Symbol]) -> Result<(), StreamError> {
            self.unsubscribe_calls.lock().push(symbols.to_vec());
            Ok(())
        }

        async fn close(&self, _session: &Session) {}
    }

    struct Harness {
        exchange: Arc<FakeExchange>,
        stream: Arc<FakeStream>,
        dispatcher: Arc<NotificationDispatcher>,
        monitor: PositionMonitorService<FakeExchange, FakeStream>,
    }

    fn harness(snapshots: Vec<PositionSnapshot>, retry_cooldown: Duration) -> Harness {
        harness_with(
            snapshots,
            PositionMonitorConfig {
                retry_cooldown,
                ..PositionMonitorConfig::default()
            },
        )
    }

    fn harness_with(snapshots: Vec<PositionSnapshot>, config: PositionMonitorConfig) -> Harness {
        let exchange = Arc::new(FakeExchange::with_positions(snapshots));
        let stream = Arc::new(FakeStream::default());
        let dispatcher = Arc::new(NotificationDispatcher::new(DispatcherConfig::default()));
        let monitor = PositionMonitorService::new(
            Arc::clone(&exchange),
            Arc::clone(&stream),
            StopLossPolicy::reference(),
            config,
            Arc::clone(&dispatcher),
            Arc::new(SharedConnectionState::new()),
        );
        Harness {
            exchange,
            stream,
            dispatcher,
            monitor,
        }
    }

    fn snapshot(symbol: &str, size: Decimal, entry: Decimal) -> PositionSnapshot {
        PositionSnapshot::new(Symbol::new(symbol), size, entry, Decimal::ZERO)
    }

    fn tick(symbol: &str, price: Decimal) -> PriceTick {
        PriceTick {
            symbol: Symbol::new(symbol),
            mark_price: price,
            event_time: Utc::now(),
        }
    }

    fn labels(dispatcher: &NotificationDispatcher) -> Vec<&'static str> {
        std::iter::from_fn(|| dispatcher.pop()).map(|n| n.label()).collect()
    }

    #[tokio::test]
    async fn first_refresh_seeds_subscribes_and_announces() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(2), dec!(100))], Duration::ZERO);

        let outcome = h.monitor.refresh().await.unwrap();

        assert_eq!(outcome.positions, 1);
        assert_eq!(outcome.reconcile.subscribed, vec![Symbol::new("BTCUSDT")]);
        assert_eq!(h.monitor.current_stop("BTCUSDT").await, Some(dec!(95.00)));
        assert!(h.monitor.monitored_symbols().await.contains("BTCUSDT"));
        assert_eq!(labels(&h.dispatcher), vec!["monitoring_started"]);
    }

    #[tokio::test]
    async fn refresh_failure_leaves_state_untouched() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(2), dec!(100))], Duration::ZERO);
        h.monitor.refresh().await.unwrap();
        h.exchange.fail_fetch();

        let result = h.monitor.refresh().await;

        assert!(matches!(result, Err(MonitorError::TransientFetch(_))));
        assert!(h.monitor.tracked_symbols().await.contains("BTCUSDT"));
        assert!(h.monitor.monitored_symbols().await.contains("BTCUSDT"));
        assert!(h.stream.unsubscribe_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let h = harness(
            vec![snapshot("BTCUSDT", dec!(1), dec!(100)), snapshot("ETHUSDT", dec!(3), dec!(50))],
            Duration::ZERO,
        );
        h.monitor.refresh().await.unwrap();

        let second = h.monitor.reconcile().await;

        assert!(second.is_noop());
        assert_eq!(h.stream.subscribe_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn closed_positions_are_unsubscribed_and_announced() {
        let h = harness(
            vec![snapshot("BTCUSDT", dec!(1), dec!(100)), snapshot("ETHUSDT", dec!(3), dec!(50))],
            Duration::ZERO,
        );
        h.monitor.refresh().await.unwrap();
        let _ = labels(&h.dispatcher);
        h.exchange.set_positions(vec![snapshot("BTCUSDT", dec!(1), dec!(100))]);

        let outcome = h.monitor.refresh().await.unwrap();

        assert_eq!(outcome.diff.closed, vec![Symbol::new("ETHUSDT")]);
        assert_eq!(outcome.reconcile.unsubscribed, vec![Symbol::new("ETHUSDT")]);
        assert!(!h.monitor.monitored_symbols().await.contains("ETHUSDT"));
        assert_eq!(labels(&h.dispatcher), vec!["positions_changed"]);
    }

    #[tokio::test]
    async fn failed_subscribe_is_retried_on_next_pass() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(1), dec!(100))], Duration::ZERO);
        *h.stream.reject_subscribe.lock() = true;

        let first = h.monitor.refresh().await.unwrap();
        assert_eq!(first.reconcile.failed_batches, 1);
        assert!(h.monitor.monitored_symbols().await.is_empty());

        *h.stream.reject_subscribe.lock() = false;
        let second = h.monitor.reconcile().await;

        assert_eq!(second.subscribed, vec![Symbol::new("BTCUSDT")]);
        assert_eq!(h.stream.subscribe_calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn long_position_escalates_through_tiers() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(2), dec!(100))], Duration::ZERO);
        h.monitor.refresh().await.unwrap();

        assert_eq!(h.monitor.handle_tick(&tick("BTCUSDT", dec!(109))).await.unwrap(), None);
        assert_eq!(
            h.monitor.handle_tick(&tick("BTCUSDT", dec!(111))).await.unwrap(),
            Some(dec!(105.00))
        );
        assert_eq!(h.monitor.handle_tick(&tick("BTCUSDT", dec!(108))).await.unwrap(), None);
        assert_eq!(
            h.monitor.handle_tick(&tick("BTCUSDT", dec!(121))).await.unwrap(),
            Some(dec!(110.00))
        );

        let placed = h.exchange.placed();
        assert_eq!(placed.len(), 2);
        assert!(placed.iter().all(|r| r.side == OrderSide::Sell && r.quantity == dec!(2)));
        assert_eq!(h.monitor.current_stop("BTCUSDT").await, Some(dec!(110.00)));
    }

    #[tokio::test]
    async fn rejection_keeps_stop_and_alerts_once() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(1), dec!(100))], Duration::ZERO);
        h.monitor.refresh().await.unwrap();
        let _ = labels(&h.dispatcher);
        let rejected = || {
            Err(ExchangeError::OrderRejected {
                symbol: Symbol::new("BTCUSDT"),
                reason: "would immediately trigger".into(),
            })
        };
        h.exchange.reply_with(rejected());
        h.exchange.reply_with(rejected());

        let first = h.monitor.handle_tick(&tick("BTCUSDT", dec!(111))).await;
        let second = h.monitor.handle_tick(&tick("BTCUSDT", dec!(112))).await;

        assert!(matches!(first, Err(MonitorError::OrderRejected { .. })));
        assert!(matches!(second, Err(MonitorError::OrderRejected { .. })));
        assert_eq!(h.monitor.current_stop("BTCUSDT").await, Some(dec!(95.00)));
        assert_eq!(labels(&h.dispatcher), vec!["order_rejected"]);
    }

    #[tokio::test]
    async fn cooldown_holds_off_retries() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(1), dec!(100))], Duration::from_secs(300));
        h.monitor.refresh().await.unwrap();
        h.exchange.reply_with(Err(ExchangeError::OrderRejected {
            symbol: Symbol::new("BTCUSDT"),
            reason: "rejected".into(),
        }));

        let _ = h.monitor.handle_tick(&tick("BTCUSDT", dec!(111))).await;
        let retried = h.monitor.handle_tick(&tick("BTCUSDT", dec!(125))).await.unwrap();

        assert_eq!(retried, None);
        assert_eq!(h.exchange.placed().len(), 1);
    }

    #[tokio::test]
    async fn removed_stop_raises_unprotected_alert() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(1), dec!(100))], Duration::ZERO);
        h.monitor.refresh().await.unwrap();
        let _ = labels(&h.dispatcher);
        h.exchange.reply_with(Err(ExchangeError::StopRemoved {
            symbol: Symbol::new("BTCUSDT"),
            reason: "margin insufficient".into(),
        }));

        let result = h.monitor.handle_tick(&tick("BTCUSDT", dec!(111))).await;

        assert!(matches!(result, Err(MonitorError::Unprotected { .. })));
        assert_eq!(labels(&h.dispatcher), vec!["position_unprotected"]);
    }

    #[tokio::test]
    async fn replacement_timeout_raises_unprotected_alert() {
        let h = harness_with(
            vec![snapshot("BTCUSDT", dec!(1), dec!(100))],
            PositionMonitorConfig {
                call_timeout: Duration::from_millis(20),
                retry_cooldown: Duration::ZERO,
                ..PositionMonitorConfig::default()
            },
        );
        h.monitor.refresh().await.unwrap();
        let _ = labels(&h.dispatcher);
        *h.exchange.replace_delay.lock() = Duration::from_millis(500);

        let error = h.monitor.handle_tick(&tick("BTCUSDT", dec!(111))).await.unwrap_err();

        assert!(matches!(error, MonitorError::Unprotected { .. }));
        assert_eq!(error.disposition(), Disposition::Alert);
        assert_eq!(h.monitor.current_stop("BTCUSDT").await, Some(dec!(95.00)));
        assert_eq!(labels(&h.dispatcher), vec!["position_unprotected"]);
    }

    #[tokio::test]
    async fn removed_stop_after_rejection_still_alerts() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(1), dec!(100))], Duration::ZERO);
        h.monitor.refresh().await.unwrap();
        let _ = labels(&h.dispatcher);
        h.exchange.reply_with(Err(ExchangeError::OrderRejected {
            symbol: Symbol::new("BTCUSDT"),
            reason: "cancel rejected: unknown order".into(),
        }));
        h.exchange.reply_with(Err(ExchangeError::StopRemoved {
            symbol: Symbol::new("BTCUSDT"),
            reason: "margin insufficient".into(),
        }));

        let first = h.monitor.handle_tick(&tick("BTCUSDT", dec!(111))).await;
        let second = h.monitor.handle_tick(&tick("BTCUSDT", dec!(112))).await;

        assert!(matches!(first, Err(MonitorError::OrderRejected { .. })));
        assert!(matches!(second, Err(MonitorError::Unprotected { .. })));
        assert_eq!(labels(&h.dispatcher), vec!["order_rejected", "position_unprotected"]);
    }

    #[tokio::test]
    async fn concurrent_ticks_never_escalate_from_a_stale_stop() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(2), dec!(100))], Duration::ZERO);
        h.monitor.refresh().await.unwrap();

        let high = tick("BTCUSDT", dec!(121));
        let low = tick("BTCUSDT", dec!(111));
        let (first, second) = tokio::join!(h.monitor.handle_tick(&high), h.monitor.handle_tick(&low));

        assert_eq!(first.unwrap(), Some(dec!(110.00)));
        assert_eq!(second.unwrap(), None);
        let stops: Vec<Decimal> = h.exchange.placed().iter().map(|r| r.stop_price).collect();
        assert_eq!(stops, vec![dec!(110.0)]);
        assert_eq!(h.monitor.current_stop("BTCUSDT").await, Some(dec!(110.00)));
    }

    #[tokio::test]
    async fn concurrent_ticks_apply_in_arrival_order() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(2), dec!(100))], Duration::ZERO);
        h.monitor.refresh().await.unwrap();

        let low = tick("BTCUSDT", dec!(111));
        let high = tick("BTCUSDT", dec!(121));
        let (first, second) = tokio::join!(h.monitor.handle_tick(&low), h.monitor.handle_tick(&high));

        assert_eq!(first.unwrap(), Some(dec!(105.00)));
        assert_eq!(second.unwrap(), Some(dec!(110.00)));
        let stops: Vec<Decimal> = h.exchange.placed().iter().map(|r| r.stop_price).collect();
        assert_eq!(stops, vec![dec!(105.0), dec!(110.0)]);
        assert_eq!(h.monitor.current_stop("BTCUSDT").await, Some(dec!(110.00)));
    }

    #[tokio::test]
    async fn ticks_for_untracked_symbols_are_ignored() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(1), dec!(100))], Duration::ZERO);
        h.monitor.refresh().await.unwrap();

        let result = h.monitor.handle_tick(&tick("SOLUSDT", dec!(500))).await.unwrap();

        assert_eq!(result, None);
        assert!(h.exchange.placed().is_empty());
    }

    #[tokio::test]
    async fn short_position_places_buy_stop_below_seed() {
        let h = harness(vec![snapshot("ETHUSDT", dec!(-4), dec!(100))], Duration::ZERO);
        h.monitor.refresh().await.unwrap();
        assert_eq!(h.monitor.current_stop("ETHUSDT").await, Some(dec!(105.00)));

        let raised = h.monitor.handle_tick(&tick("ETHUSDT", dec!(89))).await.unwrap();

        assert_eq!(raised, Some(dec!(95.00)));
        let placed = h.exchange.placed();
        assert_eq!(placed[0].side, OrderSide::Buy);
        assert_eq!(placed[0].quantity, dec!(4));
    }

    #[tokio::test]
    async fn stop_fill_requests_refresh_and_alerts() {
        let h = harness(Vec::new(), Duration::ZERO);
        let fill = AccountEvent::OrderUpdate {
            symbol: Symbol::new("BTCUSDT"),
            side: OrderSide::Sell,
            order_type: "STOP_MARKET".into(),
            status: "FILLED".into(),
            average_price: dec!(104.9),
        };
        let fill_is_new = AccountEvent::OrderUpdate {
            symbol: Symbol::new("BTCUSDT"),
            side: OrderSide::Sell,
            order_type: "STOP_MARKET".into(),
            status: "NEW".into(),
            average_price: Decimal::ZERO,
        };

        assert!(h.monitor.handle_account_event(&fill));
        assert!(!h.monitor.handle_account_event(&fill_is_new));
        assert_eq!(labels(&h.dispatcher), vec!["stop_triggered"]);
    }

    #[tokio::test]
    async fn session_changes_resubscribe_everything() {
        let h = harness(vec![snapshot("BTCUSDT", dec!(1), dec!(100))], Duration::ZERO);
        h.monitor.refresh().await.unwrap();

        h.monitor.on_session_lost().await;
        assert!(h.monitor.monitored_symbols().await.is_empty());

        h.monitor.on_session_established().await;
        assert!(h.monitor.monitored_symbols().await.contains("BTCUSDT"));
        assert_eq!(h.stream.subscribe_calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn fallback_quotes_feed_the_tick_path() {
        let h = harness(
            vec![snapshot("BTCUSDT", dec!(1), dec!(100)), snapshot("ETHUSDT", dec!(1), dec!(100))],
            Duration::ZERO,
        );
        h.monitor.refresh().await.unwrap();
        h.exchange.marks.lock().insert(Symbol::new("BTCUSDT"), dec!(115));

        let applied = h.monitor.poll_mark_prices().await;

        assert_eq!(applied, 1);
        assert_eq!(h.monitor.current_stop("BTCUSDT").await, Some(dec!(105.00)));
        assert_eq!(h.monitor.current_stop("ETHUSDT").await, Some(dec!(95.00)));
    }
}
