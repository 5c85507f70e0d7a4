//! Stream event router.
//!
//! The transport pushes every inbound frame into one channel. The router
//! fans those events out to the context that owns each kind: ticks to the
//! tick loop, session events to the supervisor, account activity to the
//! monitor. Any inbound traffic counts as liveness for the heartbeat.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::heartbeat::HeartbeatState;
use super::monitor::PositionMonitorService;
use crate::application::ports::{ExchangePort, PriceStreamPort, PriceTick, SessionEvent, StreamEvent};
use crate::infrastructure::metrics;

/// Destinations for routed events.
#[derive(Debug, Clone)]
pub struct RouterChannels {
    /// Tick loop input.
    pub ticks: mpsc::Sender<PriceTick>,
    /// Supervisor session events.
    pub session_events: mpsc::Sender<SessionEvent>,
    /// Refresh requests; capacity 1 so bursts coalesce.
    pub refresh_requests: mpsc::Sender<()>,
}

/// Routes transport events to their owners.
pub struct EventRouter<E: ExchangePort, S: PriceStreamPort> {
    monitor: Arc<PositionMonitorService<E, S>>,
    heartbeat: Arc<HeartbeatState>,
    channels: RouterChannels,
}

impl<E: ExchangePort, S: PriceStreamPort> EventRouter<E, S> {
    /// Create a router.
    #[must_use]
    pub const fn new(
        monitor: Arc<PositionMonitorService<E, S>>,
        heartbeat: Arc<HeartbeatState>,
        channels: RouterChannels,
    ) -> Self {
        Self {
            monitor,
            heartbeat,
            channels,
        }
    }

    /// Consume events until cancelled or the transport drops its sender.
    pub async fn run(self, mut events: mpsc::Receiver<StreamEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = events.recv() => {
                    let Some(event) = next else {
                        tracing::warn!("Stream event channel closed");
                        break;
                    };
                    self.route(event);
                }
            }
        }
        tracing::info!("Event router stopped");
    }

    fn route(&self, event: StreamEvent) {
        self.heartbeat.record_activity();

        match event {
            StreamEvent::Tick(tick) => {
                metrics::record_tick_received();
                match self.channels.ticks.try_send(tick) {
                    Ok(()) => {}
                    Err(TrySendError::Full(tick)) => {
                        metrics::record_tick_dropped();
                        tracing::debug!(symbol = %tick.symbol, "Tick queue full, dropping tick");
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!("Tick loop gone, dropping tick");
                    }
                }
            }
            StreamEvent::Session(event) => {
                if let Err(error) = self.channels.session_events.try_send(event) {
                    tracing::warn!(error = %error, "Could not forward session event");
                }
            }
            StreamEvent::Account(event) => {
                if self.monitor.handle_account_event(&event) {
                    // A pending request already covers this one.
                    let _ = self.channels.refresh_requests.try_send(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::application::ports::{
        AccountEvent, ExchangeError, OrderRef, Session, SessionEventKind, SessionId, SessionToken,
        StopOrderRequest, StreamError,
    };
    use crate::application::services::dispatcher::{DispatcherConfig, NotificationDispatcher};
    use crate::application::services::monitor::PositionMonitorConfig;
    use crate::application::services::supervisor::SharedConnectionState;
    use crate::domain::position::PositionSnapshot;
    use crate::domain::stop_loss::StopLossPolicy;
    use crate::domain::symbol::Symbol;

    struct IdleExchange;

    #[async_trait]
    impl ExchangePort for IdleExchange {
        async fn fetch_active_positions(&self) -> Result<HashMap<Symbol, PositionSnapshot>, ExchangeError> {
            Ok(HashMap::new())
        }

        async fn quote_mark_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
            Err(ExchangeError::UnknownInstrument { symbol: symbol.clone() })
        }

        async fn round_to_tick(&self, _symbol: &Symbol, price: Decimal) -> Result<Decimal, ExchangeError> {
            Ok(price)
        }

        async fn replace_stop_order(&self, request: &StopOrderRequest) -> Result<OrderRef, ExchangeError> {
            Err(ExchangeError::OrderRejected {
                symbol: request.symbol.clone(),
                reason: "unused".into(),
            })
        }

        async fn quantize_quantity(
            &self,
            _symbol: &Symbol,
            notional: Decimal,
            _price: Decimal,
        ) -> Result<Decimal, ExchangeError> {
            Ok(notional)
        }
    }

    struct IdleStream;

    #[async_trait]
    impl PriceStreamPort for IdleStream {
        async fn connect(&self, _token: &SessionToken) -> Result<Session, StreamError> {
            Ok(Session::new(SessionId(1)))
        }

        async fn subscribe(&self, _symbols: &[Symbol]) -> Result<(), StreamError> {
            Ok(())
        }

        async fn unsubscribe(&self, _symbols: &[Symbol]) -> Result<(), StreamError> {
            Ok(())
        }

        async fn close(&self, _session: &Session) {}
    }

    struct Fixture {
        router: EventRouter<IdleExchange, IdleStream>,
        heartbeat: Arc<HeartbeatState>,
        ticks: mpsc::Receiver<PriceTick>,
        session_events: mpsc::Receiver<SessionEvent>,
        refresh_requests: mpsc::Receiver<()>,
    }

    fn fixture(tick_capacity: usize) -> Fixture {
        let monitor = Arc::new(PositionMonitorService::new(
            Arc::new(IdleExchange),
            Arc::new(IdleStream),
            StopLossPolicy::reference(),
            PositionMonitorConfig::default(),
            Arc::new(NotificationDispatcher::new(DispatcherConfig::default())),
            Arc::new(SharedConnectionState::new()),
        ));
        let heartbeat = Arc::new(HeartbeatState::new());
        let (ticks_tx, ticks) = mpsc::channel(tick_capacity);
        let (session_tx, session_events) = mpsc::channel(8);
        let (refresh_tx, refresh_requests) = mpsc::channel(1);
        let router = EventRouter::new(
            monitor,
            Arc::clone(&heartbeat),
            RouterChannels {
                ticks: ticks_tx,
                session_events: session_tx,
                refresh_requests: refresh_tx,
            },
        );
        Fixture {
            router,
            heartbeat,
            ticks,
            session_events,
            refresh_requests,
        }
    }

    fn tick(price: Decimal) -> StreamEvent {
        StreamEvent::Tick(PriceTick {
            symbol: Symbol::new("BTCUSDT"),
            mark_price: price,
            event_time: Utc::now(),
        })
    }

    #[tokio::test]
    async fn ticks_and_session_events_reach_their_owners() {
        let mut f = fixture(4);

        f.router.route(tick(dec!(101)));
        f.router.route(StreamEvent::Session(SessionEvent {
            session: SessionId(3),
            kind: SessionEventKind::Pong,
        }));

        assert_eq!(f.ticks.recv().await.map(|t| t.mark_price), Some(dec!(101)));
        assert_eq!(f.session_events.recv().await.map(|e| e.session), Some(SessionId(3)));
    }

    #[tokio::test]
    async fn full_tick_queue_drops_newest() {
        let mut f = fixture(1);

        f.router.route(tick(dec!(101)));
        f.router.route(tick(dec!(102)));

        assert_eq!(f.ticks.recv().await.map(|t| t.mark_price), Some(dec!(101)));
        assert!(f.ticks.try_recv().is_err());
    }

    #[tokio::test]
    async fn account_updates_coalesce_refresh_requests() {
        let mut f = fixture(4);
        let update = || {
            StreamEvent::Account(AccountEvent::BalanceUpdate {
                reason: "ORDER".into(),
                positions: vec![(Symbol::new("BTCUSDT"), dec!(1))],
            })
        };

        f.router.route(update());
        f.router.route(update());

        assert!(f.refresh_requests.try_recv().is_ok());
        assert!(f.refresh_requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn any_event_counts_as_activity() {
        let f = fixture(4);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let silent_before = f.heartbeat.time_since_activity();

        f.router.route(tick(dec!(100)));

        assert!(silent_before >= Duration::from_millis(30));
        assert!(f.heartbeat.time_since_activity() < silent_before);
    }
}
