//! Connection Supervisor
//!
//! Owns the stream session lifecycle: connects with the current session
//! credential, watches liveness, reconnects with exponential backoff and
//! gives up after too many consecutive failures.
//!
//! # Notifications
//!
//! One `StreamDisconnected` is queued when a live session is lost and one
//! `StreamReconnected` when the next session opens, regardless of how many
//! attempts happened in between. Giving up queues a critical alert.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::credentials::CredentialManager;
use super::dispatcher::NotificationDispatcher;
use super::heartbeat::{HeartbeatConfig, HeartbeatState, Liveness};
use super::with_timeout;
use crate::application::ports::{
    PriceStreamPort, Session, SessionCredentialPort, SessionEvent, SessionEventKind, SessionId,
};
use crate::domain::connection::{ConnectionEvent, ConnectionState, ReconnectConfig, ReconnectPolicy};
use crate::domain::notification::{Notification, NotificationKind};
use crate::error::MonitorError;
use crate::infrastructure::metrics;

// =============================================================================
// Configuration and Messages
// =============================================================================

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Timeout for opening a session.
    pub connect_timeout: Duration,
    /// Timeout for closing a session.
    pub close_timeout: Duration,
    /// Liveness thresholds.
    pub heartbeat: HeartbeatConfig,
    /// Backoff between attempts.
    pub reconnect: ReconnectConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            close_timeout: Duration::from_secs(5),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Requests from other contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Drop the current session and reconnect.
    ForceReconnect {
        /// Obtain a new session credential before connecting.
        renew_credentials: bool,
        /// Why.
        reason: String,
    },
}

/// Session changes announced to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// A session opened; subscriptions must be re-established.
    SessionEstablished {
        /// New session.
        session: SessionId,
        /// Whether an earlier session existed.
        reconnected: bool,
    },
    /// The session closed; nothing is subscribed any more.
    SessionLost {
        /// Closed session.
        session: SessionId,
    },
}

/// Channels the supervisor consumes and produces.
#[derive(Debug)]
pub struct SupervisorChannels {
    /// Commands from the credential renewal context.
    pub commands: mpsc::Receiver<SupervisorCommand>,
    /// Session events forwarded by the event router.
    pub session_events: mpsc::Receiver<SessionEvent>,
    /// Lifecycle signals to the monitor.
    pub lifecycle: mpsc::Sender<LifecycleSignal>,
}

/// Terminal supervisor failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// Consecutive failures reached the maximum.
    #[error("gave up after {0} consecutive connection failures")]
    GaveUp(u32),
}

// =============================================================================
// Shared State
// =============================================================================

/// Read-only view of the connection state for other contexts.
#[derive(Debug)]
pub struct SharedConnectionState {
    state: RwLock<ConnectionState>,
}

impl Default for SharedConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedConnectionState {
    /// Start disconnected.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.get().is_live()
    }

    fn set(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

enum SessionExit {
    Cancelled,
    Lost {
        reason: String,
        renew_credentials: bool,
    },
}

// =============================================================================
// Supervisor
// =============================================================================

/// Stream session supervisor.
pub struct ConnectionSupervisor<T: PriceStreamPort, C: SessionCredentialPort> {
    transport: Arc<T>,
    credentials: Arc<CredentialManager<C>>,
    config: SupervisorConfig,
    state: Arc<SharedConnectionState>,
    heartbeat: Arc<HeartbeatState>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl<T: PriceStreamPort, C: SessionCredentialPort> ConnectionSupervisor<T, C> {
    /// Create a supervisor.
    #[must_use]
    pub const fn new(
        transport: Arc<T>,
        credentials: Arc<CredentialManager<C>>,
        config: SupervisorConfig,
        state: Arc<SharedConnectionState>,
        heartbeat: Arc<HeartbeatState>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            transport,
            credentials,
            config,
            state,
            heartbeat,
            dispatcher,
        }
    }

    fn transition(&self, event: ConnectionEvent) -> ConnectionState {
        let from = self.state.get();
        match from.apply(event) {
            Ok(to) => {
                if to != from {
                    tracing::info!(from = %from, to = %to, event = ?event, "Connection state changed");
                }
                self.state.set(to);
                metrics::set_connection_state(to);
                to
            }
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring connection event");
                from
            }
        }
    }

    /// Run until cancelled or until reconnection is abandoned.
    ///
    /// The active session is closed before returning.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::GaveUp`] after the configured number of
    /// consecutive failures.
    pub async fn run(
        self,
        mut channels: SupervisorChannels,
        cancel: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());
        let mut renew_credentials = false;
        let mut had_session = false;

        loop {
            if cancel.is_cancelled() {
                tracing::info!("Connection supervisor cancelled");
                return Ok(());
            }

            self.transition(ConnectionEvent::ConnectRequested);

            match self.open_session(renew_credentials).await {
                Ok(session) => {
                    self.transition(ConnectionEvent::ConnectSucceeded);
                    let failed_attempts = policy.attempt_count();
                    policy.reset();
                    self.heartbeat.reset();

                    tracing::info!(session = %session.id, failed_attempts, "Stream session established");
                    if had_session {
                        self.dispatcher.enqueue(Notification::new(NotificationKind::StreamReconnected {
                            attempts: failed_attempts,
                        }));
                    }
                    let _ = channels
                        .lifecycle
                        .send(LifecycleSignal::SessionEstablished {
                            session: session.id,
                            reconnected: had_session,
                        })
                        .await;
                    had_session = true;

                    let exit = self.supervise_session(&session, &mut channels, &cancel).await;

                    self.close_session(&session).await;
                    let _ = channels
                        .lifecycle
                        .send(LifecycleSignal::SessionLost { session: session.id })
                        .await;

                    match exit {
                        SessionExit::Cancelled => {
                            self.transition(ConnectionEvent::SessionClosed);
                            tracing::info!("Connection supervisor cancelled");
                            return Ok(());
                        }
                        SessionExit::Lost {
                            reason,
                            renew_credentials: renew,
                        } => {
                            tracing::warn!(session = %session.id, %reason, "Stream session lost");
                            renew_credentials = renew;
                            self.dispatcher
                                .enqueue(Notification::new(NotificationKind::StreamDisconnected { reason }));
                        }
                    }
                }
                Err(error) => {
                    self.transition(ConnectionEvent::ConnectFailed);
                    if matches!(error, MonitorError::SessionExpired(_)) {
                        renew_credentials = true;
                    }

                    let Some(delay) = policy.next_delay() else {
                        let attempts = policy.attempt_count();
                        self.transition(ConnectionEvent::AttemptsExhausted);
                        tracing::error!(attempts, error = %error, "Giving up on stream reconnection");
                        self.dispatcher
                            .enqueue(Notification::new(NotificationKind::ReconnectAbandoned { attempts }));
                        return Err(SupervisorError::GaveUp(attempts));
                    };

                    let attempt = policy.attempt_count();
                    metrics::record_reconnect_attempt();
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Stream connect failed, backing off"
                    );

                    let sleep = tokio::time::sleep(delay);
                    tokio::pin!(sleep);
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => {
                                tracing::info!("Connection supervisor cancelled during backoff");
                                return Ok(());
                            }
                            () = &mut sleep => break,
                            Some(command) = channels.commands.recv() => {
                                let SupervisorCommand::ForceReconnect { renew_credentials: renew, .. } = command;
                                renew_credentials |= renew;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn open_session(&self, renew_credentials: bool) -> Result<Session, MonitorError> {
        let token = if renew_credentials {
            self.credentials.force_new().await?
        } else {
            self.credentials.current_or_create().await?
        };

        with_timeout(
            "connect",
            self.config.connect_timeout,
            self.transport.connect(&token),
        )
        .await
    }

    async fn close_session(&self, session: &Session) {
        if tokio::time::timeout(self.config.close_timeout, self.transport.close(session))
            .await
            .is_err()
        {
            tracing::warn!(session = %session.id, "Closing stream session timed out");
        }
    }

    async fn supervise_session(
        &self,
        session: &Session,
        channels: &mut SupervisorChannels,
        cancel: &CancellationToken,
    ) -> SessionExit {
        let mut check = tokio::time::interval(self.config.heartbeat.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return SessionExit::Cancelled,

                Some(command) = channels.commands.recv() => {
                    let SupervisorCommand::ForceReconnect { renew_credentials, reason } = command;
                    let event = if renew_credentials {
                        ConnectionEvent::SessionExpired
                    } else {
                        ConnectionEvent::SessionClosed
                    };
                    self.transition(event);
                    return SessionExit::Lost { reason, renew_credentials };
                }

                Some(event) = channels.session_events.recv() => {
                    if event.session != session.id {
                        tracing::debug!(stale = %event.session, current = %session.id, "Ignoring stale session event");
                        continue;
                    }
                    match event.kind {
                        SessionEventKind::Opened | SessionEventKind::Pong => {}
                        SessionEventKind::Closed { reason } => {
                            self.transition(ConnectionEvent::SessionClosed);
                            return SessionExit::Lost { reason, renew_credentials: false };
                        }
                        SessionEventKind::Error { message } => {
                            self.transition(ConnectionEvent::SessionClosed);
                            return SessionExit::Lost { reason: message, renew_credentials: false };
                        }
                        SessionEventKind::CredentialExpired => {
                            self.transition(ConnectionEvent::SessionExpired);
                            return SessionExit::Lost {
                                reason: "session credential expired".to_string(),
                                renew_credentials: true,
                            };
                        }
                    }
                }

                _ = check.tick() => {
                    if let Some(exit) = self.check_liveness() {
                        return exit;
                    }
                }
            }
        }
    }

    fn check_liveness(&self) -> Option<SessionExit> {
        let silent_for = self.heartbeat.time_since_activity();

        match (self.config.heartbeat.assess(silent_for), self.state.get()) {
            (Liveness::Healthy, ConnectionState::Degraded) => {
                self.transition(ConnectionEvent::HeartbeatResumed);
                None
            }
            (Liveness::Stale, ConnectionState::Connected) => {
                tracing::warn!(silent_ms = silent_for.as_millis(), "Stream silent, session degraded");
                self.transition(ConnectionEvent::HeartbeatMissed);
                None
            }
            (Liveness::Dead, state) => {
                if state == ConnectionState::Connected {
                    self.transition(ConnectionEvent::HeartbeatMissed);
                }
                self.transition(ConnectionEvent::GraceExpired);
                Some(SessionExit::Lost {
                    reason: format!("no stream traffic for {}s", silent_for.as_secs()),
                    renew_credentials: false,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::application::ports::{ExchangeError, SessionToken, StreamError};
    use crate::application::services::credentials::RenewalConfig;
    use crate::application::services::dispatcher::DispatcherConfig;
    use crate::domain::symbol::Symbol;

    /// Transport whose connect results are scripted.
    #[derive(Default)]
    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<(), StreamError>>>,
        next_id: AtomicU64,
        closed: AtomicUsize,
        tokens: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn with(outcomes: Vec<Result<(), StreamError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl PriceStreamPort for ScriptedTransport {
        async fn connect(&self, token: &SessionToken) -> Result<Session, StreamError> {
            self.tokens.lock().push(token.expose().to_string());
            let outcome = self.outcomes.lock().pop_front().unwrap_or(Ok(()));
            outcome.map(|()| Session::new(SessionId(self.next_id.fetch_add(1, Ordering::SeqCst))))
        }

        async fn subscribe(&self, _symbols: &[Symbol]) -> Result<(), StreamError> {
            Ok(())
        }

        async fn unsubscribe(&self, _symbols: &[Symbol]) -> Result<(), StreamError> {
            Ok(())
        }

        async fn close(&self, _session: &Session) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingCredentials {
        created: AtomicUsize,
    }

    #[async_trait]
    impl SessionCredentialPort for CountingCredentials {
        async fn create_session_token(&self) -> Result<SessionToken, ExchangeError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(SessionToken::new(format!("key-{n}")))
        }

        async fn renew_session_token(&self, _token: &SessionToken) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    struct Harness {
        state: Arc<SharedConnectionState>,
        dispatcher: Arc<NotificationDispatcher>,
        transport: Arc<ScriptedTransport>,
        commands: mpsc::Sender<SupervisorCommand>,
        session_events: mpsc::Sender<SessionEvent>,
        lifecycle: mpsc::Receiver<LifecycleSignal>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<Result<(), SupervisorError>>,
    }

    fn fast_config(max_attempts: u32) -> SupervisorConfig {
        SupervisorConfig {
            connect_timeout: Duration::from_secs(1),
            close_timeout: Duration::from_secs(1),
            heartbeat: HeartbeatConfig {
                check_interval: Duration::from_millis(10),
                timeout: Duration::from_secs(30),
                grace: Duration::from_secs(30),
            },
            reconnect: ReconnectConfig {
                unit: Duration::from_millis(1),
                max_attempts,
                ..ReconnectConfig::default()
            },
        }
    }

    fn start(transport: ScriptedTransport, config: SupervisorConfig) -> Harness {
        let transport = Arc::new(transport);
        let credentials = Arc::new(CredentialManager::new(
            Arc::new(CountingCredentials::default()),
            RenewalConfig::default(),
        ));
        let state = Arc::new(SharedConnectionState::new());
        let dispatcher = Arc::new(NotificationDispatcher::new(DispatcherConfig::default()));
        let (commands_tx, commands) = mpsc::channel(4);
        let (events_tx, session_events) = mpsc::channel(16);
        let (lifecycle_tx, lifecycle) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let supervisor = ConnectionSupervisor::new(
            Arc::clone(&transport),
            credentials,
            config,
            Arc::clone(&state),
            Arc::new(HeartbeatState::new()),
            Arc::clone(&dispatcher),
        );
        let channels = SupervisorChannels {
            commands,
            session_events,
            lifecycle: lifecycle_tx,
        };
        let handle = tokio::spawn(supervisor.run(channels, cancel.clone()));

        Harness {
            state,
            dispatcher,
            transport,
            commands: commands_tx,
            session_events: events_tx,
            lifecycle,
            cancel,
            handle,
        }
    }

    async fn next_signal(harness: &mut Harness) -> LifecycleSignal {
        tokio::time::timeout(Duration::from_secs(2), harness.lifecycle.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn labels(dispatcher: &NotificationDispatcher) -> Vec<&'static str> {
        let mut labels = Vec::new();
        while let Some(n) = dispatcher.pop() {
            labels.push(n.label());
        }
        labels
    }

    #[tokio::test]
    async fn connects_and_reports_session() {
        let mut harness = start(ScriptedTransport::default(), fast_config(3));

        let signal = next_signal(&mut harness).await;

        assert_eq!(
            signal,
            LifecycleSignal::SessionEstablished {
                session: SessionId(0),
                reconnected: false
            }
        );
        assert_eq!(harness.state.get(), ConnectionState::Connected);

        harness.cancel.cancel();
        assert_eq!(harness.handle.await.unwrap(), Ok(()));
        assert_eq!(harness.transport.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_failed_connects_then_recovers() {
        let transport = ScriptedTransport::with(vec![
            Err(StreamError::Connect("refused".into())),
            Err(StreamError::Connect("refused".into())),
        ]);
        let mut harness = start(transport, fast_config(5));

        let signal = next_signal(&mut harness).await;

        assert!(matches!(signal, LifecycleSignal::SessionEstablished { reconnected: false, .. }));
        // initial connect failures are not disconnect transitions
        assert!(labels(&harness.dispatcher).is_empty());

        harness.cancel.cancel();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let transport = ScriptedTransport::with(vec![
            Err(StreamError::Connect("refused".into())),
            Err(StreamError::Connect("refused".into())),
            Err(StreamError::Connect("refused".into())),
        ]);
        let harness = start(transport, fast_config(3));

        let result = tokio::time::timeout(Duration::from_secs(2), harness.handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result, Err(SupervisorError::GaveUp(3)));
        assert_eq!(harness.state.get(), ConnectionState::GaveUp);
        assert_eq!(labels(&harness.dispatcher), vec!["reconnect_abandoned"]);
    }

    #[tokio::test]
    async fn session_close_notifies_once_and_reconnects() {
        let transport = ScriptedTransport::with(vec![
            Ok(()),
            Err(StreamError::Connect("refused".into())),
            Err(StreamError::Connect("refused".into())),
        ]);
        let mut harness = start(transport, fast_config(10));
        let first = next_signal(&mut harness).await;
        assert!(matches!(first, LifecycleSignal::SessionEstablished { .. }));

        harness
            .session_events
            .send(SessionEvent {
                session: SessionId(0),
                kind: SessionEventKind::Closed {
                    reason: "server restart".into(),
                },
            })
            .await
            .unwrap();

        assert_eq!(
            next_signal(&mut harness).await,
            LifecycleSignal::SessionLost { session: SessionId(0) }
        );
        assert_eq!(
            next_signal(&mut harness).await,
            LifecycleSignal::SessionEstablished {
                session: SessionId(1),
                reconnected: true
            }
        );

        assert_eq!(
            labels(&harness.dispatcher),
            vec!["stream_disconnected", "stream_reconnected"]
        );

        harness.cancel.cancel();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stale_session_events_are_ignored() {
        let mut harness = start(ScriptedTransport::default(), fast_config(3));
        next_signal(&mut harness).await;

        harness
            .session_events
            .send(SessionEvent {
                session: SessionId(42),
                kind: SessionEventKind::Closed {
                    reason: "old".into(),
                },
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(harness.state.get(), ConnectionState::Connected);

        harness.cancel.cancel();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn forced_reconnect_renews_credentials() {
        let mut harness = start(ScriptedTransport::default(), fast_config(3));
        next_signal(&mut harness).await;

        harness
            .commands
            .send(SupervisorCommand::ForceReconnect {
                renew_credentials: true,
                reason: "listen key expired".into(),
            })
            .await
            .unwrap();

        next_signal(&mut harness).await;
        let reconnected = next_signal(&mut harness).await;
        assert!(matches!(reconnected, LifecycleSignal::SessionEstablished { reconnected: true, .. }));

        let tokens = harness.transport.tokens.lock().clone();
        assert_eq!(tokens, vec!["key-0".to_string(), "key-1".to_string()]);

        harness.cancel.cancel();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn silent_session_degrades_then_disconnects() {
        let mut config = fast_config(3);
        config.heartbeat = HeartbeatConfig {
            check_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(20),
            grace: Duration::from_millis(20),
        };
        let mut harness = start(ScriptedTransport::default(), config);
        next_signal(&mut harness).await;

        let lost = next_signal(&mut harness).await;

        assert_eq!(lost, LifecycleSignal::SessionLost { session: SessionId(0) });
        assert_eq!(labels(&harness.dispatcher).first(), Some(&"stream_disconnected"));

        harness.cancel.cancel();
        harness.handle.await.unwrap().unwrap();
    }
}
