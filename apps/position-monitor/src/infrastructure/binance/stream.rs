//! Combined stream transport.
//!
//! One WebSocket session per listen key at
//! `<base>/stream?streams=<listenKey>`, carrying the account's user-data
//! events. Mark price streams are added and removed on the live session with
//! `SUBSCRIBE` / `UNSUBSCRIBE` requests whose acknowledgements are matched
//! back to the caller by request id.
//!
//! Every inbound frame is pushed into the event channel given at
//! construction; the transport never calls back into the monitor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::messages::{InboundFrame, StreamRequest, parse_frame};
use crate::application::ports::{
    PriceStreamPort, Session, SessionEvent, SessionEventKind, SessionId, SessionToken, StreamError, StreamEvent,
};
use crate::domain::symbol::Symbol;
use crate::infrastructure::metrics;

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), StreamError>>>>>;
type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the stream transport.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket base URL, e.g. `wss://fstream.binance.com`.
    pub base_url: String,
    /// Interval between client pings.
    pub ping_interval: Duration,
    /// How long to wait for a subscription acknowledgement.
    pub request_timeout: Duration,
    /// How long `close` waits for the session task to finish.
    pub close_timeout: Duration,
}

impl StreamConfig {
    /// Configuration with default timings for `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ping_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }

    fn session_url(&self, token: &SessionToken) -> String {
        format!("{}/stream?streams={}", self.base_url.trim_end_matches('/'), token.expose())
    }
}

struct ActiveSession {
    id: SessionId,
    outbound: mpsc::Sender<String>,
    pending: PendingRequests,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Binance combined stream transport.
pub struct BinanceStream {
    config: StreamConfig,
    events: mpsc::Sender<StreamEvent>,
    next_session: AtomicU64,
    next_request: AtomicU64,
    active: Mutex<Option<ActiveSession>>,
}

impl BinanceStream {
    /// Create a transport that pushes inbound events into `events`.
    #[must_use]
    pub fn new(config: StreamConfig, events: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            config,
            events,
            next_session: AtomicU64::new(0),
            next_request: AtomicU64::new(1),
            active: Mutex::new(None),
        }
    }

    async fn shutdown(&self, session: ActiveSession) {
        session.cancel.cancel();
        if tokio::time::timeout(self.config.close_timeout, session.task).await.is_err() {
            tracing::warn!(session = %session.id, "Session task did not stop in time");
        }
    }

    async fn request(&self, request: StreamRequest) -> Result<(), StreamError> {
        let (outbound, pending) = {
            let active = self.active.lock();
            let session = active.as_ref().ok_or(StreamError::NotConnected)?;
            (session.outbound.clone(), Arc::clone(&session.pending))
        };

        let id = request.id;
        let json = serde_json::to_string(&request).map_err(|e| StreamError::Rejected(e.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        pending.lock().insert(id, reply_tx);

        if outbound.send(json).await.is_err() {
            pending.lock().remove(&id);
            return Err(StreamError::Closed);
        }

        match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StreamError::Closed),
            Err(_) => {
                pending.lock().remove(&id);
                Err(StreamError::Timeout)
            }
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl PriceStreamPort for BinanceStream {
    async fn connect(&self, token: &SessionToken) -> Result<Session, StreamError> {
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            self.shutdown(previous).await;
        }

        let (socket, _response) = tokio_tungstenite::connect_async(self.config.session_url(token))
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let pending: PendingRequests = Arc::default();
        let cancel = CancellationToken::new();

        let worker = SessionWorker {
            id,
            events: self.events.clone(),
            pending: Arc::clone(&pending),
            ping_interval: self.config.ping_interval,
        };
        let task = tokio::spawn(worker.run(socket, outbound_rx, cancel.clone()));

        *self.active.lock() = Some(ActiveSession {
            id,
            outbound: outbound_tx,
            pending,
            cancel,
            task,
        });

        tracing::info!(session = %id, "Stream session opened");
        Ok(Session::new(id))
    }

    async fn subscribe(&self, symbols: &[Symbol]) -> Result<(), StreamError> {
        if symbols.is_empty() {
            return Ok(());
        }
        self.request(StreamRequest::subscribe(symbols, self.next_request_id())).await
    }

    async fn unsubscribe(&self, symbols: &[Symbol]) -> Result<(), StreamError> {
        if symbols.is_empty() {
            return Ok(());
        }
        self.request(StreamRequest::unsubscribe(symbols, self.next_request_id())).await
    }

    async fn close(&self, session: &Session) {
        let current = {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|s| s.id == session.id) {
                active.take()
            } else {
                None
            }
        };
        if let Some(current) = current {
            self.shutdown(current).await;
            tracing::info!(session = %session.id, "Stream session closed");
        }
    }
}

// =============================================================================
// Session Worker
// =============================================================================

struct SessionWorker {
    id: SessionId,
    events: mpsc::Sender<StreamEvent>,
    pending: PendingRequests,
    ping_interval: Duration,
}

enum SessionEnd {
    Cancelled,
    Closed(String),
    Failed(String),
}

impl SessionWorker {
    async fn run(self, socket: Socket, mut outbound: mpsc::Receiver<String>, cancel: CancellationToken) {
        let (mut write, mut read) = socket.split();
        self.emit(SessionEventKind::Opened).await;

        let start = tokio::time::Instant::now() + self.ping_interval;
        let mut ping = tokio::time::interval_at(start, self.ping_interval);

        let end = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break SessionEnd::Cancelled;
                }
                Some(text) = outbound.recv() => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        break SessionEnd::Failed(format!("send failed: {e}"));
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                        break SessionEnd::Failed(format!("ping failed: {e}"));
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                    Some(Ok(Message::Pong(_))) => self.emit(SessionEventKind::Pong).await,
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            break SessionEnd::Failed(format!("pong failed: {e}"));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "closed by server".to_string(),
                            |f| format!("closed by server: {} {}", u16::from(f.code), f.reason.as_str()),
                        );
                        break SessionEnd::Closed(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Failed(e.to_string()),
                    None => break SessionEnd::Closed("stream ended".to_string()),
                },
            }
        };

        for (_, reply) in self.pending.lock().drain() {
            let _ = reply.send(Err(StreamError::Closed));
        }

        match end {
            SessionEnd::Cancelled => tracing::debug!(session = %self.id, "Session worker cancelled"),
            SessionEnd::Closed(reason) => {
                tracing::warn!(session = %self.id, %reason, "Stream session closed");
                self.emit(SessionEventKind::Closed { reason }).await;
            }
            SessionEnd::Failed(message) => {
                tracing::warn!(session = %self.id, error = %message, "Stream session failed");
                self.emit(SessionEventKind::Error { message }).await;
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        match parse_frame(text) {
            Ok(InboundFrame::Ack { id }) => self.resolve(id, Ok(())),
            Ok(InboundFrame::Failure { id, message }) => self.resolve(id, Err(StreamError::Rejected(message))),
            Ok(InboundFrame::Event(StreamEvent::Tick(tick))) => {
                if self.events.try_send(StreamEvent::Tick(tick)).is_err() {
                    metrics::record_tick_dropped();
                }
            }
            Ok(InboundFrame::Event(event)) => {
                let _ = self.events.send(event).await;
            }
            Ok(InboundFrame::ListenKeyExpired) => {
                tracing::warn!(session = %self.id, "Listen key expired");
                self.emit(SessionEventKind::CredentialExpired).await;
            }
            Ok(InboundFrame::Ignored) => {
                // Still traffic.
                self.emit(SessionEventKind::Pong).await;
            }
            Err(error) => {
                tracing::warn!(session = %self.id, error = %error, "Unparseable stream frame");
            }
        }
    }

    fn resolve(&self, id: u64, result: Result<(), StreamError>) {
        match self.pending.lock().remove(&id) {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => tracing::debug!(session = %self.id, request = id, "Reply for unknown request"),
        }
    }

    async fn emit(&self, kind: SessionEventKind) {
        let event = StreamEvent::Session(SessionEvent { session: self.id, kind });
        let _ = self.events.send(event).await;
    }
}
