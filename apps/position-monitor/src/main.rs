//! Position Monitor Binary
//!
//! Starts the position monitor and dynamic stop-loss engine.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin position-monitor
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `BINANCE_API_KEY`: Binance API key
//! - `BINANCE_API_SECRET`: Binance API secret
//!
//! ## Optional
//! - `BINANCE_ENVIRONMENT`: MAINNET | TESTNET (default: MAINNET)
//! - `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID`: Telegram delivery (default: log only)
//! - `STOP_RULE`: stepped | banded (default: stepped)
//! - `METRICS_PORT`: Prometheus listener port, 0 disables the listener (default: 0)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use position_monitor::application::ports::{NotificationSink, StreamEvent};
use position_monitor::application::services::{
    ConnectionSupervisor, CredentialManager, EventRouter, HeartbeatState, NotificationDispatcher,
    PositionMonitorService, RouterChannels, SharedConnectionState, SupervisorChannels, SupervisorError,
};
use position_monitor::infrastructure::binance::{BinanceAdapter, BinanceRestClient, BinanceStream, HmacSha256Signer};
use position_monitor::infrastructure::telegram::{LogSink, TelegramSink};
use position_monitor::infrastructure::telemetry;
use position_monitor::{MonitorConfig, MonitorError, init_metrics};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Time allowed for the supervisor to close the active session.
const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the remaining tasks to stop.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Position Monitor");

    let config = MonitorConfig::from_env()?;
    config.log_config();

    init_metrics(config.metrics_port).context("failed to install metrics recorder")?;

    let policy = config.stop_loss_policy()?;

    // Exchange adapter
    let signer = Arc::new(HmacSha256Signer::new(
        config.binance.credentials.api_key(),
        config.binance.credentials.api_secret(),
    )?);
    let rest = BinanceRestClient::new(
        config.binance.rest_url.clone(),
        signer,
        config.binance.recv_window,
        config.monitor.call_timeout,
    )?;
    let exchange = Arc::new(BinanceAdapter::new(rest));
    if let Err(e) = exchange.load_instruments().await {
        tracing::warn!(error = %e, "Instrument filters unavailable, loading lazily");
    }

    // Channels
    let (events_tx, events_rx) = mpsc::channel::<StreamEvent>(config.monitor.tick_queue_capacity);
    let (ticks_tx, ticks_rx) = mpsc::channel(config.monitor.tick_queue_capacity);
    let (session_tx, session_rx) = mpsc::channel(64);
    let (commands_tx, commands_rx) = mpsc::channel(8);
    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(16);
    let (refresh_tx, refresh_rx) = mpsc::channel(1);

    // Services
    let stream = Arc::new(BinanceStream::new(config.stream_config(), events_tx));
    let dispatcher = Arc::new(NotificationDispatcher::new(config.dispatcher_config()));
    let connection = Arc::new(SharedConnectionState::new());
    let heartbeat = Arc::new(HeartbeatState::new());
    let credentials = Arc::new(CredentialManager::new(Arc::clone(&exchange), config.renewal_config()));

    let supervisor = ConnectionSupervisor::new(
        Arc::clone(&stream),
        Arc::clone(&credentials),
        config.supervisor_config(),
        Arc::clone(&connection),
        Arc::clone(&heartbeat),
        Arc::clone(&dispatcher),
    );
    let monitor = Arc::new(PositionMonitorService::new(
        Arc::clone(&exchange),
        Arc::clone(&stream),
        policy,
        config.monitor_config(),
        Arc::clone(&dispatcher),
        Arc::clone(&connection),
    ));
    let router = EventRouter::new(
        Arc::clone(&monitor),
        Arc::clone(&heartbeat),
        RouterChannels {
            ticks: ticks_tx,
            session_events: session_tx,
            refresh_requests: refresh_tx,
        },
    );

    let sink: Arc<dyn NotificationSink> = match &config.telegram {
        Some(settings) => Arc::new(TelegramSink::new(settings)),
        None => {
            tracing::info!("Telegram not configured, notifications go to the log");
            Arc::new(LogSink)
        }
    };

    // Tasks
    let supervisor_token = CancellationToken::new();
    let shutdown_token = CancellationToken::new();

    let mut supervisor_task = tokio::spawn(supervisor.run(
        SupervisorChannels {
            commands: commands_rx,
            session_events: session_rx,
            lifecycle: lifecycle_tx,
        },
        supervisor_token.clone(),
    ));

    let tasks: Vec<JoinHandle<()>> = vec![
        tokio::spawn(Arc::clone(&credentials).run_renewal(commands_tx, shutdown_token.clone())),
        tokio::spawn(router.run(events_rx, shutdown_token.clone())),
        tokio::spawn(Arc::clone(&monitor).run_refresh_loop(lifecycle_rx, refresh_rx, shutdown_token.clone())),
        tokio::spawn(Arc::clone(&monitor).run_tick_loop(ticks_rx, shutdown_token.clone())),
        tokio::spawn(Arc::clone(&dispatcher).run(Arc::clone(&sink), shutdown_token.clone())),
    ];

    tracing::info!("Position monitor ready");

    let outcome = tokio::select! {
        () = await_shutdown() => {
            supervisor_token.cancel();
            match tokio::time::timeout(SUPERVISOR_STOP_TIMEOUT, &mut supervisor_task).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Supervisor task panicked");
                    Ok(())
                }
                Err(_) => {
                    tracing::warn!("Supervisor did not stop in time");
                    supervisor_task.abort();
                    Ok(())
                }
            }
        }
        joined = &mut supervisor_task => match joined {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Supervisor task panicked");
                Ok(())
            }
        },
    };

    shutdown_token.cancel();
    for task in tasks {
        if tokio::time::timeout(TASK_STOP_TIMEOUT, task).await.is_err() {
            tracing::warn!("Task did not stop in time");
        }
    }

    dispatcher.drain(sink.as_ref(), config.notify.drain_timeout).await;

    match outcome {
        Ok(()) => {
            tracing::info!("Position monitor stopped");
            Ok(())
        }
        Err(SupervisorError::GaveUp(attempts)) => {
            tracing::error!(attempts, "Position monitor stopped after abandoning reconnection");
            Err(MonitorError::GiveUp(attempts).into())
        }
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
