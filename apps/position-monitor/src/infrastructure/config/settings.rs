//! Monitor Configuration Settings
//!
//! Configuration types for the position monitor, loaded from environment
//! variables. Only the venue credentials are required; everything else has
//! a default.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::application::services::{
    DispatcherConfig, HeartbeatConfig, PositionMonitorConfig, RenewalConfig, SupervisorConfig,
};
use crate::domain::connection::ReconnectConfig;
use crate::domain::stop_loss::{PolicyError, StopLossPolicy, StopLossRule};
use crate::infrastructure::binance::StreamConfig;

const MAINNET_REST_URL: &str = "https://fapi.binance.com";
const MAINNET_STREAM_URL: &str = "wss://fstream.binance.com";
const TESTNET_REST_URL: &str = "https://testnet.binancefuture.com";
const TESTNET_STREAM_URL: &str = "wss://stream.binancefuture.com";

/// Binance futures environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinanceEnvironment {
    /// Production venue.
    #[default]
    Mainnet,
    /// Futures testnet.
    Testnet,
}

impl BinanceEnvironment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "testnet" => Self::Testnet,
            _ => Self::Mainnet,
        }
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }

    const fn rest_url(self) -> &'static str {
        match self {
            Self::Mainnet => MAINNET_REST_URL,
            Self::Testnet => TESTNET_REST_URL,
        }
    }

    const fn stream_url(self) -> &'static str {
        match self {
            Self::Mainnet => MAINNET_STREAM_URL,
            Self::Testnet => TESTNET_STREAM_URL,
        }
    }
}

/// Venue API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Venue connection settings.
#[derive(Debug, Clone)]
pub struct BinanceSettings {
    /// Environment.
    pub environment: BinanceEnvironment,
    /// API credentials.
    pub credentials: Credentials,
    /// REST base URL.
    pub rest_url: String,
    /// WebSocket base URL.
    pub stream_url: String,
    /// Validity window for signed requests.
    pub recv_window: Duration,
}

/// Telegram delivery settings.
#[derive(Clone)]
pub struct TelegramSettings {
    /// Bot token.
    pub bot_token: String,
    /// Destination chat.
    pub chat_id: i64,
}

impl std::fmt::Debug for TelegramSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSettings")
            .field("bot_token", &"[REDACTED]")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Interval between registry refreshes.
    pub refresh_interval: Duration,
    /// Timeout for every outbound call.
    pub call_timeout: Duration,
    /// Capacity of the tick queue between router and tick loop.
    pub tick_queue_capacity: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
            tick_queue_capacity: 1024,
        }
    }
}

/// Which escalation rule to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopRuleKind {
    /// Entry-anchored steps.
    #[default]
    Stepped,
    /// Price-trailing bands.
    Banded,
}

impl StopRuleKind {
    /// Parse rule kind from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "banded" => Self::Banded,
            _ => Self::Stepped,
        }
    }
}

/// Stop-loss rule parameters.
#[derive(Debug, Clone)]
pub struct StopLossSettings {
    /// Rule variant.
    pub rule: StopRuleKind,
    /// Change (percent) at which escalation starts.
    pub trigger_percent: Decimal,
    /// Step width (percent), stepped rule only.
    pub step_percent: Decimal,
    /// Raise per step (percent of entry), stepped rule only.
    pub raise_percent: Decimal,
    /// Seed ratio for new long positions.
    pub initial_ratio: Decimal,
}

impl Default for StopLossSettings {
    fn default() -> Self {
        Self {
            rule: StopRuleKind::Stepped,
            trigger_percent: Decimal::TEN,
            step_percent: Decimal::TEN,
            raise_percent: Decimal::from(5),
            initial_ratio: Decimal::new(95, 2),
        }
    }
}

impl StopLossSettings {
    /// Build the validated policy.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn policy(&self) -> Result<StopLossPolicy, PolicyError> {
        let rule = match self.rule {
            StopRuleKind::Stepped => StopLossRule::Stepped {
                trigger_percent: self.trigger_percent,
                step_percent: self.step_percent,
                raise_percent: self.raise_percent,
            },
            StopRuleKind::Banded => StopLossRule::banded(self.trigger_percent),
        };
        StopLossPolicy::new(rule, self.initial_ratio)
    }
}

/// Stream session settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Interval between client pings.
    pub ping_interval: Duration,
    /// Silence after which the session is degraded.
    pub heartbeat_timeout: Duration,
    /// Further silence tolerated while degraded.
    pub degraded_grace: Duration,
    /// Timeout for opening a session.
    pub connect_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            degraded_grace: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Reconnection backoff settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Unit scaled by `2^attempt`.
    pub base: Duration,
    /// Maximum delay.
    pub cap: Duration,
    /// Consecutive failures before giving up (0 = unlimited).
    pub max_attempts: u32,
    /// Jitter fraction.
    pub jitter: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            max_attempts: 10,
            jitter: 0.0,
        }
    }
}

/// Session credential renewal settings.
#[derive(Debug, Clone)]
pub struct CredentialSettings {
    /// Interval between renewals.
    pub renew_interval: Duration,
    /// Retry interval after a failed renewal.
    pub retry_interval: Duration,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            renew_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(60),
        }
    }
}

/// Notification queue settings.
#[derive(Debug, Clone)]
pub struct NotifySettings {
    /// Queue capacity.
    pub queue_capacity: usize,
    /// Consumer idle sleep.
    pub idle_interval: Duration,
    /// Per-message delivery timeout.
    pub delivery_timeout: Duration,
    /// Shutdown drain budget.
    pub drain_timeout: Duration,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            idle_interval: Duration::from_millis(1000),
            delivery_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Complete monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Venue settings.
    pub binance: BinanceSettings,
    /// Telegram settings, if both token and chat id are set.
    pub telegram: Option<TelegramSettings>,
    /// Orchestrator settings.
    pub monitor: MonitorSettings,
    /// Stop-loss rule.
    pub stop_loss: StopLossSettings,
    /// Stream session settings.
    pub stream: StreamSettings,
    /// Reconnect backoff.
    pub reconnect: ReconnectSettings,
    /// Credential renewal.
    pub credentials: CredentialSettings,
    /// Notification queue.
    pub notify: NotifySettings,
    /// Prometheus listener port (0 = no listener).
    pub metrics_port: u16,
}

impl MonitorConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or
    /// empty, or if the stop-loss parameters are invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = required_env("BINANCE_API_KEY")?;
        let api_secret = required_env("BINANCE_API_SECRET")?;

        let environment = std::env::var("BINANCE_ENVIRONMENT")
            .map(|s| BinanceEnvironment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let binance = BinanceSettings {
            environment,
            credentials: Credentials::new(api_key, api_secret),
            rest_url: optional_env("BINANCE_REST_URL").unwrap_or_else(|| environment.rest_url().to_string()),
            stream_url: optional_env("BINANCE_STREAM_URL")
                .unwrap_or_else(|| environment.stream_url().to_string()),
            recv_window: parse_env_duration_millis("BINANCE_RECV_WINDOW_MS", Duration::from_millis(5000)),
        };

        let telegram = match (optional_env("TELEGRAM_BOT_TOKEN"), optional_env("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => {
                let chat_id = chat_id.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "TELEGRAM_CHAT_ID".to_string(),
                    value: chat_id,
                })?;
                Some(TelegramSettings { bot_token, chat_id })
            }
            _ => None,
        };

        let monitor_defaults = MonitorSettings::default();
        let monitor = MonitorSettings {
            refresh_interval: parse_env_duration_secs(
                "MONITOR_REFRESH_INTERVAL_SECS",
                monitor_defaults.refresh_interval,
            ),
            call_timeout: parse_env_duration_secs("MONITOR_CALL_TIMEOUT_SECS", monitor_defaults.call_timeout),
            tick_queue_capacity: parse_env("MONITOR_TICK_QUEUE_CAPACITY", monitor_defaults.tick_queue_capacity),
        };

        let stop_defaults = StopLossSettings::default();
        let stop_loss = StopLossSettings {
            rule: std::env::var("STOP_RULE")
                .map(|s| StopRuleKind::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            trigger_percent: parse_env("STOP_TRIGGER_PERCENT", stop_defaults.trigger_percent),
            step_percent: parse_env("STOP_STEP_PERCENT", stop_defaults.step_percent),
            raise_percent: parse_env("STOP_RAISE_PERCENT", stop_defaults.raise_percent),
            initial_ratio: parse_env("STOP_INITIAL_RATIO", stop_defaults.initial_ratio),
        };
        stop_loss.policy()?;

        let stream_defaults = StreamSettings::default();
        let stream = StreamSettings {
            ping_interval: parse_env_duration_secs("STREAM_PING_INTERVAL_SECS", stream_defaults.ping_interval),
            heartbeat_timeout: parse_env_duration_secs(
                "STREAM_HEARTBEAT_TIMEOUT_SECS",
                stream_defaults.heartbeat_timeout,
            ),
            degraded_grace: parse_env_duration_secs("STREAM_DEGRADED_GRACE_SECS", stream_defaults.degraded_grace),
            connect_timeout: parse_env_duration_secs(
                "STREAM_CONNECT_TIMEOUT_SECS",
                stream_defaults.connect_timeout,
            ),
        };

        let reconnect_defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            base: parse_env_duration_secs("RECONNECT_BASE_SECS", reconnect_defaults.base),
            cap: parse_env_duration_secs("RECONNECT_CAP_SECS", reconnect_defaults.cap),
            max_attempts: parse_env("RECONNECT_MAX_ATTEMPTS", reconnect_defaults.max_attempts),
            jitter: parse_env("RECONNECT_JITTER", reconnect_defaults.jitter),
        };

        let credential_defaults = CredentialSettings::default();
        let credentials = CredentialSettings {
            renew_interval: parse_env_duration_secs(
                "CREDENTIAL_RENEW_INTERVAL_SECS",
                credential_defaults.renew_interval,
            ),
            retry_interval: parse_env_duration_secs(
                "CREDENTIAL_RETRY_INTERVAL_SECS",
                credential_defaults.retry_interval,
            ),
        };

        let notify_defaults = NotifySettings::default();
        let notify = NotifySettings {
            queue_capacity: parse_env("NOTIFY_QUEUE_CAPACITY", notify_defaults.queue_capacity),
            idle_interval: parse_env_duration_millis("NOTIFY_IDLE_INTERVAL_MS", notify_defaults.idle_interval),
            delivery_timeout: parse_env_duration_secs(
                "NOTIFY_DELIVERY_TIMEOUT_SECS",
                notify_defaults.delivery_timeout,
            ),
            drain_timeout: parse_env_duration_secs("NOTIFY_DRAIN_TIMEOUT_SECS", notify_defaults.drain_timeout),
        };

        Ok(Self {
            binance,
            telegram,
            monitor,
            stop_loss,
            stream,
            reconnect,
            credentials,
            notify,
            metrics_port: parse_env("METRICS_PORT", 0),
        })
    }

    /// Log the effective configuration with secrets omitted.
    pub fn log_config(&self) {
        tracing::info!(
            environment = self.binance.environment.as_str(),
            rest_url = %self.binance.rest_url,
            stream_url = %self.binance.stream_url,
            telegram = self.telegram.is_some(),
            stop_rule = ?self.stop_loss.rule,
            trigger_percent = %self.stop_loss.trigger_percent,
            initial_ratio = %self.stop_loss.initial_ratio,
            refresh_interval_secs = self.monitor.refresh_interval.as_secs(),
            reconnect_max_attempts = self.reconnect.max_attempts,
            metrics_port = self.metrics_port,
            "Configuration loaded"
        );
    }

    /// Stop-loss policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop-loss parameters are invalid.
    pub fn stop_loss_policy(&self) -> Result<StopLossPolicy, ConfigError> {
        Ok(self.stop_loss.policy()?)
    }

    /// Orchestrator configuration.
    #[must_use]
    pub fn monitor_config(&self) -> PositionMonitorConfig {
        PositionMonitorConfig {
            refresh_interval: self.monitor.refresh_interval,
            call_timeout: self.monitor.call_timeout,
            ..PositionMonitorConfig::default()
        }
    }

    /// Supervisor configuration.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            connect_timeout: self.stream.connect_timeout,
            close_timeout: SupervisorConfig::default().close_timeout,
            heartbeat: HeartbeatConfig {
                timeout: self.stream.heartbeat_timeout,
                grace: self.stream.degraded_grace,
                ..HeartbeatConfig::default()
            },
            reconnect: ReconnectConfig {
                unit: self.reconnect.base,
                max_delay: self.reconnect.cap,
                jitter_factor: self.reconnect.jitter,
                max_attempts: self.reconnect.max_attempts,
                ..ReconnectConfig::default()
            },
        }
    }

    /// Stream transport configuration.
    #[must_use]
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            ping_interval: self.stream.ping_interval,
            request_timeout: self.monitor.call_timeout,
            ..StreamConfig::new(self.binance.stream_url.clone())
        }
    }

    /// Credential renewal configuration.
    #[must_use]
    pub const fn renewal_config(&self) -> RenewalConfig {
        RenewalConfig {
            renew_interval: self.credentials.renew_interval,
            retry_interval: self.credentials.retry_interval,
            call_timeout: self.monitor.call_timeout,
        }
    }

    /// Notification dispatcher configuration.
    #[must_use]
    pub const fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            capacity: self.notify.queue_capacity,
            idle_interval: self.notify.idle_interval,
            delivery_timeout: self.notify.delivery_timeout,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
    /// Stop-loss parameters rejected.
    #[error("invalid stop-loss configuration: {0}")]
    InvalidPolicy(#[from] PolicyError),
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    let value = std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
