//! Configuration Module
//!
//! Environment-driven configuration for the monitor and its adapters.

mod settings;

pub use settings::{
    BinanceEnvironment, BinanceSettings, ConfigError, CredentialSettings, Credentials, MonitorConfig,
    MonitorSettings, NotifySettings, ReconnectSettings, StopLossSettings, StopRuleKind, StreamSettings,
    TelegramSettings,
};
