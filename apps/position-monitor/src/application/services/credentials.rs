//! Session Credential Management
//!
//! Holds the current streaming session token, hands it to the supervisor
//! on connect, and keeps it alive on its own cadence. A token the venue
//! reports as invalid is dropped and the supervisor is told to reconnect
//! with a fresh one.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::supervisor::SupervisorCommand;
use super::with_timeout;
use crate::application::ports::{SessionCredentialPort, SessionToken};
use crate::error::MonitorError;
use crate::infrastructure::metrics;

/// Renewal cadence.
#[derive(Debug, Clone)]
pub struct RenewalConfig {
    /// Interval between successful renewals.
    pub renew_interval: Duration,
    /// Interval before retrying a failed renewal.
    pub retry_interval: Duration,
    /// Timeout for each credential call.
    pub call_timeout: Duration,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            renew_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Owner of the current session token.
pub struct CredentialManager<C: SessionCredentialPort> {
    port: Arc<C>,
    config: RenewalConfig,
    token: RwLock<Option<SessionToken>>,
}

impl<C: SessionCredentialPort> CredentialManager<C> {
    /// Create a manager with no token yet.
    #[must_use]
    pub const fn new(port: Arc<C>, config: RenewalConfig) -> Self {
        Self {
            port,
            config,
            token: RwLock::new(None),
        }
    }

    /// Current token, creating one if none is held.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the create call.
    pub async fn current_or_create(&self) -> Result<SessionToken, MonitorError> {
        if let Some(token) = self.token.read().clone() {
            return Ok(token);
        }
        self.create().await
    }

    /// Discard any held token and create a new one.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the create call.
    pub async fn force_new(&self) -> Result<SessionToken, MonitorError> {
        self.invalidate();
        self.create().await
    }

    /// Forget the held token.
    pub fn invalidate(&self) {
        self.token.write().take();
    }

    async fn create(&self) -> Result<SessionToken, MonitorError> {
        let token = with_timeout(
            "create_session_token",
            self.config.call_timeout,
            self.port.create_session_token(),
        )
        .await?;
        tracing::info!(token = ?token, "Session credential created");
        *self.token.write() = Some(token.clone());
        Ok(token)
    }

    /// Renew the held token. Without a token there is nothing to renew.
    ///
    /// # Errors
    ///
    /// Returns the classified failure; `SessionExpired` means the token was
    /// dropped.
    pub async fn renew(&self) -> Result<(), MonitorError> {
        let Some(token) = self.token.read().clone() else {
            return Ok(());
        };

        let result = with_timeout(
            "renew_session_token",
            self.config.call_timeout,
            self.port.renew_session_token(&token),
        )
        .await;

        if matches!(result, Err(MonitorError::SessionExpired(_))) {
            let mut held = self.token.write();
            if held.as_ref() == Some(&token) {
                held.take();
            }
        }
        result
    }

    /// Renewal loop, isolated from connect and refresh work.
    pub async fn run_renewal(
        self: Arc<Self>,
        commands: mpsc::Sender<SupervisorCommand>,
        cancel: CancellationToken,
    ) {
        let mut wait = self.config.renew_interval;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }

            wait = match self.renew().await {
                Ok(()) => {
                    metrics::record_credential_renewal("ok");
                    tracing::debug!("Session credential renewed");
                    self.config.renew_interval
                }
                Err(MonitorError::SessionExpired(message)) => {
                    metrics::record_credential_renewal("expired");
                    tracing::warn!(%message, "Session credential invalid, forcing reconnect");
                    let command = SupervisorCommand::ForceReconnect {
                        renew_credentials: true,
                        reason: format!("session credential invalid: {message}"),
                    };
                    if commands.send(command).await.is_err() {
                        break;
                    }
                    self.config.renew_interval
                }
                Err(error) => {
                    metrics::record_credential_renewal("failed");
                    tracing::warn!(
                        error = %error,
                        retry_in_secs = self.config.retry_interval.as_secs(),
                        "Session credential renewal failed"
                    );
                    self.config.retry_interval
                }
            };
        }

        tracing::debug!("Credential renewal stopped");
    }
}
