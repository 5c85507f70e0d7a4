//! Session Credential Port (Driven Port)
//!
//! Source of the short-lived token that authorizes the streaming session.

use std::fmt;

use async_trait::async_trait;

use super::exchange_port::ExchangeError;

/// Streaming session token.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wrap a token value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw value, for building stream URLs and renewal requests.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(4).collect();
        write!(f, "SessionToken({prefix}***)")
    }
}

/// Port for creating and renewing the streaming session credential.
#[async_trait]
pub trait SessionCredentialPort: Send + Sync {
    /// Obtain a fresh session token.
    async fn create_session_token(&self) -> Result<SessionToken, ExchangeError>;

    /// Extend the validity of `token`.
    ///
    /// Returns [`ExchangeError::SessionExpired`] if the venue no longer
    /// recognizes the token.
    async fn renew_session_token(&self, token: &SessionToken) -> Result<(), ExchangeError>;
}
