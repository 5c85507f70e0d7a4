//! Binance-specific error types.

use thiserror::Error;

use crate::application::ports::ExchangeError;

/// Venue code for an unknown or expired listen key.
pub const LISTEN_KEY_NOT_FOUND: i64 = -1125;

/// Venue codes for rejected API keys or signatures.
const AUTH_CODES: [i64; 3] = [-1022, -2014, -2015];

/// Errors from the Binance adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BinanceError {
    /// Request could not be sent or the body could not be read.
    #[error("network error: {0}")]
    Network(String),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,

    /// API returned a coded error.
    #[error("API error {code} (HTTP {status}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Venue error code.
        code: i64,
        /// Venue message.
        message: String,
    },

    /// Rate limited.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Suggested retry delay in seconds.
        retry_after_secs: u64,
    },

    /// Non-success status without a parseable error body.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status.
        status: u16,
        /// Raw body.
        body: String,
    },

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    JsonParse(String),

    /// Credentials missing or malformed.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
}

impl BinanceError {
    /// Whether the venue rejected the request itself, as opposed to the
    /// request never being processed.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Api { status: 400..=499, .. })
    }

    /// Human-readable reason for alerts.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Api { code, message, .. } => format!("{message} ({code})"),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for BinanceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::JsonParse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<BinanceError> for ExchangeError {
    fn from(err: BinanceError) -> Self {
        match err {
            BinanceError::Api {
                code: LISTEN_KEY_NOT_FOUND,
                message,
                ..
            } => Self::SessionExpired { message },
            BinanceError::Api { code, message, .. } if AUTH_CODES.contains(&code) => {
                Self::Unauthorized { message }
            }
            BinanceError::Api { status: 401, message, .. } => Self::Unauthorized { message },
            BinanceError::InvalidCredentials(message) => Self::Unauthorized { message },
            BinanceError::Timeout => Self::Timeout {
                operation: "binance request",
            },
            other => Self::TransientFetch {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, code: i64) -> BinanceError {
        BinanceError::Api {
            status,
            code,
            message: "msg".into(),
        }
    }

    #[test]
    fn unknown_listen_key_is_session_expired() {
        let err: ExchangeError = api(400, LISTEN_KEY_NOT_FOUND).into();
        assert!(matches!(err, ExchangeError::SessionExpired { .. }));
    }

    #[test]
    fn signature_errors_are_unauthorized() {
        let err: ExchangeError = api(400, -1022).into();
        assert!(matches!(err, ExchangeError::Unauthorized { .. }));
        let err: ExchangeError = api(401, -2015).into();
        assert!(matches!(err, ExchangeError::Unauthorized { .. }));
    }

    #[test]
    fn network_and_server_errors_are_transient() {
        let err: ExchangeError = BinanceError::Network("reset".into()).into();
        assert!(matches!(err, ExchangeError::TransientFetch { .. }));
        let err: ExchangeError = api(503, -1001).into();
        assert!(matches!(err, ExchangeError::TransientFetch { .. }));
    }

    #[test]
    fn timeout_maps_to_timeout() {
        let err: ExchangeError = BinanceError::Timeout.into();
        assert!(matches!(err, ExchangeError::Timeout { .. }));
    }

    #[test]
    fn rejection_is_client_error_only() {
        assert!(api(400, -2021).is_rejection());
        assert!(!api(502, -1001).is_rejection());
        assert!(!BinanceError::Network("x".into()).is_rejection());
    }
}
