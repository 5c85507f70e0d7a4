//! REST client for the futures API.
//!
//! Requests are sent once; retrying is left to the caller's schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

use super::error::BinanceError;
use super::messages::ApiErrorBody;
use super::signer::RequestSigner;

/// HTTP client for the Binance futures API.
#[derive(Clone)]
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
    signer: Arc<dyn RequestSigner>,
    recv_window: Duration,
}

impl BinanceRestClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        signer: Arc<dyn RequestSigner>,
        recv_window: Duration,
        timeout: Duration,
    ) -> Result<Self, BinanceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BinanceError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signer,
            recv_window,
        })
    }

    /// Unauthenticated request.
    pub async fn public<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T, BinanceError> {
        let url = self.url(path, params)?;
        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }

    /// Request authenticated by API key only (listen key endpoints).
    pub async fn keyed<T: DeserializeOwned>(&self, method: Method, path: &str) -> Result<T, BinanceError> {
        let url = self.url(path, &[])?;
        let response = self
            .client
            .request(method, url)
            .header("X-MBX-APIKEY", self.signer.api_key())
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Signed request. `timestamp`, `recvWindow` and `signature` are appended.
    pub async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, BinanceError> {
        let mut url = self.url(path, params)?;
        url.query_pairs_mut()
            .append_pair("recvWindow", &self.recv_window.as_millis().to_string())
            .append_pair("timestamp", &Utc::now().timestamp_millis().to_string());
        let signature = self.signer.sign(url.query().unwrap_or_default());
        url.query_pairs_mut().append_pair("signature", &signature);

        let response = self
            .client
            .request(method, url)
            .header("X-MBX-APIKEY", self.signer.api_key())
            .send()
            .await?;
        Self::decode(response).await
    }

    fn url(&self, path: &str, params: &[(&str, String)]) -> Result<Url, BinanceError> {
        let mut url = Url::parse(&format!("{}{path}", self.base_url))
            .map_err(|e| BinanceError::Network(format!("invalid URL: {e}")))?;
        if !params.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BinanceError> {
        let status = response.status();

        if status.is_success() {
            let text = response.text().await?;
            let body = if text.is_empty() { "null" } else { text.as_str() };
            return serde_json::from_str(body).map_err(|e| BinanceError::JsonParse(e.to_string()));
        }

        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        Err(classify_failure(status, retry_after, &body))
    }
}

impl std::fmt::Debug for BinanceRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceRestClient")
            .field("base_url", &self.base_url)
            .field("recv_window", &self.recv_window)
            .finish_non_exhaustive()
    }
}

/// Error category for a failed response.
enum ErrorCategory {
    RateLimited,
    Server,
    Client,
}

/// Categorize HTTP status code.
const fn categorize_status(status: StatusCode) -> ErrorCategory {
    match status.as_u16() {
        418 | 429 => ErrorCategory::RateLimited,
        408 | 500..=599 => ErrorCategory::Server,
        _ => ErrorCategory::Client,
    }
}

fn classify_failure(status: StatusCode, retry_after: Option<u64>, body: &str) -> BinanceError {
    match categorize_status(status) {
        ErrorCategory::RateLimited => BinanceError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(60),
        },
        ErrorCategory::Server | ErrorCategory::Client => match serde_json::from_str::<ApiErrorBody>(body) {
            Ok(error) => BinanceError::Api {
                status: status.as_u16(),
                code: error.code,
                message: error.msg,
            },
            Err(_) => BinanceError::Http {
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            },
        },
    }
}
