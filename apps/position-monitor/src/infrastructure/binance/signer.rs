//! Request signing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::BinanceError;

/// Signs query strings for authenticated endpoints.
pub trait RequestSigner: Send + Sync {
    /// Key sent in the `X-MBX-APIKEY` header.
    fn api_key(&self) -> &str;

    /// Hex signature of `payload`.
    fn sign(&self, payload: &str) -> String;
}

/// HMAC-SHA256 signer for API-key/secret pairs.
#[derive(Clone)]
pub struct HmacSha256Signer {
    api_key: String,
    mac: Hmac<Sha256>,
}

impl HmacSha256Signer {
    /// Create a signer.
    ///
    /// # Errors
    ///
    /// Returns [`BinanceError::InvalidCredentials`] if the key or secret is
    /// empty.
    pub fn new(api_key: impl Into<String>, api_secret: &str) -> Result<Self, BinanceError> {
        let api_key = api_key.into();
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(BinanceError::InvalidCredentials("API key and secret are required".into()));
        }
        let mac = Hmac::<Sha256>::new_from_slice(api_secret.as_bytes())
            .map_err(|e| BinanceError::InvalidCredentials(e.to_string()))?;
        Ok(Self { api_key, mac })
    }
}

impl RequestSigner for HmacSha256Signer {
    fn api_key(&self) -> &str {
        &self.api_key
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for HmacSha256Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSha256Signer")
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}
