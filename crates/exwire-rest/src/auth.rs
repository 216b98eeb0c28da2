//! Request signing for private endpoints
//!
//! Implements the exchange's HMAC-SHA256 scheme: the base64-decoded secret
//! keys a MAC over `timestamp + method + path + body`, and the signature is
//! sent base64-encoded alongside the key, passphrase, and timestamp headers.
//!
//! # Security
//!
//! The secret is stored via the `secrecy` crate, which zeroizes the memory
//! on drop and keeps it out of Debug output.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{RestError, RestResult};

type HmacSha256 = Hmac<Sha256>;

/// API credentials for authenticated requests
pub struct Credentials {
    api_key: String,
    passphrase: String,
    /// Decoded from base64; zeroized on drop
    secret: SecretVec<u8>,
}

impl Credentials {
    /// Create credentials from an API key, passphrase, and base64 secret.
    pub fn new(
        api_key: impl Into<String>,
        passphrase: impl Into<String>,
        secret: impl AsRef<str>,
    ) -> RestResult<Self> {
        let decoded = BASE64
            .decode(secret.as_ref())
            .map_err(|e| RestError::InvalidCredentials(format!("invalid base64 secret: {e}")))?;

        Ok(Self {
            api_key: api_key.into(),
            passphrase: passphrase.into(),
            secret: SecretVec::new(decoded),
        })
    }

    /// Read `EXWIRE_API_KEY`, `EXWIRE_API_PASSPHRASE`, and
    /// `EXWIRE_API_SECRET` from the environment.
    pub fn from_env() -> RestResult<Self> {
        let api_key = std::env::var("EXWIRE_API_KEY")
            .map_err(|_| RestError::EnvVarNotSet("EXWIRE_API_KEY".into()))?;
        let passphrase = std::env::var("EXWIRE_API_PASSPHRASE")
            .map_err(|_| RestError::EnvVarNotSet("EXWIRE_API_PASSPHRASE".into()))?;
        let secret = std::env::var("EXWIRE_API_SECRET")
            .map_err(|_| RestError::EnvVarNotSet("EXWIRE_API_SECRET".into()))?;

        Self::new(api_key, passphrase, secret)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    /// Seconds since the epoch, as the timestamp header expects
    pub fn timestamp() -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        now.as_secs().to_string()
    }

    /// Sign one request: base64(HMAC-SHA256(secret, timestamp + method +
    /// path + body)). `method` must be uppercase; `path` includes the query
    /// string; `body` is empty for GETs.
    pub fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret())
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
