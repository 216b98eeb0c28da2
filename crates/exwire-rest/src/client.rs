//! REST client
//!
//! Covers the endpoints the connectivity layer needs: product metadata,
//! tickers, trades, the order-level book snapshot used to (re)seed the book
//! engine, and the private account endpoints behind HMAC signing.
//!
//! The client does not pace itself; callers own rate limiting (the
//! documented budgets live in `exwire_types::RateLimitConfig`).

use crate::auth::Credentials;
use crate::error::{RestError, RestResult};
use crate::types::{Account, ProductInfo, RawOrderBook, ServerTime, Ticker, Trade};
use exwire_types::{BookSnapshot, Product};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Default REST endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.exchange.coinbase.com";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Client configuration
#[derive(Debug, Default)]
pub struct ClientConfig {
    /// Base URL override (for sandbox or tests)
    pub base_url: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
    /// API credentials for private endpoints
    pub credentials: Option<Credentials>,
}

/// Exchange REST client
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    credentials: Option<Arc<Credentials>>,
}

impl RestClient {
    /// Public-endpoints-only client
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Client with credentials for private endpoints
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self::with_config(ClientConfig {
            credentials: Some(credentials),
            ..ClientConfig::default()
        })
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("exwire-rest/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| unreachable!("static client config"));

        Self {
            http,
            base_url: config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            credentials: config.credentials.map(Arc::new),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ========================================================================
    // Public market endpoints
    // ========================================================================

    /// Server time
    pub async fn get_time(&self) -> RestResult<ServerTime> {
        self.get_public("/time").await
    }

    /// All tradable products
    pub async fn get_products(&self) -> RestResult<Vec<ProductInfo>> {
        self.get_public("/products").await
    }

    /// Ticker for one product
    pub async fn get_ticker(&self, product: &Product) -> RestResult<Ticker> {
        self.get_public(&format!("/products/{product}/ticker")).await
    }

    /// Recent trades for one product
    pub async fn get_trades(&self, product: &Product) -> RestResult<Vec<Trade>> {
        self.get_public(&format!("/products/{product}/trades")).await
    }

    /// Full order-level book snapshot, normalized for the book engine.
    ///
    /// This is the resync path: fetch after a sequence gap, feed to
    /// `OrderBookBuilder::on_snapshot`, and replay buffered incrementals.
    #[instrument(skip(self), fields(product = %product))]
    pub async fn get_book_snapshot(&self, product: &Product) -> RestResult<BookSnapshot> {
        let raw: RawOrderBook = self
            .get_public(&format!("/products/{product}/book?level=3"))
            .await?;
        debug!(seq = raw.sequence, "fetched book snapshot");
        Ok(raw.into_snapshot(product.clone()))
    }

    // ========================================================================
    // Private endpoints
    // ========================================================================

    /// Account balances (requires credentials)
    pub async fn list_accounts(&self) -> RestResult<Vec<Account>> {
        self.get_private("/accounts").await
    }

    // ========================================================================
    // Request plumbing
    // ========================================================================

    async fn get_public<T: DeserializeOwned>(&self, path: &str) -> RestResult<T> {
        let request = self.http.get(format!("{}{}", self.base_url, path));
        Self::execute(request).await
    }

    async fn get_private<T: DeserializeOwned>(&self, path: &str) -> RestResult<T> {
        let request = self
            .signed_request(Method::GET, path, "")?
            .header("Content-Type", "application/json");
        Self::execute(request).await
    }

    fn signed_request(&self, method: Method, path: &str, body: &str) -> RestResult<RequestBuilder> {
        let creds = self.credentials.as_ref().ok_or(RestError::AuthRequired)?;
        let timestamp = Credentials::timestamp();
        let signature = creds.sign(&timestamp, method.as_str(), path, body);

        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("CB-ACCESS-KEY", creds.api_key())
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("CB-ACCESS-PASSPHRASE", creds.passphrase());
        if !body.is_empty() {
            request = request.body(body.to_string());
        }
        Ok(request)
    }

    async fn execute<T: DeserializeOwned>(request: RequestBuilder) -> RestResult<T> {
        let response = request.send().await?;
        let response = Self::check_status(response).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| RestError::Parse(e.to_string()))
    }

    async fn check_status(response: Response) -> RestResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(1000, |secs| secs * 1000);
            return Err(RestError::RateLimited { retry_after_ms });
        }
        let message = response
            .text()
            .await
            .ok()
            .and_then(|body| {
                serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("message").and_then(|m| m.as_str().map(String::from)))
                    .or(Some(body))
            })
            .unwrap_or_default();
        Err(RestError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

impl Default for RestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("has_credentials", &self.has_credentials())
            .finish()
    }
}
