//! Broker gateway HTTP client with access-token management.
//!
//! Tokens are issued against a client id/secret pair and refreshed
//! proactively; an auth-expiry envelope on any call triggers one
//! refresh-and-retry. Business failures (success=false inside a 200) are
//! surfaced verbatim and never retried here.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::*;
use super::{MarketData, OrderGateway};
use crate::types::Candle;

/// Conservative client-side timeout; the gateway publishes none.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Tokens are valid for the trading day; refresh proactively after 8 hours.
const TOKEN_MAX_AGE: Duration = Duration::from_secs(8 * 60 * 60);

struct TokenState {
    token: String,
    acquired_at: Instant,
}

/// Broker gateway client.
pub struct BrokerClient {
    client: Client,
    base_url: String,
    client_id: String,
    secret_key: String,
    token: RwLock<Option<TokenState>>,
}

impl BrokerClient {
    /// Create a new client from environment variables
    ///
    /// Expects:
    /// - `BROKER_BASE_URL` - Gateway base URL
    /// - `BROKER_CLIENT_ID` - API client id
    /// - `BROKER_SECRET_KEY` - API secret
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("BROKER_BASE_URL")
            .context("BROKER_BASE_URL environment variable not set")?;
        let client_id = std::env::var("BROKER_CLIENT_ID")
            .context("BROKER_CLIENT_ID environment variable not set")?;
        let secret_key = std::env::var("BROKER_SECRET_KEY")
            .context("BROKER_SECRET_KEY environment variable not set")?;
        Ok(Self::new(base_url, client_id, secret_key))
    }

    /// Create a new client with explicit credentials
    pub fn new(base_url: String, client_id: String, secret_key: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Failed to create HTTP client"),
            base_url,
            client_id,
            secret_key,
            token: RwLock::new(None),
        }
    }

    async fn token_needs_refresh(&self) -> bool {
        match self.token.read().await.as_ref() {
            Some(state) => state.acquired_at.elapsed() > TOKEN_MAX_AGE,
            None => true,
        }
    }

    /// Ensure a valid token is held, issuing one if necessary
    pub async fn ensure_authenticated(&self) -> Result<()> {
        if self.token_needs_refresh().await {
            self.authenticate().await?;
        }
        Ok(())
    }

    /// Issue a fresh access token
    pub async fn authenticate(&self) -> Result<()> {
        info!("Requesting broker access token...");

        let request = TokenRequest {
            client_id: self.client_id.clone(),
            secret_key: self.secret_key.clone(),
        };

        let response = self
            .client
            .post(format!("{}/api/v1/token", self.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to send token request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Token request failed with status {}: {}", status, body));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;

        if !token_response.success {
            return Err(anyhow!(
                "Token issuance failed: {} (code: {})",
                token_response.error_message.unwrap_or_default(),
                token_response.error_code
            ));
        }

        let token = token_response
            .access_token
            .ok_or_else(|| anyhow!("Token response succeeded but carried no token"))?;

        *self.token.write().await = Some(TokenState {
            token,
            acquired_at: Instant::now(),
        });

        info!("Broker access token issued");
        Ok(())
    }

    async fn auth_header(&self) -> Result<String> {
        let guard = self.token.read().await;
        let state = guard
            .as_ref()
            .ok_or_else(|| anyhow!("Not authenticated - call authenticate() first"))?;
        Ok(format!("Bearer {}", state.token))
    }

    /// One authenticated POST, returning the raw status + body text.
    async fn post_raw<T: serde::Serialize>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<(reqwest::StatusCode, String)> {
        let auth = self.auth_header().await?;
        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .header("Authorization", &auth)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", endpoint))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }

    /// Authenticated POST with one refresh-and-retry on auth expiry.
    ///
    /// Auth expiry shows up either as HTTP 401 or as the gateway's
    /// `errorCode: 401` envelope; both trigger a single token refresh.
    async fn post<T: serde::Serialize, R: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<R> {
        self.ensure_authenticated().await?;

        for attempt in 0..2 {
            let (status, text) = self.post_raw(endpoint, body).await?;

            let auth_expired = status == reqwest::StatusCode::UNAUTHORIZED
                || serde_json::from_str::<serde_json::Value>(&text)
                    .ok()
                    .and_then(|v| v.get("errorCode").and_then(|c| c.as_i64()))
                    .map(|code| code as i32 == AUTH_EXPIRED_CODE)
                    .unwrap_or(false);

            if auth_expired && attempt == 0 {
                warn!("Access token expired mid-session, refreshing and retrying {endpoint}");
                self.authenticate().await?;
                continue;
            }

            if !status.is_success() {
                return Err(anyhow!("Request to {} failed ({}): {}", endpoint, status, text));
            }

            return serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse response from {}", endpoint));
        }

        Err(anyhow!("Request to {} failed after token refresh", endpoint))
    }
}

#[async_trait]
impl MarketData for BrokerClient {
    /// Fetch the most recent `lookback` 5-minute candles for a symbol
    async fn candles(&self, symbol: &str, lookback: usize) -> Result<Vec<Candle>> {
        debug!("Fetching {} candles for {}", lookback, symbol);

        let request = HistoryRequest {
            symbol: symbol.to_string(),
            resolution: "5".to_string(),
            countback: lookback,
        };

        let response: HistoryResponse = self.post("/api/v1/charts/history", &request).await?;

        if !response.success {
            return Err(anyhow!(
                "History fetch for {} failed: {} (code: {})",
                symbol,
                response.error_message.unwrap_or_default(),
                response.error_code
            ));
        }

        let rows = response.candles.unwrap_or_default();
        let candles = rows
            .into_iter()
            .filter_map(|row| {
                let timestamp: DateTime<Utc> = Utc.timestamp_opt(row.timestamp, 0).single()?;
                Some(Candle {
                    timestamp,
                    open: row.open,
                    high: row.high,
                    low: row.low,
                    close: row.close,
                    volume: row.volume,
                })
            })
            .collect::<Vec<_>>();

        debug!("Got {} candles for {}", candles.len(), symbol);
        Ok(candles)
    }

    /// Last traded price for a symbol
    async fn last_traded_price(&self, symbol: &str) -> Result<f64> {
        let request = LtpRequest {
            symbol: symbol.to_string(),
        };

        let response: LtpResponse = self.post("/api/v1/quotes/ltp", &request).await?;

        if !response.success {
            return Err(anyhow!(
                "LTP fetch for {} failed: {} (code: {})",
                symbol,
                response.error_message.unwrap_or_default(),
                response.error_code
            ));
        }

        response
            .ltp
            .ok_or_else(|| anyhow!("LTP response for {} carried no price", symbol))
    }
}

#[async_trait]
impl OrderGateway for BrokerClient {
    /// MTF margin quote per share. `Ok(None)` means the broker responded but
    /// has no quote (market closed, symbol not MTF-approved); the caller
    /// applies the fallback margin policy.
    async fn mtf_margin_per_share(&self, symbol: &str, price: f64) -> Result<Option<f64>> {
        let request = MarginQuoteRequest {
            symbol: symbol.to_string(),
            price,
            product: ProductType::Mtf,
        };

        let response: MarginQuoteResponse = self.post("/api/v1/margin/quote", &request).await?;

        if !response.success {
            // No quote is a normal condition, not an error to retry
            debug!(
                "No margin quote for {}: {} (code: {})",
                symbol,
                response.error_message.unwrap_or_default(),
                response.error_code
            );
            return Ok(None);
        }

        Ok(response.margin_per_share.filter(|m| *m > 0.0))
    }

    /// Place a market order. Business rejections come back as errors with the
    /// broker's message verbatim; callers must not retry them.
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck> {
        info!(
            "Placing {} order: {} x{} ({:?})",
            request.side, request.symbol, request.quantity, request.product
        );

        let response: PlaceOrderResponse = self.post("/api/v1/orders", request).await?;

        if !response.success {
            return Err(anyhow!(
                "Order rejected for {}: {} (code: {})",
                request.symbol,
                response.error_message.unwrap_or_default(),
                response.error_code
            ));
        }

        let order_id = response
            .order_id
            .ok_or_else(|| anyhow!("Order accepted but no order id returned"))?;

        info!("Order placed: {}", order_id);
        Ok(OrderAck {
            order_id,
            status: response.order_status.unwrap_or_else(|| "PLACED".to_string()),
        })
    }
}

/// Generate a unique client-side order tag
pub fn order_tag() -> String {
    format!("mtf-{}", &Uuid::new_v4().to_string()[..8])
}
