//! Broker gateway data models.
//!
//! Request and response types for the broker's REST API. Every response
//! carries the `success`/`errorCode`/`errorMessage` envelope; business
//! failures arrive inside a 200, so HTTP status alone is never trusted.

use serde::{Deserialize, Serialize};

/// Envelope error code the gateway uses for an expired access token.
pub const AUTH_EXPIRED_CODE: i32 = 401;

// ============================================================================
// Authentication
// ============================================================================

/// Request body for access-token issuance
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub client_id: String,
    pub secret_key: String,
}

/// Response from the token endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub success: bool,
    pub error_code: i32,
    pub error_message: Option<String>,
}

// ============================================================================
// Market data
// ============================================================================

/// Request for historical candles
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub symbol: String,
    /// Bar interval, e.g. "5" for 5-minute bars
    pub resolution: String,
    /// Number of most recent bars wanted
    pub countback: usize,
}

/// One OHLC row on the wire; timestamp is epoch seconds
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CandleRow {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: u64,
}

/// Response from the history endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub candles: Option<Vec<CandleRow>>,
    pub success: bool,
    pub error_code: i32,
    pub error_message: Option<String>,
}

/// Request for last traded price
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LtpRequest {
    pub symbol: String,
}

/// Response from the LTP endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LtpResponse {
    pub ltp: Option<f64>,
    pub success: bool,
    pub error_code: i32,
    pub error_message: Option<String>,
}

// ============================================================================
// Margin
// ============================================================================

/// Request for an MTF margin quote
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginQuoteRequest {
    pub symbol: String,
    pub price: f64,
    pub product: ProductType,
}

/// Response from the margin endpoint. `margin_per_share` is absent when the
/// broker has no quote (market closed, symbol not MTF-approved).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginQuoteResponse {
    pub margin_per_share: Option<f64>,
    #[serde(default)]
    pub mtf_approved: bool,
    pub success: bool,
    pub error_code: i32,
    pub error_message: Option<String>,
}

// ============================================================================
// Orders
// ============================================================================

/// Order side codes used by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OrderSide {
    Buy = 1,
    Sell = 2,
}

impl Serialize for OrderSide {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i32(*self as i32)
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Product type; MTF is the leveraged funding product this system trades
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    Mtf,
    Delivery,
}

/// Request to place a market order
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub product: ProductType,
    /// Unique client-side identifier for this order
    pub client_tag: String,
}

/// Response from placing an order
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderResponse {
    pub order_id: Option<String>,
    #[serde(default)]
    pub order_status: Option<String>,
    pub success: bool,
    pub error_code: i32,
    pub error_message: Option<String>,
}

/// Confirmed order acknowledgement handed back to the lifecycle manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
}
