//! Broker gateway integration: REST client, wire models and the port
//! traits the rest of the system depends on.
//!
//! The traits keep the scanner, lifecycle manager and monitor testable with
//! in-memory fakes; `BrokerClient` is the production implementation of both.

pub mod client;
pub mod models;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::Candle;

pub use client::{order_tag, BrokerClient};
pub use models::{OrderAck, OrderSide, PlaceOrderRequest, ProductType};

/// Market data access: historical candles and live prices.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn candles(&self, symbol: &str, lookback: usize) -> Result<Vec<Candle>>;
    async fn last_traded_price(&self, symbol: &str) -> Result<f64>;
}

/// Order placement and margin quoting.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// `Ok(None)` means the broker has no quote; callers fall back to the
    /// estimated-margin policy.
    async fn mtf_margin_per_share(&self, symbol: &str, price: f64) -> Result<Option<f64>>;
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck>;
}
