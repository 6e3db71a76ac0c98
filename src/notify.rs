//! Trade notifications.
//!
//! Notifications are strictly best-effort: the engine logs a failed send and
//! carries on, so a WhatsApp outage can never block an entry or an exit.
//! Message bodies are built by pure functions so the templates are testable
//! without a gateway.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

use crate::types::{ExitSignal, ExitType, Position};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<()>;
}

/// Send a message, logging failure instead of propagating it.
pub async fn send_best_effort(notifier: &dyn Notifier, to: &str, body: &str) {
    if to.is_empty() {
        return;
    }
    if let Err(e) = notifier.send(to, body).await {
        warn!("Notification to {} failed (ignored): {:#}", to, e);
    }
}

// ============================================================================
// Message templates
// ============================================================================

pub fn entry_message(position: &Position) -> String {
    let margin_note = if position.margin_estimated {
        " (margin estimated)"
    } else {
        ""
    };
    format!(
        "BUY {} x{} @ {:.2}\nMargin: {:.2}{} | Leverage: {:.1}x",
        position.symbol,
        position.entry_quantity,
        position.entry_price,
        position.margin_required,
        margin_note,
        position.leverage,
    )
}

pub fn exit_message(position: &Position, exit: &ExitSignal) -> String {
    let verdict = match exit.exit_type {
        ExitType::StopLoss => "STOPPED OUT",
        ExitType::RsiReversal | ExitType::TrailingStop => "EXITED",
    };
    format!(
        "{} {} x{} @ {:.2}\nP&L: {:+.2} ({:+.2}%)\nReason: {}",
        verdict,
        position.symbol,
        position.entry_quantity,
        exit.current_price,
        exit.pnl_amount,
        exit.pnl_percentage,
        exit.exit_reason,
    )
}

pub fn scan_summary_message(scanned: usize, entries: usize, watchlist: usize, failed: usize) -> String {
    format!(
        "Scan complete: {} symbols | {} entries, {} watchlist, {} failed",
        scanned, entries, watchlist, failed
    )
}

// ============================================================================
// WhatsApp gateway
// ============================================================================

#[derive(Serialize)]
struct OutboundMessage<'a> {
    to: &'a str,
    body: &'a str,
}

/// WhatsApp gateway client (simple token-authenticated message API).
pub struct WhatsAppNotifier {
    client: Client,
    api_url: String,
    api_token: String,
}

impl WhatsAppNotifier {
    /// Create from `WHATSAPP_API_URL` and `WHATSAPP_API_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let api_url = std::env::var("WHATSAPP_API_URL")
            .context("WHATSAPP_API_URL environment variable not set")?;
        let api_token = std::env::var("WHATSAPP_API_TOKEN")
            .context("WHATSAPP_API_TOKEN environment variable not set")?;
        Ok(Self::new(api_url, api_token))
    }

    pub fn new(api_url: String, api_token: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            api_url,
            api_token,
        }
    }
}

#[async_trait]
impl Notifier for WhatsAppNotifier {
    async fn send(&self, to: &str, body: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/messages", self.api_url))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .json(&OutboundMessage { to, body })
            .send()
            .await
            .context("Failed to send WhatsApp message")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("WhatsApp send failed ({}): {}", status, text));
        }
        Ok(())
    }
}

/// Discards everything. Used when no gateway is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, _to: &str, _body: &str) -> Result<()> {
        Ok(())
    }
}

/// Capturing notifier for tests.
#[derive(Default)]
pub struct MemoryNotifier {
    pub sent: tokio::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, to: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .await
            .push((to.to_string(), body.to_string()));
        Ok(())
    }
}
