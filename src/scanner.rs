//! Symbol universe scanning.
//!
//! Each symbol is fetched with retry, run through channel detection and the
//! entry evaluator, and classified. A symbol that keeps failing is recorded
//! as FAILED and the batch moves on; every symbol supplied appears exactly
//! once in the results. An optional second pass opens positions for
//! auto-trade users on ENTRY signals.

use anyhow::Result;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Asia::Kolkata;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::broker::MarketData;
use crate::channels;
use crate::engine::{EngineConfig, EntryOutcome, PositionManager};
use crate::notify;
use crate::retry;
use crate::signals::{self, EntryDecision, EntrySignal};

/// Classification of one scanned symbol, FAILED included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Entry,
    Watchlist,
    NoEntry,
    Failed,
}

impl From<EntrySignal> for ScanStatus {
    fn from(signal: EntrySignal) -> Self {
        match signal {
            EntrySignal::Entry => Self::Entry,
            EntrySignal::Watchlist => Self::Watchlist,
            EntrySignal::NoEntry => Self::NoEntry,
        }
    }
}

/// Per-symbol scan outcome.
#[derive(Debug, Serialize)]
pub struct SymbolResult {
    pub symbol: String,
    pub status: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<EntryDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Batch totals.
#[derive(Debug, Default, Serialize)]
pub struct ScanSummary {
    pub scanned: usize,
    pub entries: usize,
    pub watchlist: usize,
    pub no_entry: usize,
    pub failed: usize,
    /// Positions actually opened by the auto-trade pass.
    pub opened: usize,
}

#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub results: Vec<SymbolResult>,
    pub summary: ScanSummary,
}

/// True during the NSE regular session (09:15-15:30 IST, weekdays).
/// Exchange holidays are not modeled; the broker rejects those orders.
pub fn market_is_open(now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&Kolkata);
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minutes = local.hour() * 60 + local.minute();
    (9 * 60 + 15..=15 * 60 + 30).contains(&minutes)
}

pub struct Scanner {
    market: Arc<dyn MarketData>,
    config: EngineConfig,
}

impl Scanner {
    pub fn new(market: Arc<dyn MarketData>, config: EngineConfig) -> Self {
        Self { market, config }
    }

    /// Scan every symbol, sequentially. Nothing here aborts the batch: a
    /// symbol that exhausts its retries is marked FAILED and skipped.
    pub async fn scan(&self, symbols: &[String]) -> ScanReport {
        let mut results = Vec::with_capacity(symbols.len());
        let mut summary = ScanSummary {
            scanned: symbols.len(),
            ..Default::default()
        };
        info!("Scanning {} symbols", symbols.len());

        for (i, symbol) in symbols.iter().enumerate() {
            if i > 0 && !self.config.scan_pause.is_zero() {
                tokio::time::sleep(self.config.scan_pause).await;
            }
            let result = match self.scan_symbol(symbol).await {
                Ok(result) => result,
                Err(e) => {
                    error!("Scan of {} failed: {:#}", symbol, e);
                    SymbolResult {
                        symbol: symbol.clone(),
                        status: ScanStatus::Failed,
                        last_price: None,
                        decision: None,
                        error: Some(format!("{e:#}")),
                    }
                }
            };
            match result.status {
                ScanStatus::Entry => summary.entries += 1,
                ScanStatus::Watchlist => summary.watchlist += 1,
                ScanStatus::NoEntry => summary.no_entry += 1,
                ScanStatus::Failed => summary.failed += 1,
            }
            results.push(result);
        }

        info!(
            "Scan done: {} entries, {} watchlist, {} no-entry, {} failed",
            summary.entries, summary.watchlist, summary.no_entry, summary.failed
        );
        ScanReport { results, summary }
    }

    async fn scan_symbol(&self, symbol: &str) -> Result<SymbolResult> {
        let lookback = self
            .config
            .channels
            .lookback
            .max(signals::required_history(&self.config.signals));
        let candles = retry::with_backoff(self.config.retry, "scan candle fetch", || {
            self.market.candles(symbol, lookback)
        })
        .await?;

        let channels = channels::detect(&candles, &self.config.channels);
        let decision = signals::evaluate(&candles, &channels, &self.config.signals);
        let last_price = candles.last().map(|c| c.close);

        Ok(SymbolResult {
            symbol: symbol.to_string(),
            status: decision.signal.into(),
            last_price,
            decision: Some(decision),
            error: None,
        })
    }

    /// Scan, then open positions for every auto-trade user on each ENTRY
    /// signal. Entry failures are logged per user and never fail the scan.
    pub async fn scan_and_enter(
        &self,
        symbols: &[String],
        manager: &PositionManager,
    ) -> Result<ScanReport> {
        let mut report = self.scan(symbols).await;
        let users = manager.store().auto_trade_users().await?;

        // Summary goes out regardless of whether entries follow
        let summary = notify::scan_summary_message(
            report.summary.scanned,
            report.summary.entries,
            report.summary.watchlist,
            report.summary.failed,
        );
        for user in &users {
            notify::send_best_effort(
                manager.notifier().as_ref(),
                user.whatsapp_number.as_deref().unwrap_or(""),
                &summary,
            )
            .await;
        }

        if users.is_empty() {
            return Ok(report);
        }
        if !market_is_open(Utc::now()) {
            info!("Market closed, entries skipped");
            return Ok(report);
        }

        for result in &report.results {
            if result.status != ScanStatus::Entry {
                continue;
            }
            let Some(price) = result.last_price else {
                continue;
            };
            for user in &users {
                match manager.open_position(user, &result.symbol, price).await {
                    Ok(EntryOutcome::Opened(_)) => report.summary.opened += 1,
                    Ok(EntryOutcome::Skipped { reason }) => {
                        info!("Entry {} for {} skipped: {}", result.symbol, user.user_id, reason);
                    }
                    Err(e) => {
                        warn!("Entry {} for {} failed: {:#}", result.symbol, user.user_id, e);
                    }
                }
            }
        }
        Ok(report)
    }
}
