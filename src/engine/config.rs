//! Engine configuration.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::channels::ChannelConfig;
use crate::retry::RetryPolicy;
use crate::signals::SignalConfig;
use crate::sizing::FALLBACK_MARGIN_PCT;

/// Tunables shared by the scanner, lifecycle manager and monitor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub channels: ChannelConfig,
    pub signals: SignalConfig,
    pub retry: RetryPolicy,
    /// Margin percentage assumed when the broker has no quote.
    pub fallback_margin_pct: f64,
    /// Pause between symbols during a scan, for gateway rate limits.
    pub scan_pause: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channels: ChannelConfig::default(),
            signals: SignalConfig::default(),
            retry: RetryPolicy::default(),
            fallback_margin_pct: FALLBACK_MARGIN_PCT,
            scan_pause: Duration::from_millis(200),
        }
    }
}

impl EngineConfig {
    /// Defaults with optional environment overrides.
    ///
    /// Recognized:
    /// - `MTF_FALLBACK_MARGIN_PCT` - fallback margin percentage
    /// - `MTF_MAX_RETRIES` - retry attempts for data fetches
    /// - `MTF_SCAN_PAUSE_MS` - pause between scanned symbols
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("MTF_FALLBACK_MARGIN_PCT") {
            config.fallback_margin_pct = raw
                .parse()
                .context("MTF_FALLBACK_MARGIN_PCT must be a number")?;
        }
        if let Ok(raw) = std::env::var("MTF_MAX_RETRIES") {
            config.retry.max_attempts = raw.parse().context("MTF_MAX_RETRIES must be an integer")?;
        }
        if let Ok(raw) = std::env::var("MTF_SCAN_PAUSE_MS") {
            let ms: u64 = raw.parse().context("MTF_SCAN_PAUSE_MS must be an integer")?;
            config.scan_pause = Duration::from_millis(ms);
        }

        Ok(config)
    }
}
