//! Entry signal evaluation.
//!
//! Six base conditions gate a long entry; all must hold for ENTRY, four or
//! more put the symbol on the WATCHLIST. Every condition is evaluated
//! independently and reported in the output so a decision is auditable
//! after the fact.

use serde::{Deserialize, Serialize};

use crate::channels::{self, Channel};
use crate::indicators;
use crate::types::Candle;

/// Rule-set parameters.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub ema_period: usize,
    pub rsi_period: usize,
    pub rsi_sma_period: usize,
    /// RSI entry band, inclusive.
    pub rsi_min: f64,
    pub rsi_max: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    /// Max consecutive positive histogram bars before a move counts as
    /// over-extended.
    pub max_histogram_run: usize,
    /// Required clearance below the nearest resistance band, percent.
    pub min_resistance_distance_pct: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            ema_period: 50,
            rsi_period: 14,
            rsi_sma_period: 14,
            rsi_min: 50.0,
            rsi_max: 65.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            max_histogram_run: 3,
            min_resistance_distance_pct: 1.5,
        }
    }
}

/// Closed classification of a scanned symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntrySignal {
    Entry,
    Watchlist,
    NoEntry,
}

impl std::fmt::Display for EntrySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "ENTRY"),
            Self::Watchlist => write!(f, "WATCHLIST"),
            Self::NoEntry => write!(f, "NO_ENTRY"),
        }
    }
}

/// One independently evaluated entry condition.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionCheck {
    pub name: &'static str,
    pub passed: bool,
    pub weight: u32,
    pub detail: String,
}

/// Full evaluator output for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct EntryDecision {
    pub signal: EntrySignal,
    /// Weighted share of satisfied conditions, 0-100.
    pub confidence: u32,
    pub conditions: Vec<ConditionCheck>,
    pub reasoning: String,
}

/// Latest-bar indicator values the rule set runs against.
#[derive(Debug, Clone)]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub ema: f64,
    pub rsi: f64,
    pub rsi_sma: f64,
    pub macd: f64,
    pub macd_signal: f64,
    /// Consecutive positive histogram bars ending at the latest bar.
    pub histogram_run: usize,
}

/// Minimum history the evaluator needs before it can produce indicator
/// values for the latest bar.
pub fn required_history(config: &SignalConfig) -> usize {
    let rsi_chain = config.rsi_period + config.rsi_sma_period;
    let macd_chain = config.macd_slow + config.macd_signal;
    config.ema_period.max(rsi_chain).max(macd_chain) + 1
}

/// Compute the latest-bar snapshot, or `None` when history is too short or
/// the indicators have not warmed up.
pub fn snapshot(candles: &[Candle], config: &SignalConfig) -> Option<IndicatorSnapshot> {
    if candles.len() < required_history(config) {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let last = closes.len() - 1;

    let ema = indicators::ema(&closes, config.ema_period)[last];
    let rsi_series = indicators::rsi(&closes, config.rsi_period);
    let rsi = rsi_series[last];
    let rsi_sma = indicators::rsi_sma(&rsi_series, config.rsi_sma_period)[last];
    let macd = indicators::macd(
        &closes,
        config.macd_fast,
        config.macd_slow,
        config.macd_signal,
    );

    let values = [
        ema,
        rsi,
        rsi_sma,
        macd.macd[last],
        macd.signal[last],
    ];
    if values.iter().any(|v| v.is_nan()) {
        return None;
    }

    Some(IndicatorSnapshot {
        close: closes[last],
        ema,
        rsi,
        rsi_sma,
        macd: macd.macd[last],
        macd_signal: macd.signal[last],
        histogram_run: indicators::consecutive_positive_histogram(&macd.histogram),
    })
}

/// True when price sits at least `min_pct` percent below the nearest
/// resistance band, or no resistance band exists above it.
pub fn resistance_clearance(channels: &[Channel], price: f64, min_pct: f64) -> (bool, String) {
    match channels::nearest_resistance(channels, price) {
        Some(band) => {
            let distance_pct = if price > 0.0 {
                (band.bottom_price - price) / price * 100.0
            } else {
                0.0
            };
            (
                distance_pct >= min_pct,
                format!(
                    "nearest resistance {:.2} is {:.2}% above (need {:.2}%)",
                    band.bottom_price, distance_pct, min_pct
                ),
            )
        }
        None => (true, "no resistance band above price".to_string()),
    }
}

/// Classify from evaluated conditions: ENTRY needs all, WATCHLIST needs 4+.
pub fn classify(conditions: &[ConditionCheck]) -> (EntrySignal, u32) {
    let passed = conditions.iter().filter(|c| c.passed).count();
    let total_weight: u32 = conditions.iter().map(|c| c.weight).sum();
    let passed_weight: u32 = conditions.iter().filter(|c| c.passed).map(|c| c.weight).sum();
    let confidence = if total_weight == 0 {
        0
    } else {
        passed_weight * 100 / total_weight
    };

    let signal = if passed == conditions.len() && !conditions.is_empty() {
        EntrySignal::Entry
    } else if passed >= 4 {
        EntrySignal::Watchlist
    } else {
        EntrySignal::NoEntry
    };
    (signal, confidence)
}

/// Run the rule set against a precomputed snapshot.
pub fn evaluate_snapshot(
    snap: &IndicatorSnapshot,
    channels: &[Channel],
    config: &SignalConfig,
) -> EntryDecision {
    let (clear, clearance_detail) = resistance_clearance(
        channels,
        snap.close,
        config.min_resistance_distance_pct,
    );

    let conditions = vec![
        ConditionCheck {
            name: "trend",
            passed: snap.close > snap.ema,
            weight: 25,
            detail: format!("close {:.2} vs EMA{} {:.2}", snap.close, config.ema_period, snap.ema),
        },
        ConditionCheck {
            name: "rsi_band",
            passed: snap.rsi >= config.rsi_min && snap.rsi <= config.rsi_max,
            weight: 15,
            detail: format!(
                "RSI {:.1} in [{:.0}, {:.0}]",
                snap.rsi, config.rsi_min, config.rsi_max
            ),
        },
        ConditionCheck {
            name: "rsi_momentum",
            passed: snap.rsi > snap.rsi_sma,
            weight: 15,
            detail: format!("RSI {:.1} vs RSI-SMA {:.1}", snap.rsi, snap.rsi_sma),
        },
        ConditionCheck {
            name: "macd_cross",
            passed: snap.macd > snap.macd_signal,
            weight: 20,
            detail: format!("MACD {:.4} vs signal {:.4}", snap.macd, snap.macd_signal),
        },
        ConditionCheck {
            name: "not_overextended",
            passed: snap.histogram_run <= config.max_histogram_run,
            weight: 10,
            detail: format!(
                "{} consecutive positive histogram bars (max {})",
                snap.histogram_run, config.max_histogram_run
            ),
        },
        ConditionCheck {
            name: "resistance_clearance",
            passed: clear,
            weight: 15,
            detail: clearance_detail,
        },
    ];

    let (signal, confidence) = classify(&conditions);
    let failed: Vec<&str> = conditions
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.name)
        .collect();
    let reasoning = match signal {
        EntrySignal::Entry => "all entry conditions satisfied".to_string(),
        _ => format!(
            "{} of {} conditions satisfied; failing: {}",
            conditions.len() - failed.len(),
            conditions.len(),
            failed.join(", ")
        ),
    };

    EntryDecision {
        signal,
        confidence,
        conditions,
        reasoning,
    }
}

/// Evaluate a symbol from raw candles and its detected channels.
pub fn evaluate(candles: &[Candle], channels: &[Channel], config: &SignalConfig) -> EntryDecision {
    match snapshot(candles, config) {
        Some(snap) => evaluate_snapshot(&snap, channels, config),
        None => EntryDecision {
            signal: EntrySignal::NoEntry,
            confidence: 0,
            conditions: Vec::new(),
            reasoning: format!(
                "insufficient history: {} candles, need {}",
                candles.len(),
                required_history(config)
            ),
        },
    }
}
