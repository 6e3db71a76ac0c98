//! Exit monitoring: the per-position state machine.
//!
//! Each cycle every ACTIVE position is checked, in priority order, for an
//! RSI momentum reversal, the user's stop loss, and the trailing-profit
//! ladder. `analyze_for_exit` is pure; `Monitor::run_cycle` wires it to
//! market data and the store, isolating per-position failures so one bad
//! symbol never stalls the rest.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::broker::MarketData;
use crate::engine::config::EngineConfig;
use crate::engine::lifecycle::PositionManager;
use crate::indicators;
use crate::retry;
use crate::types::{Candle, ExitSignal, ExitType, Position, UserPrefs};

/// One rung of the trailing-profit ladder.
#[derive(Debug, Clone, Copy)]
pub struct TrailingLevel {
    /// Profit that must be reached to arm this rung.
    pub profit_threshold_pct: f64,
    /// Minimum profit protected once armed.
    pub locked_profit_pct: f64,
}

/// The trailing ladder. Both columns are strictly increasing; a position's
/// `trailing_level` indexes this table. Level 0 is also the initial state
/// and locks nothing until level 1 arms.
pub const TRAILING_LEVELS: [TrailingLevel; 15] = [
    TrailingLevel { profit_threshold_pct: 1.5, locked_profit_pct: 0.5 },
    TrailingLevel { profit_threshold_pct: 2.0, locked_profit_pct: 1.0 },
    TrailingLevel { profit_threshold_pct: 2.5, locked_profit_pct: 1.5 },
    TrailingLevel { profit_threshold_pct: 3.0, locked_profit_pct: 2.0 },
    TrailingLevel { profit_threshold_pct: 4.0, locked_profit_pct: 2.8 },
    TrailingLevel { profit_threshold_pct: 5.0, locked_profit_pct: 3.5 },
    TrailingLevel { profit_threshold_pct: 6.0, locked_profit_pct: 4.5 },
    TrailingLevel { profit_threshold_pct: 8.0, locked_profit_pct: 6.0 },
    TrailingLevel { profit_threshold_pct: 10.0, locked_profit_pct: 7.5 },
    TrailingLevel { profit_threshold_pct: 12.0, locked_profit_pct: 9.5 },
    TrailingLevel { profit_threshold_pct: 15.0, locked_profit_pct: 12.0 },
    TrailingLevel { profit_threshold_pct: 18.0, locked_profit_pct: 14.5 },
    TrailingLevel { profit_threshold_pct: 21.0, locked_profit_pct: 17.0 },
    TrailingLevel { profit_threshold_pct: 25.0, locked_profit_pct: 20.0 },
    TrailingLevel { profit_threshold_pct: 30.0, locked_profit_pct: 24.0 },
];

/// Live inputs for one exit check.
#[derive(Debug, Clone, Copy)]
pub struct MonitorInput {
    pub current_price: f64,
    pub rsi: f64,
    pub rsi_sma: f64,
}

impl MonitorInput {
    /// Derive the check inputs from a candle series. Returns None when the
    /// series is too short for the RSI warmup.
    pub fn from_candles(candles: &[Candle], rsi_period: usize, rsi_sma_period: usize) -> Option<Self> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let rsi_series = indicators::rsi(&closes, rsi_period);
        let rsi_sma_series = indicators::rsi_sma(&rsi_series, rsi_sma_period);

        let current_price = *closes.last()?;
        let rsi = *rsi_series.last()?;
        let rsi_sma = *rsi_sma_series.last()?;
        if rsi.is_nan() || rsi_sma.is_nan() {
            return None;
        }
        Some(Self {
            current_price,
            rsi,
            rsi_sma,
        })
    }
}

/// Outcome of one exit check.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitCheck {
    /// Keep holding; `trailing_level` is the (possibly advanced) level to
    /// persist.
    Hold { trailing_level: u8 },
    Exit(ExitSignal),
}

/// Highest rung whose threshold the given profit has reached.
fn level_for_profit(pnl_pct: f64) -> u8 {
    let mut level = 0u8;
    for (i, rung) in TRAILING_LEVELS.iter().enumerate() {
        if pnl_pct >= rung.profit_threshold_pct {
            level = i as u8;
        } else {
            break;
        }
    }
    level
}

/// Evaluate one ACTIVE position against the exit conditions.
///
/// Priority order, first match wins:
/// 1. RSI reversal (RSI below its own SMA) regardless of P&L sign
/// 2. Stop loss at the user's configured percentage
/// 3. Trailing ladder: advance the rung if profit crossed the next
///    threshold, exit if profit fell through the armed rung's locked floor
///
/// The returned level already includes the high-water mark against the
/// position's stored level, so a stale price can never propose a rollback.
pub fn analyze_for_exit(position: &Position, input: &MonitorInput, stop_loss_pct: f64) -> ExitCheck {
    let pnl_amount = position.pnl_amount_at(input.current_price);
    let pnl_pct = position.pnl_percentage_at(input.current_price);

    // 1. Momentum reversal overrides any profit-lock state
    if input.rsi < input.rsi_sma {
        return ExitCheck::Exit(ExitSignal {
            exit_type: ExitType::RsiReversal,
            exit_reason: format!(
                "RSI reversal: RSI {:.1} below its SMA {:.1}",
                input.rsi, input.rsi_sma
            ),
            current_price: input.current_price,
            pnl_amount,
            pnl_percentage: pnl_pct,
        });
    }

    // 2. Stop loss
    if pnl_pct <= -stop_loss_pct {
        return ExitCheck::Exit(ExitSignal {
            exit_type: ExitType::StopLoss,
            exit_reason: format!(
                "stop loss hit: {:.2}% at or below -{:.2}%",
                pnl_pct, stop_loss_pct
            ),
            current_price: input.current_price,
            pnl_amount,
            pnl_percentage: pnl_pct,
        });
    }

    // 3. Trailing ladder with high-water mark. A corrupt stored level is
    // clamped to the top rung rather than indexing out of the table.
    let max_level = (TRAILING_LEVELS.len() - 1) as u8;
    let level = level_for_profit(pnl_pct).max(position.trailing_level.min(max_level));

    if level > 0 {
        let rung = TRAILING_LEVELS[level as usize];
        if pnl_pct < rung.locked_profit_pct {
            // Report the locked floor, not the live print: the floor is
            // what the ladder guaranteed when the rung armed.
            let locked_amount =
                position.entry_price * position.entry_quantity as f64 * rung.locked_profit_pct
                    / 100.0;
            return ExitCheck::Exit(ExitSignal {
                exit_type: ExitType::TrailingStop,
                exit_reason: format!(
                    "trailing stop: profit {:.2}% fell through locked {:.2}% (level {})",
                    pnl_pct, rung.locked_profit_pct, level
                ),
                current_price: input.current_price,
                pnl_amount: locked_amount,
                pnl_percentage: rung.locked_profit_pct,
            });
        }
    }

    ExitCheck::Hold {
        trailing_level: level,
    }
}

// ============================================================================
// Cycle orchestration
// ============================================================================

/// Summary of one monitoring cycle.
#[derive(Debug, Default, Serialize)]
pub struct MonitorReport {
    pub checked: usize,
    pub held: usize,
    pub exited: usize,
    pub failed: usize,
    pub failures: Vec<String>,
}

/// Drives the exit checks across all open positions.
pub struct Monitor {
    market: Arc<dyn MarketData>,
    manager: Arc<PositionManager>,
    config: EngineConfig,
}

impl Monitor {
    pub fn new(market: Arc<dyn MarketData>, manager: Arc<PositionManager>, config: EngineConfig) -> Self {
        Self {
            market,
            manager,
            config,
        }
    }

    /// Run one cycle over every ACTIVE position. Per-position failures are
    /// recorded and the cycle continues.
    pub async fn run_cycle(&self) -> Result<MonitorReport> {
        let positions = self.manager.store().open_positions().await?;
        let mut report = MonitorReport {
            checked: positions.len(),
            ..Default::default()
        };
        info!("Monitoring cycle: {} open positions", positions.len());

        for position in positions {
            match self.check_position(&position).await {
                Ok(true) => report.exited += 1,
                Ok(false) => report.held += 1,
                Err(e) => {
                    error!("Monitoring {} for {} failed: {:#}", position.symbol, position.user_id, e);
                    report.failed += 1;
                    report.failures.push(format!("{}: {:#}", position.symbol, e));
                }
            }
        }

        info!(
            "Monitoring cycle done: {} held, {} exited, {} failed",
            report.held, report.exited, report.failed
        );
        Ok(report)
    }

    /// Check one position. Returns true when the position was exited.
    async fn check_position(&self, position: &Position) -> Result<bool> {
        let lookback = self.config.signals.rsi_period + self.config.signals.rsi_sma_period + 60;
        let candles = retry::with_backoff(self.config.retry, "monitor candle fetch", || {
            self.market.candles(&position.symbol, lookback)
        })
        .await?;

        let mut input = MonitorInput::from_candles(
            &candles,
            self.config.signals.rsi_period,
            self.config.signals.rsi_sma_period,
        )
        .ok_or_else(|| anyhow!("insufficient history for {}", position.symbol))?;

        // Prefer the live print over the last candle close; if the quote
        // endpoint is down the close is good enough for this cycle.
        match retry::with_backoff(self.config.retry, "ltp fetch", || {
            self.market.last_traded_price(&position.symbol)
        })
        .await
        {
            Ok(ltp) if ltp > 0.0 => input.current_price = ltp,
            Ok(_) => {}
            Err(e) => debug!("LTP for {} unavailable ({:#}), using last close", position.symbol, e),
        }

        let stop_loss_pct = self
            .manager
            .store()
            .user_prefs(&position.user_id)
            .await?
            .map(|p| p.stop_loss_pct)
            .unwrap_or_else(|| UserPrefs::default().stop_loss_pct);

        match analyze_for_exit(position, &input, stop_loss_pct) {
            ExitCheck::Hold { trailing_level } => {
                let persisted = self
                    .manager
                    .store()
                    .update_monitoring(
                        position.id,
                        input.current_price,
                        position.pnl_amount_at(input.current_price),
                        position.pnl_percentage_at(input.current_price),
                        trailing_level,
                    )
                    .await?;
                debug!(
                    "{}: HOLD at {:.2} ({:+.2}%), level {}",
                    position.symbol,
                    input.current_price,
                    position.pnl_percentage_at(input.current_price),
                    persisted
                );
                Ok(false)
            }
            ExitCheck::Exit(exit) => {
                info!("{}: EXIT ({}) - {}", position.symbol, exit.exit_type, exit.exit_reason);
                self.manager.close_position(position, &exit).await?;
                Ok(true)
            }
        }
    }
}
