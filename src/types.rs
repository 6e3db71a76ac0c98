//! Shared domain types for scanning, sizing and position tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One OHLC bar. Immutable, ordered by timestamp, one per bar interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Candle {
    /// Convenience constructor for flat bars (mostly tests and fixtures)
    pub fn flat(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0,
        }
    }
}

/// Position lifecycle status.
///
/// `Stopped` is a terminal variant of `Exited` distinguished only by how the
/// exit was triggered (stop loss); both reject further writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Active,
    Exited,
    Stopped,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Exited => write!(f, "EXITED"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitType {
    StopLoss,
    RsiReversal,
    TrailingStop,
}

impl std::fmt::Display for ExitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::RsiReversal => write!(f, "RSI_REVERSAL"),
            Self::TrailingStop => write!(f, "TRAILING_STOP"),
        }
    }
}

/// Exit decision produced by the monitoring engine.
///
/// Never persisted directly; it is the input to the lifecycle manager's
/// close-position transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub exit_type: ExitType,
    pub exit_reason: String,
    pub current_price: f64,
    pub pnl_amount: f64,
    pub pnl_percentage: f64,
}

/// An open (or closed) leveraged position for one (user, symbol) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: String,
    pub symbol: String,
    pub entry_price: f64,
    pub entry_quantity: u32,
    pub entry_time: DateTime<Utc>,
    pub current_price: f64,
    pub status: PositionStatus,
    /// Index of the highest trailing-ladder threshold crossed so far (0..=14).
    /// Monotonically non-decreasing while the position is ACTIVE.
    pub trailing_level: u8,
    pub pnl_amount: f64,
    pub pnl_percentage: f64,
    /// Leverage at entry: price / margin per share.
    pub leverage: f64,
    /// Margin the broker blocked for the entry.
    pub margin_required: f64,
    /// True when the margin came from the fallback policy rather than a
    /// live broker quote.
    pub margin_estimated: bool,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
}

impl Position {
    /// Unrealized P&L for a long position at `price`, in currency.
    pub fn pnl_amount_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.entry_quantity as f64
    }

    /// Unrealized P&L for a long position at `price`, in percent of entry.
    pub fn pnl_percentage_at(&self, price: f64) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0
    }
}

/// Per-user trading preferences, read from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPrefs {
    pub user_id: String,
    /// Capital allocated per trade, in currency.
    pub capital_allocation: f64,
    /// Stop loss percent. The stored preference is authoritative; this
    /// default applies only when no preference row exists.
    pub stop_loss_pct: f64,
    pub auto_trade_enabled: bool,
    /// Max simultaneously open positions for this user.
    pub max_open_positions: u32,
    pub whatsapp_number: Option<String>,
}

impl Default for UserPrefs {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            capital_allocation: 0.0,
            stop_loss_pct: 2.5,
            auto_trade_enabled: false,
            max_open_positions: 5,
            whatsapp_number: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position(entry_price: f64, quantity: u32) -> Position {
        Position {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            symbol: "RELIANCE".to_string(),
            entry_price,
            entry_quantity: quantity,
            entry_time: Utc::now(),
            current_price: entry_price,
            status: PositionStatus::Active,
            trailing_level: 0,
            pnl_amount: 0.0,
            pnl_percentage: 0.0,
            leverage: 5.0,
            margin_required: entry_price * quantity as f64 / 5.0,
            margin_estimated: false,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        }
    }

    #[test]
    fn test_pnl_math() {
        let pos = sample_position(100.0, 10);
        assert_eq!(pos.pnl_amount_at(103.0), 30.0);
        assert_eq!(pos.pnl_percentage_at(103.0), 3.0);
        assert_eq!(pos.pnl_percentage_at(97.5), -2.5);
    }

    #[test]
    fn test_zero_entry_price_pnl_is_zero() {
        let pos = sample_position(0.0, 10);
        assert_eq!(pos.pnl_percentage_at(50.0), 0.0);
    }

    #[test]
    fn test_terminal_status() {
        assert!(!PositionStatus::Active.is_terminal());
        assert!(PositionStatus::Exited.is_terminal());
        assert!(PositionStatus::Stopped.is_terminal());
    }
}
