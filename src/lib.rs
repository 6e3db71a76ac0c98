//! Automated equities trading assistant.
//!
//! Scans a stock universe for technical entry signals, sizes and places
//! leveraged MTF orders through a broker gateway, and monitors open
//! positions against stop-loss, RSI-reversal and a 15-level trailing-stop
//! ladder.

pub mod api;
pub mod broker;
pub mod channels;
pub mod engine;
pub mod indicators;
pub mod notify;
pub mod retry;
pub mod scanner;
pub mod signals;
pub mod sizing;
pub mod store;
pub mod types;

pub use engine::{EngineConfig, Monitor, PositionManager, TRAILING_LEVELS};
pub use scanner::{ScanReport, Scanner};
pub use types::{Candle, ExitSignal, Position, PositionStatus, UserPrefs};
