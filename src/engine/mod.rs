//! Position lifecycle and exit-monitoring engine.

pub mod config;
pub mod lifecycle;
pub mod monitor;

pub use config::EngineConfig;
pub use lifecycle::{EntryOutcome, PositionManager};
pub use monitor::{
    analyze_for_exit, ExitCheck, Monitor, MonitorInput, MonitorReport, TrailingLevel,
    TRAILING_LEVELS,
};
