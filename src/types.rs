// =============================================================================
// Shared types used across the Surge breakout engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Free/locked amounts of one asset, as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine may open new positions.
///
/// Paused stops entries only. An open position keeps being evaluated against
/// its stops on every cycle regardless of mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    #[default]
    Paused,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Live => "Live",
            Self::Paused => "Paused",
        })
    }
}

/// Real funds or simulated fills.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    #[default]
    Demo,
    Live,
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Demo => "Demo",
            Self::Live => "Live",
        })
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TimeExit,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::StopLoss => "StopLoss",
            Self::TrailingStop => "TrailingStop",
            Self::TimeExit => "TimeExit",
            Self::Manual => "Manual",
        })
    }
}
