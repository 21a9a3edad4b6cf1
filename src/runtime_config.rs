// =============================================================================
// Runtime Configuration — engine settings with validation and atomic save
// =============================================================================
//
// Central configuration hub for the Surge engine. Every tunable parameter
// lives here so that the engine can be reconfigured at runtime without a
// restart. Threshold changes submitted over the API are STAGED and only
// applied at the next scan-cycle boundary, so a single evaluation never sees
// a mix of old and new values.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;
use crate::types::{AccountMode, TradingMode};

/// Candle intervals the tracker accepts.
const SUPPORTED_TIMEFRAMES: &[&str] = &["1m", "5m", "15m", "30m", "1h", "4h"];

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_top_gainers_count() -> u32 {
    20
}

fn default_candle_timeframe() -> String {
    "1h".to_string()
}

fn default_volume_multiplier() -> f64 {
    2.0
}

fn default_volume_time_limit_minutes() -> u32 {
    15
}

fn default_price_change_percent() -> f64 {
    2.0
}

fn default_stop_loss_percent() -> f64 {
    1.5
}

fn default_take_profit_percent() -> f64 {
    5.0
}

fn default_trailing_stop_percent() -> f64 {
    1.0
}

fn default_cooldown_minutes() -> u32 {
    60
}

fn default_min_quote_balance() -> f64 {
    10.0
}

fn default_scan_interval_secs() -> u64 {
    5
}

// =============================================================================
// Thresholds
// =============================================================================

/// Entry and risk parameters read by the decision engine.
///
/// Read-only during a cycle: the coordinator clones the active thresholds at
/// the cycle boundary and every evaluation within the cycle uses that clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// How many top gainers to monitor per cycle.
    #[serde(default = "default_top_gainers_count")]
    pub top_gainers_count: u32,

    /// Candle interval the breakout rule reads (previous vs current candle).
    #[serde(default = "default_candle_timeframe")]
    pub candle_timeframe: String,

    /// Current candle volume must reach prev_volume × this multiplier.
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f64,

    /// The volume/price surge must happen within this many minutes of the
    /// candle opening; later surges are stale.
    #[serde(default = "default_volume_time_limit_minutes")]
    pub volume_time_limit_minutes: u32,

    /// Required price gain over the previous close, in percent.
    #[serde(default = "default_price_change_percent")]
    pub price_change_percent: f64,

    /// Initial stop-loss distance below entry, in percent.
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,

    /// Gain that arms the trailing stop, in percent over entry.
    #[serde(default = "default_take_profit_percent")]
    pub take_profit_percent: f64,

    /// Trailing-stop distance below the highest price since trigger.
    #[serde(default = "default_trailing_stop_percent")]
    pub trailing_stop_percent: f64,

    /// How long a symbol is barred from re-signalling after its position
    /// closes.
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,

    /// Hard time-based exit toggle.
    #[serde(default)]
    pub time_exit_enabled: bool,

    /// Maximum position age in minutes before a forced exit. Must be > 0
    /// when `time_exit_enabled` is set.
    #[serde(default)]
    pub max_trade_duration_minutes: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            top_gainers_count: default_top_gainers_count(),
            candle_timeframe: default_candle_timeframe(),
            volume_multiplier: default_volume_multiplier(),
            volume_time_limit_minutes: default_volume_time_limit_minutes(),
            price_change_percent: default_price_change_percent(),
            stop_loss_percent: default_stop_loss_percent(),
            take_profit_percent: default_take_profit_percent(),
            trailing_stop_percent: default_trailing_stop_percent(),
            cooldown_minutes: default_cooldown_minutes(),
            time_exit_enabled: false,
            max_trade_duration_minutes: 0,
        }
    }
}

impl Thresholds {
    /// Validate at the configuration boundary. Invalid thresholds never
    /// reach the engine.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.top_gainers_count == 0 {
            return Err(EngineError::InvalidThresholds(
                "top_gainers_count must be >= 1".to_string(),
            ));
        }
        if !SUPPORTED_TIMEFRAMES.contains(&self.candle_timeframe.as_str()) {
            return Err(EngineError::InvalidThresholds(format!(
                "unsupported candle_timeframe '{}' (supported: {})",
                self.candle_timeframe,
                SUPPORTED_TIMEFRAMES.join(", ")
            )));
        }
        if self.volume_multiplier <= 0.0 {
            return Err(EngineError::InvalidThresholds(
                "volume_multiplier must be > 0".to_string(),
            ));
        }
        if self.volume_time_limit_minutes < 1 || self.volume_time_limit_minutes > 60 {
            return Err(EngineError::InvalidThresholds(
                "volume_time_limit_minutes must be between 1 and 60".to_string(),
            ));
        }
        if self.price_change_percent < 0.0 {
            return Err(EngineError::InvalidThresholds(
                "price_change_percent must be >= 0".to_string(),
            ));
        }
        if self.stop_loss_percent <= 0.0 {
            return Err(EngineError::InvalidThresholds(
                "stop_loss_percent must be > 0".to_string(),
            ));
        }
        if self.take_profit_percent <= 0.0 {
            return Err(EngineError::InvalidThresholds(
                "take_profit_percent must be > 0".to_string(),
            ));
        }
        if self.trailing_stop_percent <= 0.0 {
            return Err(EngineError::InvalidThresholds(
                "trailing_stop_percent must be > 0".to_string(),
            ));
        }
        if self.time_exit_enabled && self.max_trade_duration_minutes == 0 {
            return Err(EngineError::InvalidThresholds(
                "max_trade_duration_minutes must be > 0 when time_exit_enabled".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Surge engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Current trading mode: Live (entries allowed) or Paused.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Whether running against real funds or simulated: Demo or Live.
    #[serde(default)]
    pub account_mode: AccountMode,

    /// Entry and risk thresholds consumed by the decision engine.
    #[serde(default)]
    pub thresholds: Thresholds,

    /// Minimum free quote balance (USDT) required to open a position.
    #[serde(default = "default_min_quote_balance")]
    pub min_quote_balance: f64,

    /// Seconds between scan cycles.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            thresholds: Thresholds::default(),
            min_quote_balance: default_min_quote_balance(),
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config
            .thresholds
            .validate()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid thresholds in {}", path.display()))?;

        info!(
            path = %path.display(),
            trading_mode = %config.trading_mode,
            account_mode = %config.account_mode,
            timeframe = %config.thresholds.candle_timeframe,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.thresholds.top_gainers_count, 20);
        assert_eq!(cfg.thresholds.candle_timeframe, "1h");
        assert!((cfg.thresholds.volume_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.thresholds.volume_time_limit_minutes, 15);
        assert_eq!(cfg.thresholds.cooldown_minutes, 60);
        assert!(!cfg.thresholds.time_exit_enabled);
        assert!((cfg.min_quote_balance - 10.0).abs() < f64::EPSILON);
        assert!(cfg.thresholds.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.thresholds.top_gainers_count, 20);
        assert_eq!(cfg.scan_interval_secs, 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "thresholds": { "volume_multiplier": 3.5 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert!((cfg.thresholds.volume_multiplier - 3.5).abs() < f64::EPSILON);
        assert_eq!(cfg.thresholds.cooldown_minutes, 60);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
        assert_eq!(cfg.thresholds, cfg2.thresholds);
    }

    #[test]
    fn rejects_non_positive_multiplier() {
        let mut t = Thresholds::default();
        t.volume_multiplier = 0.0;
        assert!(t.validate().is_err());
        t.volume_multiplier = -1.0;
        assert!(t.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_risk_percentages() {
        for field in ["sl", "tp", "trail"] {
            let mut t = Thresholds::default();
            match field {
                "sl" => t.stop_loss_percent = 0.0,
                "tp" => t.take_profit_percent = -2.0,
                _ => t.trailing_stop_percent = 0.0,
            }
            assert!(t.validate().is_err(), "expected {field} rejection");
        }
    }

    #[test]
    fn rejects_out_of_range_time_limit() {
        let mut t = Thresholds::default();
        t.volume_time_limit_minutes = 0;
        assert!(t.validate().is_err());
        t.volume_time_limit_minutes = 61;
        assert!(t.validate().is_err());
        t.volume_time_limit_minutes = 60;
        assert!(t.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_timeframe() {
        let mut t = Thresholds::default();
        t.candle_timeframe = "7m".to_string();
        assert!(t.validate().is_err());
    }

    #[test]
    fn time_exit_requires_duration() {
        let mut t = Thresholds::default();
        t.time_exit_enabled = true;
        assert!(t.validate().is_err());
        t.max_trade_duration_minutes = 120;
        assert!(t.validate().is_ok());
    }
}
