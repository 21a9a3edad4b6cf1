// =============================================================================
// Central Application State — Surge Breakout Engine
// =============================================================================
//
// One Arc<AppState> ties every subsystem together: configuration, the candle
// tracker, the decision engine (monitors, cooldowns, position engine), the
// trade log, cached balances, the last cycle result, and the error/alert
// surfaces. `build_snapshot` freezes all of it into one Serialize payload for
// the REST state endpoint and the WebSocket feed.
//
// Shared mutation goes through parking_lot locks; the AtomicU64 state version
// is the lock-free change signal the feed polls.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::cooldown::CooldownRegistry;
use crate::cycle::{CycleResult, MarketRow};
use crate::error::CloseAlert;
use crate::history::{HistoryStats, TradeHistory, TradeRecord};
use crate::market_data::CandleTracker;
use crate::monitor::SymbolMonitor;
use crate::position_engine::{Position, PositionEngine};
use crate::runtime_config::{RuntimeConfig, Thresholds};
use crate::types::BalanceInfo;

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Seconds between klines fetches for the same symbol.
const CANDLE_FETCH_TTL_SECS: u64 = 10;
/// Trade records included in a dashboard snapshot.
const SNAPSHOT_HISTORY_COUNT: usize = 100;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful state mutation. The WebSocket feed uses this to detect
    /// changes and push updates.
    pub state_version: AtomicU64,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    /// Threshold update staged over the API, applied at the next cycle
    /// boundary so a running cycle never sees mixed values.
    pub pending_thresholds: RwLock<Option<Thresholds>>,

    // ── Market Data ─────────────────────────────────────────────────────
    pub candle_tracker: Arc<CandleTracker>,

    // ── Decision Engine ─────────────────────────────────────────────────
    pub monitors: RwLock<BTreeMap<String, SymbolMonitor>>,
    pub cooldowns: Arc<CooldownRegistry>,
    pub position_engine: Arc<PositionEngine>,

    // ── Trade Log ───────────────────────────────────────────────────────
    pub history: Arc<TradeHistory>,

    // ── Account / Exchange ──────────────────────────────────────────────
    pub balances: RwLock<Vec<BalanceInfo>>,

    // ── Cycle Output ────────────────────────────────────────────────────
    pub last_cycle: RwLock<Option<CycleResult>>,

    // ── Error Log / Alerts ──────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Standing alert for an unconfirmed exchange exit. Never cleared
    /// silently: either a later retry succeeds or an operator intervenes.
    pub close_alert: RwLock<Option<CloseAlert>>,

    // ── Lifecycle ───────────────────────────────────────────────────────
    pub shutting_down: AtomicBool,

    /// Instant when the engine was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct a new `AppState` from the given runtime configuration and
    /// trade history. The returned value is typically wrapped in `Arc`
    /// immediately.
    pub fn new(config: RuntimeConfig, history: TradeHistory) -> Self {
        let cooldowns = Arc::new(CooldownRegistry::new());

        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),

            runtime_config: Arc::new(RwLock::new(config)),
            pending_thresholds: RwLock::new(None),

            candle_tracker: Arc::new(CandleTracker::new(CANDLE_FETCH_TTL_SECS)),

            monitors: RwLock::new(BTreeMap::new()),
            cooldowns: cooldowns.clone(),
            position_engine: Arc::new(PositionEngine::new(cooldowns)),

            history: Arc::new(history),

            balances: RwLock::new(Vec::new()),
            last_cycle: RwLock::new(None),

            recent_errors: RwLock::new(Vec::new()),
            close_alert: RwLock::new(None),

            shutting_down: AtomicBool::new(false),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    /// Bump the state version after a meaningful mutation so the WebSocket
    /// feed knows to push.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error for the dashboard. Oldest entries fall off once the
    /// buffer holds [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, msg: String) {
        let record = ErrorRecord {
            message: msg,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }

        self.increment_version();
    }

    // ── Threshold Staging ───────────────────────────────────────────────

    /// Stage a validated thresholds object for the next cycle boundary.
    pub fn stage_thresholds(&self, thresholds: Thresholds) {
        *self.pending_thresholds.write() = Some(thresholds);
        self.increment_version();
    }

    /// Apply any staged thresholds. Called by the coordinator at the cycle
    /// boundary, never mid-cycle.
    pub fn apply_pending_thresholds(&self) -> bool {
        let Some(staged) = self.pending_thresholds.write().take() else {
            return false;
        };
        self.runtime_config.write().thresholds = staged;
        self.increment_version();
        true
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of the entire engine state.
    ///
    /// This is the payload sent to the dashboard via the REST
    /// `GET /api/v1/state` endpoint and the WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let config = self.runtime_config.read();
        let version = self.current_state_version();

        let (markets, cycle_completed_at) = match self.last_cycle.read().as_ref() {
            Some(cycle) => (cycle.rows.clone(), Some(cycle.completed_at.to_rfc3339())),
            None => (Vec::new(), None),
        };

        let cooldowns = self
            .cooldowns
            .live_entries(now)
            .into_iter()
            .map(|(symbol, expires_at)| CooldownSnapshot {
                remaining_minutes: self.cooldowns.remaining_minutes(&symbol, now),
                symbol,
                expires_at: expires_at.to_rfc3339(),
            })
            .collect();

        StateSnapshot {
            state_version: version,
            server_time: now.timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            trading_mode: config.trading_mode.to_string(),
            account_mode: config.account_mode.to_string(),
            thresholds: config.thresholds.clone(),
            thresholds_pending: self.pending_thresholds.read().is_some(),
            cycle_completed_at,
            markets,
            position: self.position_engine.active(),
            cooldowns,
            recent_trades: self.history.recent(SNAPSHOT_HISTORY_COUNT),
            history_stats: self.history.statistics(),
            balances: self.balances.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
            close_alert: self.close_alert.read().clone(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Full engine state snapshot sent to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub trading_mode: String,
    pub account_mode: String,
    pub thresholds: Thresholds,
    /// True while a staged thresholds update waits for the cycle boundary.
    pub thresholds_pending: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_completed_at: Option<String>,

    pub markets: Vec<MarketRow>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    pub cooldowns: Vec<CooldownSnapshot>,
    pub recent_trades: Vec<TradeRecord>,
    pub history_stats: HistoryStats,
    pub balances: Vec<BalanceInfo>,
    pub recent_errors: Vec<ErrorRecord>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_alert: Option<CloseAlert>,
}

/// One live cooldown entry for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct CooldownSnapshot {
    pub symbol: String,
    pub expires_at: String,
    pub remaining_minutes: i64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let history = TradeHistory::open(dir.path().join("history.json"));
        (dir, AppState::new(RuntimeConfig::default(), history))
    }

    #[test]
    fn staged_thresholds_apply_only_at_boundary() {
        let (_dir, state) = state();
        let mut staged = Thresholds::default();
        staged.volume_multiplier = 9.0;

        state.stage_thresholds(staged);
        // Not yet visible to the engine.
        assert!(
            (state.runtime_config.read().thresholds.volume_multiplier - 2.0).abs() < f64::EPSILON
        );

        assert!(state.apply_pending_thresholds());
        assert!(
            (state.runtime_config.read().thresholds.volume_multiplier - 9.0).abs() < f64::EPSILON
        );

        // Nothing left to apply.
        assert!(!state.apply_pending_thresholds());
    }

    #[test]
    fn error_ring_buffer_is_capped() {
        let (_dir, state) = state();
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            state.push_error(format!("error {i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert!(errors.last().unwrap().message.contains("59"));
    }

    #[test]
    fn version_increments_on_mutation() {
        let (_dir, state) = state();
        let before = state.current_state_version();
        state.push_error("boom".to_string());
        assert!(state.current_state_version() > before);
    }

    #[test]
    fn snapshot_reflects_empty_engine() {
        let (_dir, state) = state();
        let snapshot = state.build_snapshot();
        assert!(snapshot.markets.is_empty());
        assert!(snapshot.position.is_none());
        assert_eq!(snapshot.history_stats.total_trades, 0);
        assert_eq!(snapshot.trading_mode, "Paused");
        assert_eq!(snapshot.account_mode, "Demo");
    }
}
