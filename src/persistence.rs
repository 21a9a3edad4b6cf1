// =============================================================================
// Engine State Persistence — resume instead of cold-start
// =============================================================================
//
// At each cycle boundary (and on shutdown) the engine serialises its
// resumable state: the active position (if any), the live cooldown entries,
// and the per-symbol monitor states. On startup the file is replayed into a
// fresh engine with the global-lock invariant enforced: a Closed position in
// the file is ignored (its record was already cut) and expired cooldowns are
// dropped on load.
//
// Writes use the atomic tmp + rename pattern.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::monitor::{SymbolMonitor, SymbolState};
use crate::position_engine::{Position, PositionState};

/// On-disk snapshot of the resumable engine state.
#[derive(Debug, Serialize, Deserialize)]
pub struct EngineState {
    #[serde(default)]
    pub active_position: Option<Position>,
    #[serde(default)]
    pub cooldowns: Vec<CooldownEntry>,
    #[serde(default)]
    pub symbol_states: Vec<PersistedSymbolState>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub symbol: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSymbolState {
    pub symbol: String,
    pub state: SymbolState,
    #[serde(default)]
    pub last_signal_at: Option<DateTime<Utc>>,
}

/// Capture the current resumable state.
pub fn capture(state: &AppState, now: DateTime<Utc>) -> EngineState {
    EngineState {
        active_position: state.position_engine.active(),
        cooldowns: state
            .cooldowns
            .live_entries(now)
            .into_iter()
            .map(|(symbol, expires_at)| CooldownEntry { symbol, expires_at })
            .collect(),
        symbol_states: state
            .monitors
            .read()
            .values()
            .map(|m| PersistedSymbolState {
                symbol: m.symbol.clone(),
                state: m.state,
                last_signal_at: m.last_signal_at,
            })
            .collect(),
        saved_at: now,
    }
}

/// Persist `engine_state` to `path` atomically.
pub fn save(path: impl AsRef<Path>, engine_state: &EngineState) -> Result<()> {
    let path = path.as_ref();
    let content =
        serde_json::to_string_pretty(engine_state).context("failed to serialise engine state")?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &content).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

/// Replay a saved state file into the engine.
///
/// Returns Ok(false) when no file exists. Restoration preserves the central
/// invariant: at most one non-Closed position can come back.
pub fn restore(path: impl AsRef<Path>, state: &AppState, now: DateTime<Utc>) -> Result<bool> {
    let path = path.as_ref();
    if !path.exists() {
        info!("no saved engine state found — cold start");
        return Ok(false);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let engine_state: EngineState = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let mut restored_cooldowns = 0usize;
    for entry in &engine_state.cooldowns {
        if entry.expires_at > now {
            state.cooldowns.register(&entry.symbol, entry.expires_at);
            restored_cooldowns += 1;
        }
    }

    {
        let mut monitors = state.monitors.write();
        for persisted in &engine_state.symbol_states {
            let mut monitor = SymbolMonitor::new(persisted.symbol.clone());
            monitor.state = persisted.state;
            monitor.last_signal_at = persisted.last_signal_at;
            monitors.insert(persisted.symbol.clone(), monitor);
        }
    }

    let mut restored_position = false;
    if let Some(position) = engine_state.active_position {
        if position.state == PositionState::Closed {
            warn!(
                symbol = %position.symbol,
                "saved position is already closed — ignoring"
            );
        } else {
            state.position_engine.restore(position)?;
            restored_position = true;
        }
    }

    info!(
        restored_position,
        restored_cooldowns,
        restored_symbols = engine_state.symbol_states.len(),
        saved_at = %engine_state.saved_at,
        "engine state restored"
    );
    Ok(true)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::TradeHistory;
    use crate::market_data::CandleSnapshot;
    use crate::runtime_config::{RuntimeConfig, Thresholds};
    use chrono::Duration;

    fn snapshot(symbol: &str, price: f64) -> CandleSnapshot {
        CandleSnapshot {
            symbol: symbol.to_string(),
            current_price: price,
            current_volume: 1000.0,
            prev_close_price: price,
            prev_volume: 400.0,
            elapsed_minutes: 5,
            observed_at: Utc::now(),
        }
    }

    fn app_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let history = TradeHistory::open(dir.path().join("history.json"));
        (dir, AppState::new(RuntimeConfig::default(), history))
    }

    #[test]
    fn roundtrip_restores_position_cooldowns_and_monitors() {
        let (dir, state) = app_state();
        let path = dir.path().join("engine_state.json");
        let now = Utc::now();
        let th = Thresholds::default();

        state
            .position_engine
            .try_open(&snapshot("BTCUSDT", 100.0), 1.0, &th, now)
            .unwrap();
        state.cooldowns.register("ETHUSDT", now + Duration::minutes(30));
        state.cooldowns.register("OLDUSDT", now - Duration::minutes(5));
        state
            .monitors
            .write()
            .insert("ETHUSDT".to_string(), {
                let mut m = SymbolMonitor::new("ETHUSDT");
                m.state = SymbolState::Cooldown;
                m
            });

        save(&path, &capture(&state, now)).unwrap();

        let (_dir2, fresh) = app_state();
        assert!(restore(&path, &fresh, now).unwrap());

        assert!(fresh.position_engine.has_active());
        assert_eq!(
            fresh.position_engine.active_symbol().as_deref(),
            Some("BTCUSDT")
        );
        assert!(fresh.cooldowns.is_cooling_down("ETHUSDT", now));
        // Expired entry was dropped on load.
        assert_eq!(fresh.cooldowns.live_entries(now).len(), 1);
        assert_eq!(
            fresh.monitors.read()["ETHUSDT"].state,
            SymbolState::Cooldown
        );

        // Invariant holds after restore: a second open is refused.
        assert!(fresh
            .position_engine
            .try_open(&snapshot("SOLUSDT", 10.0), 1.0, &th, now)
            .is_err());
    }

    #[test]
    fn missing_file_is_a_cold_start() {
        let (dir, state) = app_state();
        let restored = restore(dir.path().join("nope.json"), &state, Utc::now()).unwrap();
        assert!(!restored);
        assert!(!state.position_engine.has_active());
    }

    #[test]
    fn closed_position_in_file_is_ignored() {
        let (dir, state) = app_state();
        let path = dir.path().join("engine_state.json");
        let now = Utc::now();
        let th = Thresholds::default();

        state
            .position_engine
            .try_open(&snapshot("BTCUSDT", 100.0), 1.0, &th, now)
            .unwrap();

        let mut engine_state = capture(&state, now);
        if let Some(pos) = engine_state.active_position.as_mut() {
            pos.state = PositionState::Closed;
        }
        save(&path, &engine_state).unwrap();

        let (_dir2, fresh) = app_state();
        assert!(restore(&path, &fresh, now).unwrap());
        assert!(!fresh.position_engine.has_active());
    }
}
