// =============================================================================
// Scan Cycle Coordinator — one evaluation pass over the whole market
// =============================================================================
//
// Each cycle runs the same strict sequence:
//
//   1. Apply any staged thresholds (the only point where config can change).
//   2. Scan the top-N gainers; the active position's symbol is always kept in
//      the set even when it drops out of the ranking.
//   3. Refresh candles per symbol; a symbol whose data cannot be fetched is
//      excluded from this cycle, it does not abort the cycle.
//   4. Serialized section: drive every Symbol Monitor in sorted-symbol order
//      (deterministic outcome for a given input set), let at most one signal
//      take the trade lock, then advance the active position using the latest
//      price for its own symbol.
//   5. Publish an immutable CycleResult, then execute any orders the section
//      produced and persist the resumable state.
//
// A failure of the market scan itself abandons the whole cycle — nothing is
// published, the previous result stays visible, and the next tick retries.
// No network I/O happens inside the serialized section: balances are cached
// by the reconcile loop and order placement follows the section.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::binance::client::BinanceClient;
use crate::entry;
use crate::error::{CloseAlert, EngineError};
use crate::executor::{OrderExecutor, MAX_EXIT_ATTEMPTS};
use crate::history::TradeRecord;
use crate::market_data::CandleSnapshot;
use crate::monitor::{MonitorAction, SymbolMonitor, SymbolState};
use crate::position_engine::{Position, PositionEvent};
use crate::types::{AccountMode, TradingMode};

/// Quote budget used for sizing in demo mode, where no real balance exists.
const DEMO_QUOTE_BALANCE: f64 = 1000.0;

// ---------------------------------------------------------------------------
// Cycle output
// ---------------------------------------------------------------------------

/// Dashboard row for one monitored symbol, frozen at cycle end.
#[derive(Debug, Clone, Serialize)]
pub struct MarketRow {
    pub symbol: String,
    pub price: f64,
    pub prev_close_price: f64,
    pub current_volume: f64,
    pub prev_volume: f64,
    pub elapsed_minutes: u32,
    pub state: SymbolState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signal_at: Option<DateTime<Utc>>,
    pub cooldown_remaining_minutes: i64,
}

/// Immutable result of one completed cycle, as exposed to the delivery layer.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub completed_at: DateTime<Utc>,
    pub rows: Vec<MarketRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub closed_trades: Vec<TradeRecord>,
}

/// Full outcome of the serialized section: the publishable result plus the
/// order work it produced.
#[derive(Debug)]
pub struct CycleOutcome {
    pub result: CycleResult,
    /// Position opened this cycle — an entry order must be placed.
    pub opened: Option<Position>,
    /// Records cut this cycle — exit orders must be placed.
    pub closed: Vec<TradeRecord>,
}

// ---------------------------------------------------------------------------
// Serialized section
// ---------------------------------------------------------------------------

/// Apply one cycle's worth of state transitions.
///
/// This is the single serialized mutation point for monitors and the position
/// engine: snapshots go in, transitions happen in deterministic sorted order,
/// and an immutable outcome comes out. No I/O, no awaiting.
pub fn run_serialized(
    state: &AppState,
    snapshots: &[CandleSnapshot],
    now: DateTime<Utc>,
) -> CycleOutcome {
    let config = state.runtime_config.read().clone();
    let thresholds = &config.thresholds;
    let engine = &state.position_engine;

    let mut snapshots: Vec<&CandleSnapshot> = snapshots.iter().collect();
    snapshots.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    // Quote budget for sizing. Entries are gated below the configured floor.
    let quote_budget = match config.account_mode {
        AccountMode::Demo => DEMO_QUOTE_BALANCE,
        AccountMode::Live => state
            .balances
            .read()
            .iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.free)
            .unwrap_or(0.0),
    };

    let mut monitors = state.monitors.write();
    let mut opened: Option<Position> = None;
    let mut closed: Vec<TradeRecord> = Vec::new();

    // ── Per-symbol evaluation, sorted order ─────────────────────────────
    for snap in &snapshots {
        let monitor = monitors
            .entry(snap.symbol.clone())
            .or_insert_with(|| SymbolMonitor::new(snap.symbol.clone()));

        let cooling = state.cooldowns.is_cooling_down(&snap.symbol, now);
        let active_symbol = engine.active_symbol();

        let action = monitor.step(cooling, active_symbol.as_deref(), now, || {
            entry::check(snap, thresholds)
        });

        if action != MonitorAction::AttemptOpen {
            continue;
        }

        if config.trading_mode != TradingMode::Live {
            debug!(symbol = %snap.symbol, "signal ignored — trading paused");
            continue;
        }
        if quote_budget < config.min_quote_balance {
            warn!(
                symbol = %snap.symbol,
                quote_budget,
                min = config.min_quote_balance,
                "signal ignored — quote balance below minimum"
            );
            continue;
        }

        let quantity = quote_budget / snap.current_price;
        match engine.try_open(snap, quantity, thresholds, now) {
            Ok(position) => {
                monitor.lock_acquired();
                opened = Some(position);
            }
            Err(held) => monitor.lock_denied(&held.held_by),
        }
    }

    // ── Position update with the latest price for its own symbol ────────
    if let Some(active_symbol) = engine.active_symbol() {
        if let Some(snap) = snapshots.iter().find(|s| s.symbol == active_symbol) {
            match engine.update(snap.current_price, now, thresholds) {
                PositionEvent::Closed(record) => {
                    if let Some(monitor) = monitors.get_mut(&record.symbol) {
                        monitor.position_closed();
                    }
                    closed.push(record);
                }
                PositionEvent::TrailingActivated { trailing_stop_price } => {
                    debug!(
                        symbol = %active_symbol,
                        trailing_stop_price,
                        "trailing stop armed this cycle"
                    );
                }
                PositionEvent::Held | PositionEvent::Idle => {}
            }
        } else {
            debug!(
                symbol = %active_symbol,
                "no snapshot for active position this cycle — risk check deferred"
            );
        }
    }

    // ── Freeze display rows after all transitions ───────────────────────
    let rows = snapshots
        .iter()
        .map(|snap| {
            let (symbol_state, last_signal_at) = monitors
                .get(&snap.symbol)
                .map(|m| (m.state, m.last_signal_at))
                .unwrap_or((SymbolState::Wait, None));
            MarketRow {
                symbol: snap.symbol.clone(),
                price: snap.current_price,
                prev_close_price: snap.prev_close_price,
                current_volume: snap.current_volume,
                prev_volume: snap.prev_volume,
                elapsed_minutes: snap.elapsed_minutes,
                state: symbol_state,
                last_signal_at,
                cooldown_remaining_minutes: state.cooldowns.remaining_minutes(&snap.symbol, now),
            }
        })
        .collect();

    CycleOutcome {
        result: CycleResult {
            completed_at: now,
            rows,
            position: engine.active(),
            closed_trades: closed.clone(),
        },
        opened,
        closed,
    }
}

// ---------------------------------------------------------------------------
// Full cycle driver
// ---------------------------------------------------------------------------

/// Run one complete scan cycle: scan, refresh, serialized transitions,
/// publish, orders, persistence. Errors abandon the cycle without publishing
/// partial state.
pub async fn run_cycle(
    state: &Arc<AppState>,
    client: &BinanceClient,
    executor: &OrderExecutor,
    persist_path: &PathBuf,
) -> anyhow::Result<()> {
    // ── 1. Cycle boundary: staged config becomes active ─────────────────
    if state.apply_pending_thresholds() {
        info!("staged thresholds applied at cycle boundary");
    }
    let config = state.runtime_config.read().clone();
    let timeframe = config.thresholds.candle_timeframe.clone();

    // ── 2. Market scan ──────────────────────────────────────────────────
    let mut symbols = client
        .get_top_gainers(config.thresholds.top_gainers_count as usize)
        .await?;

    // The active position must keep receiving price ticks even after its
    // symbol falls out of the ranking.
    if let Some(active) = state.position_engine.active_symbol() {
        if !symbols.contains(&active) {
            symbols.push(active);
        }
    }
    if symbols.is_empty() {
        anyhow::bail!("market scan returned no symbols");
    }

    // ── 3. Candle refresh (failures exclude the symbol, not the cycle) ──
    for symbol in &symbols {
        if let Err(e) = state.candle_tracker.refresh(client, symbol, &timeframe).await {
            warn!(symbol = %symbol, error = %e, "candle refresh failed — symbol excluded this cycle");
        }
    }

    let now = Utc::now();
    let snapshots: Vec<CandleSnapshot> = symbols
        .iter()
        .filter_map(|symbol| state.candle_tracker.snapshot(symbol, &timeframe, now))
        .collect();

    for symbol in &symbols {
        if !snapshots.iter().any(|s| &s.symbol == symbol) {
            let skipped = EngineError::data_unavailable(symbol.clone(), "candle pair not ready");
            debug!(error = %skipped, "symbol excluded from this cycle");
        }
    }

    // ── 4. Serialized transitions ───────────────────────────────────────
    let outcome = run_serialized(state, &snapshots, now);

    // ── 5. Publish the cycle result ─────────────────────────────────────
    *state.last_cycle.write() = Some(outcome.result);
    state.increment_version();

    // Bounded-memory housekeeping at the boundary.
    state.cooldowns.sweep(now);
    state.candle_tracker.retain(&symbols);
    state
        .monitors
        .write()
        .retain(|symbol, _| symbols.contains(symbol));

    let is_demo = config.account_mode == AccountMode::Demo;

    // ── 6. Entry order for a position opened this cycle ─────────────────
    if let Some(position) = outcome.opened {
        let quote_amount = position.quantity * position.entry_price;
        match executor
            .execute_entry(&position.symbol, quote_amount, position.entry_price, is_demo)
            .await
        {
            Ok(fill) => {
                state
                    .position_engine
                    .apply_entry_fill(fill.fill_price, fill.quantity, &config.thresholds);
                state.increment_version();
            }
            Err(e) => {
                // Opens that fail are abandoned: lock released, signal gone.
                state.position_engine.abandon();
                if let Some(monitor) = state.monitors.write().get_mut(&position.symbol) {
                    monitor.open_abandoned();
                }
                state.push_error(e.to_string());
                error!(symbol = %position.symbol, error = %e, "entry abandoned");
            }
        }
    }

    // ── 7. Exit orders for records cut this cycle ───────────────────────
    for record in outcome.closed {
        // The close is logically final the moment the record exists.
        state.history.append(record.clone());

        match executor
            .execute_exit(&record.symbol, record.quantity, record.exit_price, is_demo)
            .await
        {
            Ok(fill) => {
                if (fill.fill_price - record.exit_price).abs() > f64::EPSILON {
                    info!(
                        symbol = %record.symbol,
                        decided_at = record.exit_price,
                        filled_at = fill.fill_price,
                        "exit slippage"
                    );
                }
                *state.close_alert.write() = None;
                state.increment_version();
            }
            Err(e) => {
                // The Closed transition stands; the unconfirmed exchange exit
                // becomes a standing alert.
                *state.close_alert.write() = Some(CloseAlert {
                    symbol: record.symbol.clone(),
                    quantity: record.quantity,
                    exit_reason: record.exit_reason,
                    attempts: MAX_EXIT_ATTEMPTS,
                    last_error: e.to_string(),
                    raised_at: Utc::now().to_rfc3339(),
                });
                state.push_error(e.to_string());
                error!(symbol = %record.symbol, error = %e, "exit order unconfirmed — alert raised");
            }
        }
    }

    // ── 8. Persist resumable state ──────────────────────────────────────
    let engine_state = crate::persistence::capture(state, now);
    if let Err(e) = crate::persistence::save(persist_path, &engine_state) {
        warn!(error = %e, "failed to persist engine state");
    }

    Ok(())
}

/// Drive scan cycles forever at the configured interval. Honors shutdown
/// between cycles (graceful drain — never mid-transition).
pub async fn run_scan_loop(
    state: Arc<AppState>,
    client: Arc<BinanceClient>,
    executor: Arc<OrderExecutor>,
    persist_path: PathBuf,
) {
    info!("scan loop starting");

    loop {
        if state.is_shutting_down() {
            info!("scan loop draining — shutdown requested");
            break;
        }

        if let Err(e) = run_cycle(&state, &client, &executor, &persist_path).await {
            state.push_error(format!("cycle abandoned: {e}"));
            warn!(error = %e, "cycle abandoned — retrying next tick");
        }

        let interval = state.runtime_config.read().scan_interval_secs;
        tokio::time::sleep(tokio::time::Duration::from_secs(interval.max(1))).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::AppState;
    use crate::history::TradeHistory;
    use crate::runtime_config::RuntimeConfig;
    use crate::types::ExitReason;

    fn snapshot(symbol: &str, price: f64, volume: f64, prev_close: f64, prev_volume: f64) -> CandleSnapshot {
        CandleSnapshot {
            symbol: symbol.to_string(),
            current_price: price,
            current_volume: volume,
            prev_close_price: prev_close,
            prev_volume,
            elapsed_minutes: 5,
            observed_at: Utc::now(),
        }
    }

    /// Snapshot that satisfies the default thresholds (2x volume, +2% price).
    fn surging(symbol: &str) -> CandleSnapshot {
        snapshot(symbol, 103.0, 900.0, 100.0, 400.0)
    }

    /// Snapshot that satisfies nothing.
    fn quiet(symbol: &str) -> CandleSnapshot {
        snapshot(symbol, 100.1, 410.0, 100.0, 400.0)
    }

    fn live_demo_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let history = TradeHistory::open(dir.path().join("history.json"));
        let mut config = RuntimeConfig::default();
        config.trading_mode = TradingMode::Live;
        (dir, AppState::new(config, history))
    }

    #[test]
    fn first_symbol_in_sorted_order_wins_the_lock() {
        let (_dir, state) = live_demo_state();
        let now = Utc::now();

        // Deliberately unsorted input: determinism comes from the sort.
        let snaps = vec![surging("BBBUSDT"), surging("AAAUSDT")];
        let outcome = run_serialized(&state, &snaps, now);

        let position = outcome.result.position.expect("one position opened");
        assert_eq!(position.symbol, "AAAUSDT");
        assert_eq!(outcome.opened.as_ref().unwrap().symbol, "AAAUSDT");

        let monitors = state.monitors.read();
        assert_eq!(monitors["AAAUSDT"].state, SymbolState::InTrade);
        assert_eq!(monitors["BBBUSDT"].state, SymbolState::Locked);
    }

    #[test]
    fn paused_mode_shelves_signals_without_opening() {
        let dir = tempfile::tempdir().unwrap();
        let history = TradeHistory::open(dir.path().join("history.json"));
        let state = AppState::new(RuntimeConfig::default(), history); // Paused

        let outcome = run_serialized(&state, &[surging("AAAUSDT")], Utc::now());
        assert!(outcome.opened.is_none());
        assert!(outcome.result.position.is_none());
        assert_eq!(state.monitors.read()["AAAUSDT"].state, SymbolState::Signal);
    }

    #[test]
    fn live_account_without_balance_cannot_open() {
        let (_dir, state) = live_demo_state();
        state.runtime_config.write().account_mode = AccountMode::Live;
        // balances cache is empty -> quote budget 0 < min 10.

        let outcome = run_serialized(&state, &[surging("AAAUSDT")], Utc::now());
        assert!(outcome.opened.is_none());
    }

    #[test]
    fn quiet_market_leaves_everything_waiting() {
        let (_dir, state) = live_demo_state();
        let outcome = run_serialized(&state, &[quiet("AAAUSDT"), quiet("BBBUSDT")], Utc::now());

        assert!(outcome.opened.is_none());
        assert!(outcome.closed.is_empty());
        assert_eq!(outcome.result.rows.len(), 2);
        assert!(outcome
            .result
            .rows
            .iter()
            .all(|row| row.state == SymbolState::Wait));
    }

    #[test]
    fn rows_are_sorted_by_symbol() {
        let (_dir, state) = live_demo_state();
        let snaps = vec![quiet("ZZZUSDT"), quiet("AAAUSDT"), quiet("MMMUSDT")];
        let outcome = run_serialized(&state, &snaps, Utc::now());
        let names: Vec<&str> = outcome.result.rows.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(names, vec!["AAAUSDT", "MMMUSDT", "ZZZUSDT"]);
    }

    #[test]
    fn stop_loss_close_flows_into_cycle_result() {
        let (_dir, state) = live_demo_state();
        let now = Utc::now();

        // Cycle 1: AAAUSDT surges and opens at 103.
        let outcome = run_serialized(&state, &[surging("AAAUSDT")], now);
        assert!(outcome.opened.is_some());

        // Cycle 2: price collapses below the 1.5% stop (103 * 0.985 ≈ 101.45).
        let crash = snapshot("AAAUSDT", 101.0, 950.0, 100.0, 400.0);
        let outcome = run_serialized(&state, &[crash], now);

        assert_eq!(outcome.closed.len(), 1);
        assert_eq!(outcome.closed[0].exit_reason, ExitReason::StopLoss);
        assert!(outcome.result.position.is_none());
        assert_eq!(outcome.result.closed_trades.len(), 1);

        // The symbol cools down, and the lock is free again.
        assert!(state.cooldowns.is_cooling_down("AAAUSDT", now));
        assert_eq!(state.monitors.read()["AAAUSDT"].state, SymbolState::Cooldown);
        assert!(!state.position_engine.has_active());
    }

    #[test]
    fn cooled_down_symbol_cannot_resignal() {
        let (_dir, state) = live_demo_state();
        let now = Utc::now();

        // Open and crash AAAUSDT to put it into cooldown.
        run_serialized(&state, &[surging("AAAUSDT")], now);
        run_serialized(&state, &[snapshot("AAAUSDT", 101.0, 950.0, 100.0, 400.0)], now);
        assert!(state.cooldowns.is_cooling_down("AAAUSDT", now));

        // Even with a perfect surge, the symbol stays in COOLDOWN and the
        // lock stays free.
        let outcome = run_serialized(&state, &[surging("AAAUSDT")], now);
        assert!(outcome.opened.is_none());
        assert_eq!(outcome.result.rows[0].state, SymbolState::Cooldown);
        assert!(outcome.result.rows[0].cooldown_remaining_minutes > 0);
    }

    #[test]
    fn missing_snapshot_defers_position_update() {
        let (_dir, state) = live_demo_state();
        let now = Utc::now();

        run_serialized(&state, &[surging("AAAUSDT")], now);

        // Next cycle the active symbol has no snapshot: position survives
        // untouched at its previous price.
        let outcome = run_serialized(&state, &[quiet("BBBUSDT")], now);
        let position = outcome.result.position.expect("position still live");
        assert_eq!(position.symbol, "AAAUSDT");
        assert!(outcome.closed.is_empty());
    }

    #[test]
    fn second_cycle_signal_while_position_open_locks() {
        let (_dir, state) = live_demo_state();
        let now = Utc::now();

        run_serialized(&state, &[surging("AAAUSDT")], now);

        // BBB surges a cycle later; lock is held by AAA, whose price sits
        // safely between its stop and its trigger.
        let steady = snapshot("AAAUSDT", 103.2, 950.0, 100.0, 400.0);
        let outcome = run_serialized(&state, &[steady, surging("BBBUSDT")], now);
        assert!(outcome.opened.is_none());
        assert_eq!(state.monitors.read()["BBBUSDT"].state, SymbolState::Locked);
        // AAA keeps its position.
        assert_eq!(outcome.result.position.unwrap().symbol, "AAAUSDT");
    }
}
