// =============================================================================
// Position Engine — global trade lock + risk state machine
// =============================================================================
//
// Owns the single live position. The engine enforces the central invariant of
// the whole system: at most one non-Closed position exists at any instant.
// `try_open` is the only way to create a position and performs its
// check-and-construct atomically under one mutex, so two signals arriving in
// the same cycle can never both succeed.
//
// Life-cycle:
//   Open ──(price >= tp trigger)──> Trailing ──(price <= trailing stop)──> Closed
//   Open ──(price <= stop loss)─────────────────────────────────────────-> Closed
//   Open | Trailing ──(max duration reached, if enabled)────────────────-> Closed
//
// Exit precedence within one tick: stop-loss is always checked before the
// take-profit trigger, so a pathological tick satisfying both closes as a
// loss. In Trailing, the stop is tightened from the same tick's high BEFORE
// the breach comparison, so breach and tightening never disagree.
//
// Closing is terminal and atomic: the TradeRecord is emitted, the lock is
// released, and the symbol's cooldown is registered in one step. Order
// execution is someone else's problem — a failed exit order must never undo
// the Closed transition.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cooldown::CooldownRegistry;
use crate::error::LockHeld;
use crate::history::TradeRecord;
use crate::market_data::CandleSnapshot;
use crate::runtime_config::Thresholds;
use crate::types::ExitReason;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Risk-management state of the live position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    Trailing,
    Closed,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Trailing => write!(f, "Trailing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// The single tracked trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub quantity: f64,
    pub stop_loss_price: f64,
    pub take_profit_trigger_price: f64,
    /// Trailing distance captured at open; a later config change does not
    /// retune a position already in flight.
    pub trailing_stop_percent: f64,
    #[serde(default)]
    pub highest_price_since_trigger: Option<f64>,
    #[serde(default)]
    pub trailing_stop_price: Option<f64>,
    pub state: PositionState,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub pnl_percent: f64,
}

/// What `update` observed on this tick.
#[derive(Debug, Clone)]
pub enum PositionEvent {
    /// No active position to evaluate.
    Idle,
    /// Position remains open; price/pnl fields refreshed.
    Held,
    /// Take-profit trigger reached — trailing stop armed this tick.
    TrailingActivated { trailing_stop_price: f64 },
    /// Position reached Closed; the record has already been cut and the
    /// symbol's cooldown registered.
    Closed(TradeRecord),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the `Option<Position>` slot that doubles as the global trade lock.
pub struct PositionEngine {
    active: Mutex<Option<Position>>,
    cooldowns: Arc<CooldownRegistry>,
}

impl PositionEngine {
    pub fn new(cooldowns: Arc<CooldownRegistry>) -> Self {
        Self {
            active: Mutex::new(None),
            cooldowns,
        }
    }

    // -------------------------------------------------------------------------
    // Opening
    // -------------------------------------------------------------------------

    /// Atomically claim the trade lock and construct the position.
    ///
    /// Fails with `LockHeld` when any non-Closed position exists. Quantity is
    /// supplied by the caller; sizing policy does not live here.
    pub fn try_open(
        &self,
        snapshot: &CandleSnapshot,
        quantity: f64,
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) -> Result<Position, LockHeld> {
        let mut active = self.active.lock();

        if let Some(existing) = active.as_ref() {
            if existing.state != PositionState::Closed {
                return Err(LockHeld {
                    held_by: existing.symbol.clone(),
                });
            }
        }

        let entry_price = snapshot.current_price;
        let position = Position {
            id: Uuid::new_v4().to_string(),
            symbol: snapshot.symbol.clone(),
            entry_price,
            entry_time: now,
            quantity,
            stop_loss_price: entry_price * (1.0 - thresholds.stop_loss_percent / 100.0),
            take_profit_trigger_price: entry_price
                * (1.0 + thresholds.take_profit_percent / 100.0),
            trailing_stop_percent: thresholds.trailing_stop_percent,
            highest_price_since_trigger: None,
            trailing_stop_price: None,
            state: PositionState::Open,
            current_price: entry_price,
            pnl_percent: 0.0,
        };

        info!(
            id = %position.id,
            symbol = %position.symbol,
            entry_price,
            quantity,
            stop_loss = position.stop_loss_price,
            tp_trigger = position.take_profit_trigger_price,
            "position opened — trade lock acquired"
        );

        *active = Some(position.clone());
        Ok(position)
    }

    /// Release the lock without cutting a record or a cooldown. Used when the
    /// entry order failed after `try_open` succeeded: the position never
    /// really existed on the exchange.
    pub fn abandon(&self) -> Option<Position> {
        let mut active = self.active.lock();
        let abandoned = active.take();
        if let Some(pos) = abandoned.as_ref() {
            warn!(
                id = %pos.id,
                symbol = %pos.symbol,
                "position abandoned — entry order failed, trade lock released"
            );
        }
        abandoned
    }

    /// Re-anchor the freshly opened position on the actual exchange fill.
    ///
    /// Risk levels are recomputed from the fill price so the stops track what
    /// was really paid, not the snapshot price the signal was evaluated at.
    /// Only valid while the position is still Open and untriggered.
    pub fn apply_entry_fill(
        &self,
        fill_price: f64,
        quantity: f64,
        thresholds: &Thresholds,
    ) -> Option<Position> {
        let mut active = self.active.lock();
        let pos = active.as_mut()?;
        if pos.state != PositionState::Open || fill_price <= 0.0 || quantity <= 0.0 {
            return None;
        }

        pos.entry_price = fill_price;
        pos.quantity = quantity;
        pos.current_price = fill_price;
        pos.pnl_percent = 0.0;
        pos.stop_loss_price = fill_price * (1.0 - thresholds.stop_loss_percent / 100.0);
        pos.take_profit_trigger_price =
            fill_price * (1.0 + thresholds.take_profit_percent / 100.0);

        debug!(
            symbol = %pos.symbol,
            fill_price,
            quantity,
            stop_loss = pos.stop_loss_price,
            tp_trigger = pos.take_profit_trigger_price,
            "position re-anchored on exchange fill"
        );
        Some(pos.clone())
    }

    // -------------------------------------------------------------------------
    // Per-tick evaluation
    // -------------------------------------------------------------------------

    /// Advance the risk state machine one tick using the latest price for the
    /// position's symbol. A closed (or absent) position is left untouched.
    pub fn update(
        &self,
        price: f64,
        now: DateTime<Utc>,
        thresholds: &Thresholds,
    ) -> PositionEvent {
        let mut active = self.active.lock();

        let Some(pos) = active.as_mut() else {
            return PositionEvent::Idle;
        };
        if pos.state == PositionState::Closed {
            // No transition out of Closed exists.
            return PositionEvent::Idle;
        }
        if price <= 0.0 {
            warn!(symbol = %pos.symbol, price, "ignoring non-positive price tick");
            return PositionEvent::Held;
        }

        pos.current_price = price;
        pos.pnl_percent = (price / pos.entry_price - 1.0) * 100.0;

        let event = match pos.state {
            PositionState::Open => Self::evaluate_open(pos, price, now, thresholds),
            PositionState::Trailing => Self::evaluate_trailing(pos, price, now, thresholds),
            PositionState::Closed => unreachable!("closed handled above"),
        };

        if let PositionEvent::Closed(record) = &event {
            self.cooldowns.register(
                &record.symbol,
                now + Duration::minutes(i64::from(thresholds.cooldown_minutes)),
            );
            *active = None;
        }

        event
    }

    fn evaluate_open(
        pos: &mut Position,
        price: f64,
        now: DateTime<Utc>,
        thresholds: &Thresholds,
    ) -> PositionEvent {
        // Stop-loss takes precedence over everything else on the tick.
        if price <= pos.stop_loss_price {
            warn!(
                symbol = %pos.symbol,
                price,
                stop_loss = pos.stop_loss_price,
                "stop loss hit"
            );
            return PositionEvent::Closed(Self::close(pos, price, now, ExitReason::StopLoss));
        }

        if price >= pos.take_profit_trigger_price {
            let trail = price * (1.0 - pos.trailing_stop_percent / 100.0);
            pos.highest_price_since_trigger = Some(price);
            pos.trailing_stop_price = Some(trail);
            pos.state = PositionState::Trailing;
            info!(
                symbol = %pos.symbol,
                price,
                trailing_stop = trail,
                "take-profit trigger reached — trailing stop armed"
            );
            return PositionEvent::TrailingActivated {
                trailing_stop_price: trail,
            };
        }

        if let Some(record) = Self::check_time_exit(pos, price, now, thresholds) {
            return PositionEvent::Closed(record);
        }

        debug!(symbol = %pos.symbol, price, pnl = pos.pnl_percent, "position held (open)");
        PositionEvent::Held
    }

    fn evaluate_trailing(
        pos: &mut Position,
        price: f64,
        now: DateTime<Utc>,
        thresholds: &Thresholds,
    ) -> PositionEvent {
        // Tighten first: breach is compared against the same-tick stop, and
        // the stop only ever ratchets upward.
        let highest = pos.highest_price_since_trigger.unwrap_or(pos.entry_price);
        if price > highest {
            let trail = price * (1.0 - pos.trailing_stop_percent / 100.0);
            pos.highest_price_since_trigger = Some(price);
            pos.trailing_stop_price = Some(trail);
            debug!(
                symbol = %pos.symbol,
                highest = price,
                trailing_stop = trail,
                "trailing stop raised"
            );
        }

        if let Some(trail) = pos.trailing_stop_price {
            if price <= trail {
                warn!(
                    symbol = %pos.symbol,
                    price,
                    trailing_stop = trail,
                    "trailing stop hit"
                );
                return PositionEvent::Closed(Self::close(
                    pos,
                    price,
                    now,
                    ExitReason::TrailingStop,
                ));
            }
        }

        if let Some(record) = Self::check_time_exit(pos, price, now, thresholds) {
            return PositionEvent::Closed(record);
        }

        debug!(symbol = %pos.symbol, price, pnl = pos.pnl_percent, "position held (trailing)");
        PositionEvent::Held
    }

    fn check_time_exit(
        pos: &mut Position,
        price: f64,
        now: DateTime<Utc>,
        thresholds: &Thresholds,
    ) -> Option<TradeRecord> {
        if !thresholds.time_exit_enabled || thresholds.max_trade_duration_minutes == 0 {
            return None;
        }
        let elapsed = now - pos.entry_time;
        if elapsed >= Duration::minutes(i64::from(thresholds.max_trade_duration_minutes)) {
            warn!(
                symbol = %pos.symbol,
                elapsed_minutes = elapsed.num_minutes(),
                limit_minutes = thresholds.max_trade_duration_minutes,
                "maximum trade duration reached"
            );
            return Some(Self::close(pos, price, now, ExitReason::TimeExit));
        }
        None
    }

    /// Terminal transition: mark Closed and cut the immutable record.
    fn close(
        pos: &mut Position,
        exit_price: f64,
        now: DateTime<Utc>,
        reason: ExitReason,
    ) -> TradeRecord {
        pos.state = PositionState::Closed;
        pos.current_price = exit_price;
        pos.pnl_percent = (exit_price / pos.entry_price - 1.0) * 100.0;

        info!(
            id = %pos.id,
            symbol = %pos.symbol,
            exit_price,
            pnl_percent = pos.pnl_percent,
            reason = %reason,
            "position closed — trade lock released"
        );

        TradeRecord {
            symbol: pos.symbol.clone(),
            entry_time: pos.entry_time,
            exit_time: now,
            entry_price: pos.entry_price,
            exit_price,
            quantity: pos.quantity,
            pnl_percent: pos.pnl_percent,
            exit_reason: reason,
        }
    }

    /// Close the live position unconditionally (operator flatten, shutdown).
    pub fn force_close(
        &self,
        price: f64,
        now: DateTime<Utc>,
        thresholds: &Thresholds,
    ) -> Option<TradeRecord> {
        let mut active = self.active.lock();
        let pos = active.as_mut()?;
        if pos.state == PositionState::Closed {
            return None;
        }
        let exit_price = if price > 0.0 { price } else { pos.current_price };
        let record = Self::close(pos, exit_price, now, ExitReason::Manual);
        self.cooldowns.register(
            &record.symbol,
            now + Duration::minutes(i64::from(thresholds.cooldown_minutes)),
        );
        *active = None;
        Some(record)
    }

    // -------------------------------------------------------------------------
    // Queries & re-hydration
    // -------------------------------------------------------------------------

    /// Snapshot of the live position, if any.
    pub fn active(&self) -> Option<Position> {
        self.active.lock().clone()
    }

    pub fn has_active(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|p| p.state != PositionState::Closed)
    }

    /// Symbol currently holding the trade lock, if any.
    pub fn active_symbol(&self) -> Option<String> {
        self.active
            .lock()
            .as_ref()
            .filter(|p| p.state != PositionState::Closed)
            .map(|p| p.symbol.clone())
    }

    /// Restore a persisted position on startup. Refuses a Closed position
    /// (the record was already cut) and refuses to overwrite a live one, so
    /// re-hydration cannot break the at-most-one invariant.
    pub fn restore(&self, position: Position) -> anyhow::Result<()> {
        if position.state == PositionState::Closed {
            anyhow::bail!("refusing to restore a closed position for {}", position.symbol);
        }
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|p| p.state != PositionState::Closed) {
            anyhow::bail!("a live position already holds the trade lock");
        }
        info!(
            symbol = %position.symbol,
            entry_price = position.entry_price,
            state = %position.state,
            "restored active position from saved state"
        );
        *active = Some(position);
        Ok(())
    }
}

impl std::fmt::Debug for PositionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let holder = self.active_symbol();
        f.debug_struct("PositionEngine")
            .field("lock_held_by", &holder)
            .finish()
    }
}
