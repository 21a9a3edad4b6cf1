// =============================================================================
// Symbol Monitor — per-symbol monitoring state machine
// =============================================================================
//
// One monitor per watched symbol, driven once per scan cycle:
//
//   Wait ──(rule met)──> Signal ──(lock acquired)──> InTrade
//                          │
//                          └──(lock held elsewhere)──> Locked
//   InTrade / Locked ──(position closed, no cooldown)──> Wait
//   InTrade / Locked ──(own position closed)──> Cooldown ──(expiry)──> Wait
//   Wait ──(surge window passed)──> TimeOut (transient, re-evaluated next cycle)
//
// Locked and Cooldown symbols do not re-run the entry rule; the evaluation
// closure passed to `step` is only invoked for states that are allowed to
// look at the market. The monitor never touches the trade lock itself — it
// reports an `AttemptOpen` action and the coordinator feeds the outcome back
// via `lock_acquired` / `lock_denied`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::entry::{EntryCheck, EntryVerdict};

/// Display/decision state of one monitored symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolState {
    Wait,
    Signal,
    InTrade,
    Locked,
    Cooldown,
    TimeOut,
}

impl std::fmt::Display for SymbolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wait => write!(f, "WAIT"),
            Self::Signal => write!(f, "SIGNAL"),
            Self::InTrade => write!(f, "IN_TRADE"),
            Self::Locked => write!(f, "LOCKED"),
            Self::Cooldown => write!(f, "COOLDOWN"),
            Self::TimeOut => write!(f, "TIME_OUT"),
        }
    }
}

/// What the coordinator must do for this symbol after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// Nothing to do this cycle.
    Hold,
    /// The entry rule fired — try to take the global trade lock now.
    AttemptOpen,
}

/// State machine instance for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolMonitor {
    pub symbol: String,
    pub state: SymbolState,
    pub last_signal_at: Option<DateTime<Utc>>,
}

impl SymbolMonitor {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            state: SymbolState::Wait,
            last_signal_at: None,
        }
    }

    /// Advance the monitor one cycle.
    ///
    /// `active_symbol` is the holder of the trade lock (if any) and
    /// `cooling_down` reflects this symbol's cooldown registry entry. The
    /// `check` closure runs the entry rule and is only invoked when this
    /// symbol's state permits evaluation.
    pub fn step<F>(
        &mut self,
        cooling_down: bool,
        active_symbol: Option<&str>,
        now: DateTime<Utc>,
        check: F,
    ) -> MonitorAction
    where
        F: FnOnce() -> EntryCheck,
    {
        // Holding the live position dominates every other state.
        if active_symbol == Some(self.symbol.as_str()) {
            self.state = SymbolState::InTrade;
            return MonitorAction::Hold;
        }

        if cooling_down {
            self.state = SymbolState::Cooldown;
            return MonitorAction::Hold;
        }

        // Locked symbols sit out until the position closes; once the lock is
        // free they fall back to Wait and evaluate again below.
        if self.state == SymbolState::Locked {
            if active_symbol.is_some() {
                return MonitorAction::Hold;
            }
            self.state = SymbolState::Wait;
            debug!(symbol = %self.symbol, "trade lock released — back to WAIT");
        }

        // A cooldown that just expired also lands back in Wait.
        if self.state == SymbolState::Cooldown || self.state == SymbolState::InTrade {
            self.state = SymbolState::Wait;
        }

        let check = check();
        match check.verdict {
            EntryVerdict::Met => {
                self.state = SymbolState::Signal;
                self.last_signal_at = Some(now);
                info!(symbol = %self.symbol, "entry signal");
                MonitorAction::AttemptOpen
            }
            EntryVerdict::TimedOut => {
                self.state = SymbolState::TimeOut;
                MonitorAction::Hold
            }
            EntryVerdict::InsufficientData
            | EntryVerdict::VolumeShort
            | EntryVerdict::PriceShort => {
                self.state = SymbolState::Wait;
                MonitorAction::Hold
            }
        }
    }

    /// The coordinator won the trade lock for this symbol's signal.
    pub fn lock_acquired(&mut self) {
        self.state = SymbolState::InTrade;
        info!(symbol = %self.symbol, "signal accepted — IN_TRADE");
    }

    /// Another symbol already holds the lock; this signal is shelved.
    pub fn lock_denied(&mut self, held_by: &str) {
        self.state = SymbolState::Locked;
        debug!(symbol = %self.symbol, held_by, "signal rejected — LOCKED");
    }

    /// The entry order failed after the lock was briefly taken; the signal is
    /// discarded and the symbol re-evaluates next cycle.
    pub fn open_abandoned(&mut self) {
        self.state = SymbolState::Wait;
    }

    /// This symbol's position just closed; the cooldown registered at close
    /// takes effect immediately for display purposes.
    pub fn position_closed(&mut self) {
        self.state = SymbolState::Cooldown;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn met() -> EntryCheck {
        EntryCheck {
            verdict: EntryVerdict::Met,
            required_volume: 400.0,
            required_price: 96.9,
        }
    }

    fn verdict(v: EntryVerdict) -> EntryCheck {
        EntryCheck {
            verdict: v,
            required_volume: 0.0,
            required_price: 0.0,
        }
    }

    #[test]
    fn wait_to_signal_to_in_trade() {
        let mut mon = SymbolMonitor::new("BTCUSDT");
        let action = mon.step(false, None, Utc::now(), met);
        assert_eq!(action, MonitorAction::AttemptOpen);
        assert_eq!(mon.state, SymbolState::Signal);
        assert!(mon.last_signal_at.is_some());

        mon.lock_acquired();
        assert_eq!(mon.state, SymbolState::InTrade);
    }

    #[test]
    fn signal_with_lock_held_becomes_locked() {
        let mut mon = SymbolMonitor::new("ETHUSDT");
        let action = mon.step(false, Some("BTCUSDT"), Utc::now(), met);
        assert_eq!(action, MonitorAction::AttemptOpen);
        mon.lock_denied("BTCUSDT");
        assert_eq!(mon.state, SymbolState::Locked);
    }

    #[test]
    fn cooldown_blocks_signal_regardless_of_rule() {
        let mut mon = SymbolMonitor::new("BTCUSDT");
        let action = mon.step(true, None, Utc::now(), || {
            panic!("evaluator must not run while cooling down")
        });
        assert_eq!(action, MonitorAction::Hold);
        assert_eq!(mon.state, SymbolState::Cooldown);
    }

    #[test]
    fn locked_symbol_does_not_reevaluate_while_lock_held() {
        let mut mon = SymbolMonitor::new("ETHUSDT");
        mon.step(false, Some("BTCUSDT"), Utc::now(), met);
        mon.lock_denied("BTCUSDT");

        let action = mon.step(false, Some("BTCUSDT"), Utc::now(), || {
            panic!("evaluator must not run while LOCKED")
        });
        assert_eq!(action, MonitorAction::Hold);
        assert_eq!(mon.state, SymbolState::Locked);
    }

    #[test]
    fn locked_returns_to_wait_after_position_closes() {
        let mut mon = SymbolMonitor::new("ETHUSDT");
        mon.step(false, Some("BTCUSDT"), Utc::now(), met);
        mon.lock_denied("BTCUSDT");

        // Lock released, rule no longer met: plain WAIT again.
        let action = mon.step(false, None, Utc::now(), || verdict(EntryVerdict::VolumeShort));
        assert_eq!(action, MonitorAction::Hold);
        assert_eq!(mon.state, SymbolState::Wait);
    }

    #[test]
    fn own_position_dominates_as_in_trade() {
        let mut mon = SymbolMonitor::new("BTCUSDT");
        let action = mon.step(false, Some("BTCUSDT"), Utc::now(), || {
            panic!("evaluator must not run while IN_TRADE")
        });
        assert_eq!(action, MonitorAction::Hold);
        assert_eq!(mon.state, SymbolState::InTrade);
    }

    #[test]
    fn in_trade_symbol_cools_down_after_close() {
        let mut mon = SymbolMonitor::new("BTCUSDT");
        mon.step(false, Some("BTCUSDT"), Utc::now(), met);
        assert_eq!(mon.state, SymbolState::InTrade);

        // Position closed, cooldown registered at close.
        mon.step(true, None, Utc::now(), || {
            panic!("evaluator must not run while COOLDOWN")
        });
        assert_eq!(mon.state, SymbolState::Cooldown);

        // Cooldown expired: evaluates again.
        let action = mon.step(false, None, Utc::now(), || verdict(EntryVerdict::PriceShort));
        assert_eq!(action, MonitorAction::Hold);
        assert_eq!(mon.state, SymbolState::Wait);
    }

    #[test]
    fn timeout_is_transient() {
        let mut mon = SymbolMonitor::new("BTCUSDT");
        mon.step(false, None, Utc::now(), || verdict(EntryVerdict::TimedOut));
        assert_eq!(mon.state, SymbolState::TimeOut);

        // Next cycle the window is fresh and the rule fires.
        let action = mon.step(false, None, Utc::now(), met);
        assert_eq!(action, MonitorAction::AttemptOpen);
        assert_eq!(mon.state, SymbolState::Signal);
    }

    #[test]
    fn abandoned_open_resets_to_wait() {
        let mut mon = SymbolMonitor::new("BTCUSDT");
        mon.step(false, None, Utc::now(), met);
        mon.lock_acquired();
        mon.open_abandoned();
        assert_eq!(mon.state, SymbolState::Wait);
    }
}
