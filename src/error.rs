// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Three failure classes cross module boundaries:
//   DataUnavailable      — a symbol's snapshot is missing or stale; the symbol
//                          is skipped for the cycle, nothing transitions.
//   OrderExecutionFailed — the exchange rejected an order. Entry failures
//                          abandon the open and release the trade lock; exit
//                          failures are retried because the position is
//                          already logically closed.
//   InvalidThresholds    — rejected at the configuration boundary; the engine
//                          never sees an invalid thresholds object.
//
// A rejected lock acquisition is NOT an error: `PositionEngine::try_open`
// returns `LockHeld` as a plain control-flow outcome.
// =============================================================================

use thiserror::Error;

use crate::types::ExitReason;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Snapshot fields missing or stale — the symbol sits out this cycle.
    #[error("data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    /// The exchange rejected or failed an order.
    #[error("{side} order failed for {symbol}: {message}")]
    OrderExecutionFailed {
        symbol: String,
        /// "BUY" or "SELL".
        side: String,
        message: String,
        /// Whether retrying makes sense (network / 5xx / rate limit).
        retryable: bool,
    },

    /// Configuration rejected before it could reach the engine.
    #[error("invalid thresholds: {0}")]
    InvalidThresholds(String),
}

impl EngineError {
    pub fn data_unavailable(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataUnavailable {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    pub fn order_failed(
        symbol: impl Into<String>,
        side: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::OrderExecutionFailed {
            symbol: symbol.into(),
            side: side.into(),
            message: message.into(),
            retryable,
        }
    }

    /// True when the operation may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OrderExecutionFailed { retryable: true, .. })
    }
}

/// Returned by `PositionEngine::try_open` when another symbol already holds
/// the single-position lock. A normal outcome, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHeld {
    /// Symbol of the position currently holding the lock.
    pub held_by: String,
}

impl std::fmt::Display for LockHeld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "trade lock held by {}", self.held_by)
    }
}

/// A close order that has exhausted its retries. Kept on `AppState` as a
/// standing alert until an operator (or a later retry pass) resolves it: the
/// position is logically closed, but the exchange-side exit is unconfirmed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CloseAlert {
    pub symbol: String,
    pub quantity: f64,
    pub exit_reason: ExitReason,
    pub attempts: u32,
    pub last_error: String,
    pub raised_at: String,
}
