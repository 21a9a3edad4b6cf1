// =============================================================================
// Entry Evaluator — the breakout rule
// =============================================================================
//
// Pure and deterministic: the same snapshot and thresholds always produce the
// same verdict, so the rule is testable without the engine around it. A
// signal requires all three conditions in one reading:
//   1. the candle is still young (elapsed <= volume_time_limit_minutes)
//   2. current volume >= previous volume × volume_multiplier
//   3. current price  >= previous close × (1 + price_change_percent / 100)
//
// A zero previous volume or close price means the baseline candle is not
// usable yet; that is "insufficient data", never a signal and never an error.
// =============================================================================

use crate::market_data::CandleSnapshot;
use crate::runtime_config::Thresholds;

/// Outcome of one evaluation of the breakout rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryVerdict {
    /// Previous candle baseline missing or zero — rule cannot be applied.
    InsufficientData,
    /// The surge window for this candle has passed.
    TimedOut,
    /// Volume has not reached the required multiple yet.
    VolumeShort,
    /// Price has not reached the required gain yet.
    PriceShort,
    /// All conditions met.
    Met,
}

/// Evaluation result with the computed requirement levels, for display.
#[derive(Debug, Clone)]
pub struct EntryCheck {
    pub verdict: EntryVerdict,
    pub required_volume: f64,
    pub required_price: f64,
}

impl EntryCheck {
    pub fn is_signal(&self) -> bool {
        self.verdict == EntryVerdict::Met
    }
}

/// Run the breakout rule against one snapshot.
pub fn check(snapshot: &CandleSnapshot, thresholds: &Thresholds) -> EntryCheck {
    // Baseline must exist before any ratio is meaningful.
    if snapshot.prev_volume <= 0.0 || snapshot.prev_close_price <= 0.0 {
        return EntryCheck {
            verdict: EntryVerdict::InsufficientData,
            required_volume: 0.0,
            required_price: 0.0,
        };
    }

    let required_volume = snapshot.prev_volume * thresholds.volume_multiplier;
    let required_price =
        snapshot.prev_close_price * (1.0 + thresholds.price_change_percent / 100.0);

    let verdict = if snapshot.elapsed_minutes > thresholds.volume_time_limit_minutes {
        EntryVerdict::TimedOut
    } else if snapshot.current_volume < required_volume {
        EntryVerdict::VolumeShort
    } else if snapshot.current_price < required_price {
        EntryVerdict::PriceShort
    } else {
        EntryVerdict::Met
    };

    EntryCheck {
        verdict,
        required_volume,
        required_price,
    }
}

/// True iff the snapshot satisfies every entry condition.
pub fn evaluate(snapshot: &CandleSnapshot, thresholds: &Thresholds) -> bool {
    check(snapshot, thresholds).is_signal()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(
        price: f64,
        volume: f64,
        prev_close: f64,
        prev_volume: f64,
        elapsed: u32,
    ) -> CandleSnapshot {
        CandleSnapshot {
            symbol: "TESTUSDT".to_string(),
            current_price: price,
            current_volume: volume,
            prev_close_price: prev_close,
            prev_volume,
            elapsed_minutes: elapsed,
            observed_at: Utc::now(),
        }
    }

    fn thresholds(multiplier: f64, time_limit: u32, price_change: f64) -> Thresholds {
        Thresholds {
            volume_multiplier: multiplier,
            volume_time_limit_minutes: time_limit,
            price_change_percent: price_change,
            ..Thresholds::default()
        }
    }

    #[test]
    fn all_conditions_met_signals() {
        // 500 >= 200*2, 100 >= 95*1.02 = 96.9, 10 <= 15
        let snap = snapshot(100.0, 500.0, 95.0, 200.0, 10);
        let th = thresholds(2.0, 15, 2.0);
        assert!(evaluate(&snap, &th));

        let chk = check(&snap, &th);
        assert_eq!(chk.verdict, EntryVerdict::Met);
        assert!((chk.required_volume - 400.0).abs() < 1e-9);
        assert!((chk.required_price - 96.9).abs() < 1e-9);
    }

    #[test]
    fn zero_prev_volume_is_insufficient_data() {
        let snap = snapshot(100.0, 500.0, 95.0, 0.0, 10);
        let th = thresholds(2.0, 15, 2.0);
        assert!(!evaluate(&snap, &th));
        assert_eq!(check(&snap, &th).verdict, EntryVerdict::InsufficientData);
    }

    #[test]
    fn zero_prev_close_is_insufficient_data() {
        let snap = snapshot(100.0, 500.0, 0.0, 200.0, 10);
        let th = thresholds(2.0, 15, 2.0);
        assert!(!evaluate(&snap, &th));
        assert_eq!(check(&snap, &th).verdict, EntryVerdict::InsufficientData);
    }

    #[test]
    fn elapsed_past_limit_times_out() {
        let snap = snapshot(100.0, 500.0, 95.0, 200.0, 16);
        let th = thresholds(2.0, 15, 2.0);
        assert_eq!(check(&snap, &th).verdict, EntryVerdict::TimedOut);
    }

    #[test]
    fn elapsed_at_limit_still_valid() {
        let snap = snapshot(100.0, 500.0, 95.0, 200.0, 15);
        let th = thresholds(2.0, 15, 2.0);
        assert_eq!(check(&snap, &th).verdict, EntryVerdict::Met);
    }

    #[test]
    fn volume_below_requirement_waits() {
        let snap = snapshot(100.0, 399.0, 95.0, 200.0, 10);
        let th = thresholds(2.0, 15, 2.0);
        assert_eq!(check(&snap, &th).verdict, EntryVerdict::VolumeShort);
    }

    #[test]
    fn volume_exactly_at_requirement_passes() {
        let snap = snapshot(100.0, 400.0, 95.0, 200.0, 10);
        let th = thresholds(2.0, 15, 2.0);
        assert_eq!(check(&snap, &th).verdict, EntryVerdict::Met);
    }

    #[test]
    fn price_below_requirement_waits() {
        let snap = snapshot(96.8, 500.0, 95.0, 200.0, 10);
        let th = thresholds(2.0, 15, 2.0);
        assert_eq!(check(&snap, &th).verdict, EntryVerdict::PriceShort);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let snap = snapshot(100.0, 500.0, 95.0, 200.0, 10);
        let th = thresholds(2.0, 15, 2.0);
        for _ in 0..10 {
            assert_eq!(check(&snap, &th).verdict, check(&snap, &th).verdict);
            assert!(evaluate(&snap, &th));
        }
    }
}
