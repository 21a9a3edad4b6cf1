// =============================================================================
// Market Data — candle tracking for the breakout rule
// =============================================================================
//
// The breakout rule reads exactly two candles per symbol: the PREVIOUS fully
// closed candle (its close price and volume are the baseline) and the CURRENT
// in-progress candle (live price, accumulated volume, minutes elapsed since
// open). The tracker guarantees:
//   - the previous candle is locked once per candle interval and never
//     changes mid-interval;
//   - elapsed minutes are clamped to [0, interval_minutes];
//   - REST fetches are throttled by a per-symbol TTL so a scan cycle never
//     hammers the klines endpoint.
// =============================================================================

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::binance::client::BinanceClient;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle parsed from the exchange klines endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// One immutable market reading for a symbol at a point in time. Built once
/// per symbol per scan cycle and handed to the decision engine.
#[derive(Debug, Clone, Serialize)]
pub struct CandleSnapshot {
    pub symbol: String,
    pub current_price: f64,
    pub current_volume: f64,
    pub prev_close_price: f64,
    pub prev_volume: f64,
    pub elapsed_minutes: u32,
    pub observed_at: DateTime<Utc>,
}

/// Minutes covered by a candle interval string ("1h" → 60).
pub fn interval_minutes(interval: &str) -> u32 {
    match interval {
        "1m" => 1,
        "5m" => 5,
        "15m" => 15,
        "30m" => 30,
        "1h" => 60,
        "4h" => 240,
        other => {
            warn!(interval = other, "unknown candle interval — assuming 60 minutes");
            60
        }
    }
}

// ---------------------------------------------------------------------------
// CandleTracker
// ---------------------------------------------------------------------------

/// Previous candle baseline, locked for the duration of the current interval.
#[derive(Debug, Clone)]
struct PrevCandle {
    close_price: f64,
    volume: f64,
}

/// Live view of the in-progress candle.
#[derive(Debug, Clone)]
struct CurrentCandle {
    open_time_ms: i64,
    price: f64,
    volume: f64,
}

#[derive(Debug)]
struct SymbolCandles {
    prev: Option<PrevCandle>,
    current: Option<CurrentCandle>,
    /// open_time of the current candle when `prev` was last locked.
    locked_for_open_time: i64,
    last_fetch: Option<Instant>,
}

impl SymbolCandles {
    fn new() -> Self {
        Self {
            prev: None,
            current: None,
            locked_for_open_time: 0,
            last_fetch: None,
        }
    }
}

/// Thread-safe tracker of the (previous, current) candle pair per symbol.
pub struct CandleTracker {
    symbols: RwLock<HashMap<String, SymbolCandles>>,
    /// Minimum seconds between klines fetches for the same symbol.
    fetch_ttl_secs: u64,
}

impl CandleTracker {
    pub fn new(fetch_ttl_secs: u64) -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
            fetch_ttl_secs,
        }
    }

    /// Refresh the candle pair for `symbol` from the exchange.
    ///
    /// Fetches the two most recent klines. The older one becomes the locked
    /// previous candle the first time a new interval is observed; the newer
    /// one updates the live view. Returns Ok(false) when the fetch was
    /// skipped because the TTL has not elapsed.
    pub async fn refresh(
        &self,
        client: &BinanceClient,
        symbol: &str,
        interval: &str,
    ) -> Result<bool> {
        {
            let map = self.symbols.read();
            if let Some(entry) = map.get(symbol) {
                if let Some(at) = entry.last_fetch {
                    if at.elapsed().as_secs() < self.fetch_ttl_secs {
                        return Ok(false);
                    }
                }
            }
        }

        let klines = client
            .get_klines(symbol, interval, 2)
            .await
            .with_context(|| format!("klines fetch failed for {symbol}"))?;

        if klines.len() < 2 {
            anyhow::bail!("need 2 klines for {symbol}, got {}", klines.len());
        }

        let prev = &klines[klines.len() - 2];
        let curr = &klines[klines.len() - 1];

        let mut map = self.symbols.write();
        let entry = map
            .entry(symbol.to_string())
            .or_insert_with(SymbolCandles::new);

        // Lock the previous candle once per interval: only when the current
        // candle's open time moves forward.
        if entry.locked_for_open_time != curr.open_time {
            entry.prev = Some(PrevCandle {
                close_price: prev.close,
                volume: prev.volume,
            });
            entry.locked_for_open_time = curr.open_time;
            debug!(symbol, open_time = curr.open_time, "previous candle locked");
        }

        entry.current = Some(CurrentCandle {
            open_time_ms: curr.open_time,
            price: curr.close,
            volume: curr.volume,
        });
        entry.last_fetch = Some(Instant::now());

        Ok(true)
    }

    /// Build an immutable snapshot for `symbol`, or None if either candle is
    /// not yet known.
    pub fn snapshot(&self, symbol: &str, interval: &str, now: DateTime<Utc>) -> Option<CandleSnapshot> {
        let map = self.symbols.read();
        let entry = map.get(symbol)?;
        let prev = entry.prev.as_ref()?;
        let current = entry.current.as_ref()?;

        Some(CandleSnapshot {
            symbol: symbol.to_string(),
            current_price: current.price,
            current_volume: current.volume,
            prev_close_price: prev.close_price,
            prev_volume: prev.volume,
            elapsed_minutes: elapsed_minutes(current.open_time_ms, now, interval_minutes(interval)),
            observed_at: now,
        })
    }

    /// Drop symbols no longer monitored so the map stays bounded.
    pub fn retain(&self, keep: &[String]) {
        let mut map = self.symbols.write();
        map.retain(|sym, _| keep.iter().any(|k| k == sym));
    }
}

/// Minutes since the candle opened, clamped to [0, cap].
fn elapsed_minutes(open_time_ms: i64, now: DateTime<Utc>, cap: u32) -> u32 {
    let elapsed = (now.timestamp_millis() - open_time_ms) / 60_000;
    if elapsed < 0 {
        0
    } else if elapsed as u32 >= cap {
        cap
    } else {
        elapsed as u32
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn elapsed_clamps_to_zero_for_future_open() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let open_ms = (1_700_000_000 + 120) * 1000;
        assert_eq!(elapsed_minutes(open_ms, now, 60), 0);
    }

    #[test]
    fn elapsed_clamps_to_interval_cap() {
        let now = Utc.timestamp_opt(1_700_010_000, 0).unwrap();
        // Opened ~166 minutes ago on a 60-minute interval.
        let open_ms = 1_700_000_000 * 1000;
        assert_eq!(elapsed_minutes(open_ms, now, 60), 60);
    }

    #[test]
    fn elapsed_counts_whole_minutes() {
        let now = Utc.timestamp_opt(1_700_000_000 + 610, 0).unwrap();
        let open_ms = 1_700_000_000 * 1000;
        assert_eq!(elapsed_minutes(open_ms, now, 60), 10);
    }

    #[test]
    fn interval_minutes_known_values() {
        assert_eq!(interval_minutes("1m"), 1);
        assert_eq!(interval_minutes("15m"), 15);
        assert_eq!(interval_minutes("1h"), 60);
        assert_eq!(interval_minutes("4h"), 240);
    }
}
