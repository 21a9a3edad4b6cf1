// =============================================================================
// Trade History — append-only record of closed positions
// =============================================================================
//
// A TradeRecord is created exactly once, when a position reaches Closed, and
// never mutated afterwards. The log is persisted to a JSON file with the
// atomic tmp + rename pattern so a crash mid-write cannot corrupt it.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::ExitReason;

/// Immutable record of one completed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl_percent: f64,
    pub exit_reason: ExitReason,
}

/// Aggregate statistics over the whole history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub average_pnl: f64,
    pub total_pnl: f64,
}

/// Thread-safe, append-only trade log with JSON file persistence.
pub struct TradeHistory {
    records: RwLock<Vec<TradeRecord>>,
    file: PathBuf,
}

impl TradeHistory {
    /// Open (or create) the history backed by `file`. A missing file is an
    /// empty history; an unreadable one is logged and treated as empty.
    pub fn open(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let records = match std::fs::read_to_string(&file) {
            Ok(content) => match serde_json::from_str::<Vec<TradeRecord>>(&content) {
                Ok(records) => {
                    info!(count = records.len(), path = %file.display(), "trade history loaded");
                    records
                }
                Err(e) => {
                    warn!(error = %e, path = %file.display(), "trade history unreadable — starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        Self {
            records: RwLock::new(records),
            file,
        }
    }

    /// Append a completed trade and persist.
    pub fn append(&self, record: TradeRecord) {
        info!(
            symbol = %record.symbol,
            pnl_percent = record.pnl_percent,
            exit_reason = %record.exit_reason,
            "trade added to history"
        );
        self.records.write().push(record);
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist trade history");
        }
    }

    fn save(&self) -> Result<()> {
        let content = {
            let records = self.records.read();
            serde_json::to_string_pretty(&*records).context("failed to serialise trade history")?
        };

        if let Some(dir) = self.file.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let tmp = self.file.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.file)
            .with_context(|| format!("failed to rename into {}", self.file.display()))?;
        Ok(())
    }

    /// All records, oldest first.
    pub fn all(&self) -> Vec<TradeRecord> {
        self.records.read().clone()
    }

    /// The most recent `count` records, newest first.
    pub fn recent(&self, count: usize) -> Vec<TradeRecord> {
        let records = self.records.read();
        records.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Win rate, average and total PnL across the log.
    pub fn statistics(&self) -> HistoryStats {
        let records = self.records.read();
        if records.is_empty() {
            return HistoryStats {
                total_trades: 0,
                winning_trades: 0,
                losing_trades: 0,
                win_rate: 0.0,
                average_pnl: 0.0,
                total_pnl: 0.0,
            };
        }

        let winning = records.iter().filter(|r| r.pnl_percent > 0.0).count();
        let total_pnl: f64 = records.iter().map(|r| r.pnl_percent).sum();

        HistoryStats {
            total_trades: records.len(),
            winning_trades: winning,
            losing_trades: records.len() - winning,
            win_rate: winning as f64 / records.len() as f64 * 100.0,
            average_pnl: total_pnl / records.len() as f64,
            total_pnl,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn record(symbol: &str, pnl: f64) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            symbol: symbol.to_string(),
            entry_time: now,
            exit_time: now,
            entry_price: 100.0,
            exit_price: 100.0 * (1.0 + pnl / 100.0),
            quantity: 1.0,
            pnl_percent: pnl,
            exit_reason: ExitReason::TrailingStop,
        }
    }

    fn temp_history() -> (tempfile::TempDir, TradeHistory) {
        let dir = tempfile::tempdir().unwrap();
        let history = TradeHistory::open(dir.path().join("trade_history.json"));
        (dir, history)
    }

    #[test]
    fn empty_history_has_zero_stats() {
        let (_dir, history) = temp_history();
        let stats = history.statistics();
        assert_eq!(stats.total_trades, 0);
        assert_eq!(stats.win_rate, 0.0);
        assert_eq!(stats.total_pnl, 0.0);
    }

    #[test]
    fn statistics_aggregate_wins_and_losses() {
        let (_dir, history) = temp_history();
        history.append(record("BTCUSDT", 4.0));
        history.append(record("ETHUSDT", -1.5));
        history.append(record("SOLUSDT", 2.5));
        history.append(record("XRPUSDT", 0.0));

        let stats = history.statistics();
        assert_eq!(stats.total_trades, 4);
        assert_eq!(stats.winning_trades, 2);
        assert_eq!(stats.losing_trades, 2);
        assert!((stats.win_rate - 50.0).abs() < 1e-9);
        assert!((stats.total_pnl - 5.0).abs() < 1e-9);
        assert!((stats.average_pnl - 1.25).abs() < 1e-9);
    }

    #[test]
    fn recent_returns_newest_first() {
        let (_dir, history) = temp_history();
        history.append(record("A", 1.0));
        history.append(record("B", 2.0));
        history.append(record("C", 3.0));

        let recent = history.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].symbol, "C");
        assert_eq!(recent[1].symbol, "B");
    }

    #[test]
    fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade_history.json");

        {
            let history = TradeHistory::open(&path);
            history.append(record("BTCUSDT", 2.0));
            history.append(record("ETHUSDT", -1.0));
        }

        let reopened = TradeHistory::open(&path);
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.all()[0].symbol, "BTCUSDT");
    }
}
