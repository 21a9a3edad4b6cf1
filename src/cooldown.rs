// =============================================================================
// Cooldown Registry — per-symbol re-entry delay after a close
// =============================================================================
//
// A symbol whose position just closed may not signal again until its cooldown
// expires. Entries are created only at the Closed transition, so a symbol
// with a live position never has a live entry. Expired entries are treated as
// absent on read; `sweep` exists purely to keep the map bounded.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

pub struct CooldownRegistry {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl CooldownRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Bar `symbol` from signalling until `expires_at`.
    pub fn register(&self, symbol: &str, expires_at: DateTime<Utc>) {
        self.entries.write().insert(symbol.to_string(), expires_at);
        info!(symbol, %expires_at, "cooldown registered");
    }

    /// True while an unexpired entry exists for `symbol`.
    pub fn is_cooling_down(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .read()
            .get(symbol)
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Whole minutes left on the cooldown, rounded up. Zero when no live
    /// entry exists.
    pub fn remaining_minutes(&self, symbol: &str, now: DateTime<Utc>) -> i64 {
        let entries = self.entries.read();
        match entries.get(symbol) {
            Some(expires_at) if *expires_at > now => {
                let secs = (*expires_at - now).num_seconds();
                secs / 60 + i64::from(secs % 60 != 0)
            }
            _ => 0,
        }
    }

    /// Drop expired entries. Called at cycle boundaries for bounded memory;
    /// correctness never depends on it.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "expired cooldowns swept");
        }
    }

    /// Operator override: forget every cooldown.
    pub fn clear_all(&self) {
        self.entries.write().clear();
        info!("all cooldowns cleared");
    }

    /// Live (symbol, expires_at) pairs, for the dashboard and persistence.
    pub fn live_entries(&self, now: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, expires_at)| **expires_at > now)
            .map(|(sym, expires_at)| (sym.clone(), *expires_at))
            .collect()
    }
}

impl Default for CooldownRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn unexpired_entry_is_cooling_down() {
        let reg = CooldownRegistry::new();
        let now = Utc::now();
        reg.register("BTCUSDT", now + Duration::minutes(30));
        assert!(reg.is_cooling_down("BTCUSDT", now));
        assert!(!reg.is_cooling_down("ETHUSDT", now));
    }

    #[test]
    fn expired_entry_treated_as_absent_without_sweep() {
        let reg = CooldownRegistry::new();
        let now = Utc::now();
        reg.register("BTCUSDT", now - Duration::seconds(1));
        assert!(!reg.is_cooling_down("BTCUSDT", now));
        assert_eq!(reg.remaining_minutes("BTCUSDT", now), 0);
    }

    #[test]
    fn remaining_minutes_rounds_up() {
        let reg = CooldownRegistry::new();
        let now = Utc::now();
        reg.register("BTCUSDT", now + Duration::seconds(61));
        assert_eq!(reg.remaining_minutes("BTCUSDT", now), 2);
        reg.register("ETHUSDT", now + Duration::seconds(60));
        assert_eq!(reg.remaining_minutes("ETHUSDT", now), 1);
    }

    #[test]
    fn sweep_drops_only_expired() {
        let reg = CooldownRegistry::new();
        let now = Utc::now();
        reg.register("OLD", now - Duration::minutes(5));
        reg.register("LIVE", now + Duration::minutes(5));
        reg.sweep(now);
        assert_eq!(reg.live_entries(now).len(), 1);
        assert!(reg.is_cooling_down("LIVE", now));
    }

    #[test]
    fn clear_all_forgets_everything() {
        let reg = CooldownRegistry::new();
        let now = Utc::now();
        reg.register("A", now + Duration::minutes(5));
        reg.register("B", now + Duration::minutes(5));
        reg.clear_all();
        assert!(!reg.is_cooling_down("A", now));
        assert!(reg.live_entries(now).is_empty());
    }
}
