// =============================================================================
// Surge Breakout Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Users must explicitly
// switch to Live mode via the dashboard or API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod cooldown;
mod cycle;
mod entry;
mod error;
mod executor;
mod history;
mod market_data;
mod monitor;
mod persistence;
mod position_engine;
mod runtime_config;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiContext;
use crate::app_state::AppState;
use crate::binance::client::BinanceClient;
use crate::executor::OrderExecutor;
use crate::history::TradeHistory;
use crate::runtime_config::RuntimeConfig;
use crate::types::{AccountMode, BalanceInfo, TradingMode};

const CONFIG_PATH: &str = "runtime_config.json";
const HISTORY_PATH: &str = "logs/trade_history.json";
const ENGINE_STATE_PATH: &str = "logs/engine_state.json";

/// Seconds between live-account balance refreshes.
const BALANCE_REFRESH_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Surge Breakout Engine starting");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: Force Demo + Paused on startup.
    config.trading_mode = TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        top_gainers = config.thresholds.top_gainers_count,
        timeframe = %config.thresholds.candle_timeframe,
        "Engine starting in SAFE mode (Demo + Paused)"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let history = TradeHistory::open(HISTORY_PATH);
    let state = Arc::new(AppState::new(config, history));

    // Resume rather than cold-start: restore the active position, live
    // cooldowns, and symbol states saved by the previous run.
    let persist_path = PathBuf::from(ENGINE_STATE_PATH);
    if let Err(e) = persistence::restore(&persist_path, &state, chrono::Utc::now()) {
        warn!(error = %e, "engine state restore failed — starting cold");
    }

    // ── 3. Exchange client & executor ────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let client = Arc::new(BinanceClient::new(api_key, api_secret));
    let order_executor = Arc::new(OrderExecutor::new(client.clone()));

    // ── 4. Start the API server ──────────────────────────────────────────
    let ctx = Arc::new(ApiContext {
        state: state.clone(),
        client: client.clone(),
        executor: order_executor.clone(),
    });
    let bind_addr = std::env::var("SURGE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());

    tokio::spawn(async move {
        let app = api::rest::router(ctx);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    // ── 5. Balance reconciliation loop ───────────────────────────────────
    tokio::spawn(run_balance_reconciler(state.clone(), client.clone()));

    // ── 6. Scan loop ─────────────────────────────────────────────────────
    let scan_handle = tokio::spawn(cycle::run_scan_loop(
        state.clone(),
        client.clone(),
        order_executor.clone(),
        persist_path.clone(),
    ));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — draining scan loop");
    state.request_shutdown();

    // Let the current cycle finish its transitions rather than cutting it
    // off mid-symbol.
    let drain = tokio::time::timeout(tokio::time::Duration::from_secs(30), scan_handle);
    if drain.await.is_err() {
        warn!("scan loop did not drain within 30s — continuing shutdown");
    }

    let final_state = persistence::capture(&state, chrono::Utc::now());
    if let Err(e) = persistence::save(&persist_path, &final_state) {
        error!(error = %e, "Failed to save engine state on shutdown");
    }

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Surge Breakout Engine shut down complete.");
    Ok(())
}

/// Keep the cached quote balances fresh for a live account. Demo mode never
/// touches the exchange; the coordinator sizes from its fixed demo budget.
async fn run_balance_reconciler(state: Arc<AppState>, client: Arc<BinanceClient>) {
    let mut ticker =
        tokio::time::interval(tokio::time::Duration::from_secs(BALANCE_REFRESH_SECS));

    loop {
        ticker.tick().await;

        if state.runtime_config.read().account_mode == AccountMode::Demo {
            continue;
        }

        let account = match client.get_account().await {
            Ok(account) => account,
            Err(e) => {
                warn!(error = %e, "balance reconciliation failed");
                continue;
            }
        };

        let Some(raw) = account.get("balances").and_then(|v| v.as_array()) else {
            warn!("account response missing balances array");
            continue;
        };

        let balances: Vec<BalanceInfo> = raw
            .iter()
            .filter_map(|b| {
                let asset = b.get("asset")?.as_str()?.to_string();
                let free = parse_amount(b.get("free"));
                let locked = parse_amount(b.get("locked"));
                (free > 0.0 || locked > 0.0).then_some(BalanceInfo {
                    asset,
                    free,
                    locked,
                })
            })
            .collect();

        *state.balances.write() = balances;
        state.increment_version();
    }
}

/// Binance reports amounts as decimal strings; anything unparseable is zero.
fn parse_amount(value: Option<&serde_json::Value>) -> f64 {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}
