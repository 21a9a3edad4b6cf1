// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// goes through the `RequireAuth` bearer-token extractor.
//
// Threshold updates are never applied directly: a validated PUT is staged on
// AppState and becomes active at the next scan-cycle boundary, so a cycle in
// flight cannot observe mixed configuration.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::RequireAuth;
use crate::api::ApiContext;
use crate::error::CloseAlert;
use crate::executor::MAX_EXIT_ATTEMPTS;
use crate::runtime_config::Thresholds;
use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/markets", get(markets))
        .route("/api/v1/position", get(position))
        .route("/api/v1/history", get(history))
        .route("/api/v1/history/stats", get(history_stats))
        .route("/api/v1/config/thresholds", get(get_thresholds))
        .route("/api/v1/config/thresholds", put(put_thresholds))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/flatten", post(control_flatten))
        .route("/api/v1/control/account-mode", post(control_account_mode))
        .route("/api/v1/cooldowns/clear", post(clear_cooldowns))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "state_version": ctx.state.current_state_version(),
        "server_time": Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Read endpoints (authenticated)
// =============================================================================

async fn full_state(_auth: RequireAuth, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.state.build_snapshot())
}

async fn markets(_auth: RequireAuth, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let rows = ctx
        .state
        .last_cycle
        .read()
        .as_ref()
        .map(|cycle| cycle.rows.clone())
        .unwrap_or_default();
    Json(rows)
}

async fn position(_auth: RequireAuth, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.state.position_engine.active())
}

async fn history(_auth: RequireAuth, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.state.history.all())
}

async fn history_stats(
    _auth: RequireAuth,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    Json(ctx.state.history.statistics())
}

// =============================================================================
// Thresholds (authenticated)
// =============================================================================

async fn get_thresholds(
    _auth: RequireAuth,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    let active = ctx.state.runtime_config.read().thresholds.clone();
    let pending = ctx.state.pending_thresholds.read().clone();
    Json(json!({
        "active": active,
        "pending": pending,
    }))
}

/// Validate and stage a thresholds update for the next cycle boundary.
async fn put_thresholds(
    _auth: RequireAuth,
    State(ctx): State<Arc<ApiContext>>,
    Json(thresholds): Json<Thresholds>,
) -> impl IntoResponse {
    if let Err(e) = thresholds.validate() {
        warn!(error = %e, "thresholds update rejected");
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": e.to_string() })),
        );
    }

    ctx.state.stage_thresholds(thresholds);
    info!("thresholds update staged for next cycle boundary");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "staged": true })),
    )
}

// =============================================================================
// Control (authenticated)
// =============================================================================

async fn control_pause(
    _auth: RequireAuth,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    ctx.state.runtime_config.write().trading_mode = TradingMode::Paused;
    ctx.state.increment_version();
    info!("trading paused via API");
    Json(json!({ "trading_mode": "Paused" }))
}

async fn control_resume(
    _auth: RequireAuth,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    ctx.state.runtime_config.write().trading_mode = TradingMode::Live;
    ctx.state.increment_version();
    info!("trading resumed via API");
    Json(json!({ "trading_mode": "Live" }))
}

#[derive(Deserialize)]
struct AccountModeRequest {
    mode: AccountMode,
}

async fn control_account_mode(
    _auth: RequireAuth,
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<AccountModeRequest>,
) -> impl IntoResponse {
    if ctx.state.position_engine.has_active() {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "cannot switch account mode with a live position" })),
        );
    }

    ctx.state.runtime_config.write().account_mode = req.mode;
    ctx.state.increment_version();
    info!(mode = %req.mode, "account mode switched via API");
    (StatusCode::OK, Json(json!({ "account_mode": req.mode })))
}

/// Close the live position at market, unconditionally.
async fn control_flatten(
    _auth: RequireAuth,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    let state = &ctx.state;

    let Some(active) = state.position_engine.active() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no live position" })),
        );
    };

    // Best effort on the reference price; the last tracked price is the
    // fallback when the ticker is unreachable.
    let price = match ctx.client.get_price(&active.symbol).await {
        Ok(p) => p,
        Err(e) => {
            warn!(symbol = %active.symbol, error = %e, "flatten: falling back to last tracked price");
            active.current_price
        }
    };

    let now = Utc::now();
    let (thresholds, is_demo) = {
        let config = state.runtime_config.read();
        (
            config.thresholds.clone(),
            config.account_mode == AccountMode::Demo,
        )
    };

    let Some(record) = state.position_engine.force_close(price, now, &thresholds) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no live position" })),
        );
    };

    if let Some(monitor) = state.monitors.write().get_mut(&record.symbol) {
        monitor.position_closed();
    }
    state.history.append(record.clone());
    state.increment_version();

    match ctx
        .executor
        .execute_exit(&record.symbol, record.quantity, record.exit_price, is_demo)
        .await
    {
        Ok(_) => {
            *state.close_alert.write() = None;
            info!(symbol = %record.symbol, "position flattened via API");
        }
        Err(e) => {
            *state.close_alert.write() = Some(CloseAlert {
                symbol: record.symbol.clone(),
                quantity: record.quantity,
                exit_reason: record.exit_reason,
                attempts: MAX_EXIT_ATTEMPTS,
                last_error: e.to_string(),
                raised_at: Utc::now().to_rfc3339(),
            });
            state.push_error(e.to_string());
            warn!(symbol = %record.symbol, error = %e, "flatten exit unconfirmed — alert raised");
        }
    }

    (StatusCode::OK, Json(json!({ "closed": record })))
}

async fn clear_cooldowns(
    _auth: RequireAuth,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    ctx.state.cooldowns.clear_all();
    ctx.state.increment_version();
    Json(json!({ "cleared": true }))
}
