// =============================================================================
// WebSocket feed — full engine snapshots pushed on change
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>`. The feed polls the engine's
// state-version counter every PUSH_INTERVAL_MS and sends a complete
// StateSnapshot whenever the version moved; the first tick fires immediately,
// so a fresh connection gets the current state without waiting. Frames carry
// a per-connection sequence number so a client can detect drops.
//
// Ping frames are answered with Pong. Any inbound text is treated as a
// client heartbeat and ignored.
// =============================================================================

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::api::ApiContext;
use crate::app_state::AppState;

/// How often the feed checks the state version.
const PUSH_INTERVAL_MS: u64 = 500;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Upgrade handler. The token travels as a query parameter because browsers
/// cannot set headers on a WebSocket handshake.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<ApiContext>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if !validate_token(query.token.as_deref().unwrap_or_default()) {
        warn!("websocket rejected — bad or missing token");
        return (StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    let state = ctx.state.clone();
    ws.on_upgrade(move |socket| serve_feed(socket, state))
        .into_response()
}

/// Drive one connection until the client leaves or a send fails.
async fn serve_feed(socket: WebSocket, state: Arc<AppState>) {
    info!("websocket feed connected");

    let (mut sink, mut stream) = socket.split();
    let mut ticker = interval(Duration::from_millis(PUSH_INTERVAL_MS));
    let mut sequence: u64 = 0;
    // Version 0 is never a live value, so the first tick always pushes.
    let mut pushed_version: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let version = state.current_state_version();
                if version == pushed_version {
                    continue;
                }
                sequence += 1;
                if push_snapshot(&mut sink, &state, sequence).await.is_err() {
                    debug!("websocket send failed — closing feed");
                    break;
                }
                pushed_version = version;
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("websocket client left");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "websocket heartbeat");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    info!("websocket feed closed");
}

/// Serialise the current snapshot and send it with its sequence number.
async fn push_snapshot(
    sink: &mut SplitSink<WebSocket, Message>,
    state: &Arc<AppState>,
    sequence: u64,
) -> Result<(), axum::Error> {
    let snapshot = state.build_snapshot();
    let version = snapshot.state_version;
    let frame = serde_json::json!({
        "seq": sequence,
        "snapshot": snapshot,
    });

    state.ws_sequence_number.fetch_add(1, Ordering::Relaxed);

    sink.send(Message::Text(frame.to_string())).await?;
    debug!(seq = sequence, version, "snapshot pushed");
    Ok(())
}
