pub mod auth;
pub mod rest;
pub mod ws;

use std::sync::Arc;

use crate::app_state::AppState;
use crate::binance::client::BinanceClient;
use crate::executor::OrderExecutor;

/// Everything a request handler may need: shared engine state plus the
/// exchange-facing collaborators (for operator actions like flatten).
pub struct ApiContext {
    pub state: Arc<AppState>,
    pub client: Arc<BinanceClient>,
    pub executor: Arc<OrderExecutor>,
}
