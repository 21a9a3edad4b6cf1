// =============================================================================
// Order Executor — routes engine decisions to the exchange
// =============================================================================
//
// The decision engine only ever transitions in-memory state; this module is
// where orders actually happen. Two asymmetric rules from the lifecycle
// contract shape it:
//
//   - An ENTRY order that fails is abandoned: the caller releases the trade
//     lock and the signal is forgotten. No retry — the breakout moment has
//     passed.
//   - An EXIT order backs a position that is already logically Closed. It is
//     retried with bounded backoff, and exhausting the retries surfaces a
//     standing alert rather than undoing the close.
//
// Demo mode produces synthetic fills at the reference price and never talks
// to the exchange.
// =============================================================================

use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::binance::client::{BinanceClient, MarketFill};
use crate::error::EngineError;

/// Exit order attempts before the failure is escalated to an alert.
pub(crate) const MAX_EXIT_ATTEMPTS: u32 = 3;
/// Backoff between exit attempts, seconds.
const EXIT_RETRY_BACKOFF_SECS: [u64; 2] = [2, 5];

pub struct OrderExecutor {
    client: Arc<BinanceClient>,
}

impl OrderExecutor {
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self { client }
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    /// Buy `quote_amount` worth of `symbol` at market. One attempt only.
    pub async fn execute_entry(
        &self,
        symbol: &str,
        quote_amount: f64,
        reference_price: f64,
        is_demo: bool,
    ) -> Result<MarketFill, EngineError> {
        if is_demo {
            let fill = MarketFill {
                fill_price: reference_price,
                quantity: if reference_price > 0.0 {
                    quote_amount / reference_price
                } else {
                    0.0
                },
            };
            info!(
                symbol,
                fill_price = fill.fill_price,
                quantity = fill.quantity,
                "demo entry fill simulated"
            );
            return Ok(fill);
        }

        self.client
            .place_market_buy(symbol, quote_amount)
            .await
            .map_err(|e| {
                warn!(symbol, error = %e, "entry order failed");
                EngineError::order_failed(symbol, "BUY", e.to_string(), false)
            })
    }

    // -------------------------------------------------------------------------
    // Exit
    // -------------------------------------------------------------------------

    /// Sell `quantity` of `symbol` at market, retrying transient failures.
    ///
    /// The position behind this call is already Closed in the engine, so the
    /// caller must treat an error as "exchange exit unconfirmed" and keep the
    /// alert visible until an operator resolves it.
    pub async fn execute_exit(
        &self,
        symbol: &str,
        quantity: f64,
        reference_price: f64,
        is_demo: bool,
    ) -> Result<MarketFill, EngineError> {
        if is_demo {
            let fill = MarketFill {
                fill_price: reference_price,
                quantity,
            };
            info!(
                symbol,
                fill_price = fill.fill_price,
                quantity,
                "demo exit fill simulated"
            );
            return Ok(fill);
        }

        let quantity = self.round_to_lot_size(symbol, quantity).await?;

        let mut last_error = String::new();
        for attempt in 1..=MAX_EXIT_ATTEMPTS {
            match self.client.place_market_sell(symbol, quantity).await {
                Ok(fill) => {
                    info!(
                        symbol,
                        attempt,
                        fill_price = fill.fill_price,
                        quantity = fill.quantity,
                        "exit order filled"
                    );
                    return Ok(fill);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        symbol,
                        attempt,
                        max_attempts = MAX_EXIT_ATTEMPTS,
                        error = %last_error,
                        "exit order failed"
                    );
                    if attempt < MAX_EXIT_ATTEMPTS {
                        let backoff =
                            EXIT_RETRY_BACKOFF_SECS[(attempt as usize - 1).min(1)];
                        sleep(Duration::from_secs(backoff)).await;
                    }
                }
            }
        }

        Err(EngineError::order_failed(
            symbol,
            "SELL",
            format!("{MAX_EXIT_ATTEMPTS} attempts exhausted: {last_error}"),
            true,
        ))
    }

    /// Round a sell quantity down to the symbol's LOT_SIZE step so the
    /// exchange does not reject the order. Falls back to the raw quantity
    /// when the filter cannot be read.
    async fn round_to_lot_size(&self, symbol: &str, quantity: f64) -> Result<f64, EngineError> {
        let info = match self.client.get_symbol_info(symbol).await {
            Ok(info) => info,
            Err(e) => {
                warn!(symbol, error = %e, "could not read LOT_SIZE filter — selling raw quantity");
                return Ok(quantity);
            }
        };

        let lot = info["filters"]
            .as_array()
            .and_then(|filters| {
                filters
                    .iter()
                    .find(|f| f["filterType"].as_str() == Some("LOT_SIZE"))
            })
            .cloned();

        let Some(lot) = lot else {
            return Ok(quantity);
        };

        let step: f64 = lot["stepSize"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let min_qty: f64 = lot["minQty"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);

        let rounded = round_step(quantity, step);

        if rounded < min_qty {
            return Err(EngineError::order_failed(
                symbol,
                "SELL",
                format!("quantity {rounded} below exchange minimum {min_qty}"),
                false,
            ));
        }

        if (quantity - rounded).abs() > f64::EPSILON {
            info!(symbol, from = quantity, to = rounded, step, "sell quantity rounded to lot size");
        }
        Ok(rounded)
    }
}

/// Round `quantity` down to a whole number of `step`s.
fn round_step(quantity: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return quantity;
    }
    (quantity / step).floor() * step
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor")
            .field("client", &"<BinanceClient>")
            .finish()
    }
}
