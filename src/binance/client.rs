// =============================================================================
// Binance REST client
// =============================================================================
//
// Signed requests carry the API key in the X-MBX-APIKEY header and an
// HMAC-SHA256 signature over the query string, with a 5 000 ms recvWindow to
// absorb clock drift. The secret never appears in logs or Debug output.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::market_data::Candle;

type HmacSha256 = Hmac<Sha256>;

/// recvWindow sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Leveraged-token fragments excluded from the gainers scan.
const LEVERAGED_FRAGMENTS: &[&str] = &["DOWN", "UP", "BEAR", "BULL"];

/// Fill details extracted from a market-order response.
#[derive(Debug, Clone)]
pub struct MarketFill {
    pub fill_price: f64,
    pub quantity: f64,
}

#[derive(Clone)]
pub struct BinanceClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    /// Build a client for api.binance.com. The key rides along as a default
    /// header on every request; the secret stays here for signing only.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&api_key) {
            headers.insert("X-MBX-APIKEY", value);
        }

        Self {
            secret: secret.into(),
            base_url: "https://api.binance.com".to_string(),
            client: reqwest::Client::builder()
                .default_headers(headers)
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Full URL for a signed endpoint: params plus timestamp, recvWindow, and
    /// signature.
    fn signed_url(&self, path: &str, params: &str) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis();

        let query = if params.is_empty() {
            format!("timestamp={now_ms}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={now_ms}&recvWindow={RECV_WINDOW}")
        };
        let signature = self.sign(&query);
        format!("{}{path}?{query}&signature={signature}", self.base_url)
    }

    async fn get_json(&self, url: &str, what: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {what} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {what} returned {status}: {body}");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Account / balance
    // -------------------------------------------------------------------------

    /// GET /api/v3/account (signed).
    #[instrument(skip(self), name = "binance::get_account")]
    pub async fn get_account(&self) -> Result<serde_json::Value> {
        let url = self.signed_url("/api/v3/account", "");
        self.get_json(&url, "/api/v3/account").await
    }

    /// Free balance of a single `asset`, zero when the account does not hold
    /// it.
    #[instrument(skip(self), name = "binance::get_balance")]
    pub async fn get_balance(&self, asset: &str) -> Result<f64> {
        let account = self.get_account().await?;
        let balances = account["balances"]
            .as_array()
            .context("account response missing 'balances' array")?;

        let free = balances
            .iter()
            .find(|b| b["asset"].as_str() == Some(asset))
            .map(|b| {
                b["free"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0)
            });

        match free {
            Some(amount) => Ok(amount),
            None => {
                warn!(asset, "asset not found in balances — returning 0.0");
                Ok(0.0)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// Top `count` USDT pairs by 24-hour price change, leveraged tokens
    /// excluded. GET /api/v3/ticker/24hr, public.
    #[instrument(skip(self), name = "binance::get_top_gainers")]
    pub async fn get_top_gainers(&self, count: usize) -> Result<Vec<String>> {
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let body = self.get_json(&url, "/api/v3/ticker/24hr").await?;

        let tickers = body
            .as_array()
            .context("24hr ticker response is not an array")?;

        let mut gainers: Vec<(String, f64)> = tickers
            .iter()
            .filter_map(|t| {
                let symbol = t["symbol"].as_str()?;
                if !symbol.ends_with("USDT") {
                    return None;
                }
                if LEVERAGED_FRAGMENTS.iter().any(|frag| symbol.contains(frag)) {
                    return None;
                }
                let change: f64 = t["priceChangePercent"].as_str()?.parse().ok()?;
                Some((symbol.to_string(), change))
            })
            .collect();

        gainers.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        gainers.truncate(count);

        let symbols: Vec<String> = gainers.into_iter().map(|(sym, _)| sym).collect();
        debug!(count = symbols.len(), "top gainers fetched");
        Ok(symbols)
    }

    /// Latest trade price for `symbol`. GET /api/v3/ticker/price, public.
    #[instrument(skip(self), name = "binance::get_price")]
    pub async fn get_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let body = self.get_json(&url, "/api/v3/ticker/price").await?;

        body["price"]
            .as_str()
            .context("price response missing 'price'")?
            .parse()
            .context("failed to parse price as f64")
    }

    /// The most recent `limit` candles for `symbol`. GET /api/v3/klines,
    /// public. Malformed rows are skipped with a warning rather than failing
    /// the whole fetch.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let body = self.get_json(&url, "/api/v3/klines").await?;

        let rows = body.as_array().context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_kline_row(row) {
                Ok(candle) => candles.push(candle),
                Err(e) => warn!(symbol, error = %e, "skipping malformed kline row"),
            }
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// exchangeInfo entry for one symbol, used to read the LOT_SIZE filter
    /// before a market sell.
    #[instrument(skip(self), name = "binance::get_symbol_info")]
    pub async fn get_symbol_info(&self, symbol: &str) -> Result<serde_json::Value> {
        let url = format!("{}/api/v3/exchangeInfo?symbol={}", self.base_url, symbol);
        let body = self.get_json(&url, "/api/v3/exchangeInfo").await?;

        body["symbols"]
            .as_array()
            .and_then(|arr| arr.first().cloned())
            .context("symbol not found in exchangeInfo response")
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Market BUY spending `quote_amount` of the quote asset (quoteOrderQty).
    #[instrument(skip(self), name = "binance::place_market_buy")]
    pub async fn place_market_buy(&self, symbol: &str, quote_amount: f64) -> Result<MarketFill> {
        let params =
            format!("symbol={symbol}&side=BUY&type=MARKET&quoteOrderQty={quote_amount}");
        self.place_market_order(symbol, "BUY", &params).await
    }

    /// Market SELL of `quantity` base units.
    #[instrument(skip(self), name = "binance::place_market_sell")]
    pub async fn place_market_sell(&self, symbol: &str, quantity: f64) -> Result<MarketFill> {
        let params = format!("symbol={symbol}&side=SELL&type=MARKET&quantity={quantity}");
        self.place_market_order(symbol, "SELL", &params).await
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        params: &str,
    ) -> Result<MarketFill> {
        let url = self.signed_url("/api/v3/order", params);

        debug!(symbol, side, "placing market order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /api/v3/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!("Binance POST /api/v3/order returned {status}: {body}");
        }

        let fill = Self::parse_fill(&body)
            .with_context(|| format!("market {side} for {symbol} returned no usable fill"))?;

        debug!(
            symbol,
            side,
            fill_price = fill.fill_price,
            quantity = fill.quantity,
            "market order filled"
        );
        Ok(fill)
    }

    /// Extract the executed quantity and average fill price from an order
    /// response. Prefers cummulativeQuoteQty / executedQty (true average);
    /// falls back to the first fill's price.
    fn parse_fill(order: &serde_json::Value) -> Result<MarketFill> {
        let executed_qty: f64 = order["executedQty"]
            .as_str()
            .context("order response missing executedQty")?
            .parse()
            .context("failed to parse executedQty")?;

        if executed_qty <= 0.0 {
            anyhow::bail!(
                "order was not filled (status: {})",
                order["status"].as_str().unwrap_or("unknown")
            );
        }

        let quote_qty: Option<f64> = order["cummulativeQuoteQty"]
            .as_str()
            .and_then(|s| s.parse().ok());

        let fill_price = match quote_qty {
            Some(quote) if quote > 0.0 => quote / executed_qty,
            _ => order["fills"]
                .as_array()
                .and_then(|fills| fills.first())
                .and_then(|f| f["price"].as_str())
                .and_then(|s| s.parse().ok())
                .context("order response has neither cummulativeQuoteQty nor fills")?,
        };

        Ok(MarketFill {
            fill_price,
            quantity: executed_qty,
        })
    }
}

/// One kline row is a JSON array:
/// [openTime, open, high, low, close, volume, closeTime, ...].
fn parse_kline_row(row: &serde_json::Value) -> Result<Candle> {
    let arr = row.as_array().context("kline row is not an array")?;
    if arr.len() < 7 {
        anyhow::bail!("kline row has {} elements, need 7", arr.len());
    }

    Ok(Candle::new(
        arr[0].as_i64().unwrap_or(0),
        json_f64(&arr[1])?,
        json_f64(&arr[2])?,
        json_f64(&arr[3])?,
        json_f64(&arr[4])?,
        json_f64(&arr[5])?,
        arr[6].as_i64().unwrap_or(0),
    ))
}

/// Binance mixes string-encoded and plain numbers; accept both.
fn json_f64(value: &serde_json::Value) -> Result<f64> {
    if let Some(s) = value.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else {
        value
            .as_f64()
            .with_context(|| format!("expected string or number, got: {value}"))
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fill_prefers_average_price() {
        let order = serde_json::json!({
            "executedQty": "2.0",
            "cummulativeQuoteQty": "201.0",
            "fills": [{ "price": "99.0" }],
        });
        let fill = BinanceClient::parse_fill(&order).unwrap();
        assert!((fill.fill_price - 100.5).abs() < 1e-9);
        assert!((fill.quantity - 2.0).abs() < 1e-9);
    }

    #[test]
    fn parse_fill_falls_back_to_first_fill() {
        let order = serde_json::json!({
            "executedQty": "1.5",
            "fills": [{ "price": "42.0" }],
        });
        let fill = BinanceClient::parse_fill(&order).unwrap();
        assert!((fill.fill_price - 42.0).abs() < 1e-9);
    }

    #[test]
    fn parse_fill_rejects_unfilled_order() {
        let order = serde_json::json!({
            "executedQty": "0.0",
            "status": "EXPIRED",
        });
        assert!(BinanceClient::parse_fill(&order).is_err());
    }

    #[test]
    fn kline_row_parses_mixed_string_and_number_fields() {
        let row = serde_json::json!([
            1700000000000i64, "100.1", "101.5", "99.8", "100.9", 1234.5, 1700003599999i64
        ]);
        let candle = parse_kline_row(&row).unwrap();
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert!((candle.close - 100.9).abs() < 1e-9);
        assert!((candle.volume - 1234.5).abs() < 1e-9);
    }

    #[test]
    fn short_kline_row_is_rejected() {
        let row = serde_json::json!(["1", "2", "3"]);
        assert!(parse_kline_row(&row).is_err());
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let client = BinanceClient::new("key", "secret");
        let a = client.sign("symbol=BTCUSDT&timestamp=1");
        let b = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
