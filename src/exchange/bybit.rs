// =============================================================================
// Bybit V5 REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-BAPI-* headers with a 5 000 ms recv-window to tolerate minor clock
// drift; the signature covers timestamp + key + recv-window + payload.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use crate::clock::SharedClock;
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::{
    check_clock_drift, map_http_status, map_transport_error, AccountBalance, Exchange,
    OpenPositionRequest, SymbolPrecision, TakeProfitUpdate,
};
use crate::types::{Candle, Side};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;
/// All requests target the USDT-perp book.
const CATEGORY: &str = "linear";

pub struct BybitExchange {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    clock: SharedClock,
    connected: AtomicBool,
}

impl BybitExchange {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        testnet: bool,
        request_timeout_seconds: u64,
        clock: SharedClock,
    ) -> Self {
        let base_url = if testnet {
            "https://api-testnet.bybit.com".to_string()
        } else {
            "https://api.bybit.com".to_string()
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(request_timeout_seconds))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "BybitExchange initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url,
            client,
            clock,
            connected: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex over `timestamp + api_key + recv_window + payload`.
    fn sign(&self, timestamp_ms: i64, payload: &str) -> String {
        let message = format!("{timestamp_ms}{}{RECV_WINDOW}{payload}", self.api_key);
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(&self, payload: &str) -> Vec<(&'static str, String)> {
        let timestamp = self.clock.now_ms();
        vec![
            ("X-BAPI-API-KEY", self.api_key.clone()),
            ("X-BAPI-TIMESTAMP", timestamp.to_string()),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string()),
            ("X-BAPI-SIGN", self.sign(timestamp, payload)),
        ]
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn get(&self, path: &str, query: &str, signed: bool) -> ExchangeResult<serde_json::Value> {
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };

        let mut request = self.client.get(&url);
        if signed {
            for (name, value) in self.signed_headers(query) {
                request = request.header(name, value);
            }
        }

        let response = request.send().await.map_err(map_transport_error)?;
        Self::decode(response).await
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> ExchangeResult<serde_json::Value> {
        let url = format!("{}{path}", self.base_url);
        let payload = body.to_string();

        let mut request = self.client.post(&url).json(body);
        for (name, value) in self.signed_headers(&payload) {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> ExchangeResult<serde_json::Value> {
        let status = response.status();
        let retry_after_ms = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(|secs| secs * 1_000);

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::network(format!("failed to parse response body: {e}")))?;

        if let Some(err) = map_http_status(status, retry_after_ms, &body.to_string()) {
            return Err(err);
        }

        let ret_code = body["retCode"].as_i64().unwrap_or(0);
        if ret_code != 0 {
            let message = body["retMsg"].as_str().unwrap_or("").to_string();
            return Err(Self::map_ret_code(ret_code, message));
        }

        Ok(body)
    }

    /// Bybit business-level error codes onto the taxonomy.
    fn map_ret_code(code: i64, message: String) -> ExchangeError {
        match code {
            10006 | 10018 => ExchangeError::RateLimit {
                retry_after_ms: 1_000,
                message,
            },
            10003 | 10004 | 33004 => ExchangeError::Authentication { message },
            110007 | 110012 => ExchangeError::InsufficientFunds { message },
            10001 | 110003 | 110009 => ExchangeError::InvalidArgument { message },
            _ => ExchangeError::unknown(code.to_string(), message),
        }
    }

    /// Current position size (base asset) for reduce-only closes.
    async fn position_size(&self, symbol: &str) -> ExchangeResult<f64> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let body = self.get("/v5/position/list", &query, true).await?;

        let entry = body["result"]["list"]
            .as_array()
            .and_then(|list| list.first())
            .ok_or_else(|| ExchangeError::not_found(format!("no position for {symbol}")))?;

        parse_str_f64(&entry["size"], "position.size")
    }

    /// One side of a position's close quantity, given the side we opened.
    async fn position_side(&self, symbol: &str) -> ExchangeResult<Side> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let body = self.get("/v5/position/list", &query, true).await?;
        let entry = body["result"]["list"]
            .as_array()
            .and_then(|list| list.first())
            .ok_or_else(|| ExchangeError::not_found(format!("no position for {symbol}")))?;

        match entry["side"].as_str() {
            Some("Buy") => Ok(Side::Long),
            Some("Sell") => Ok(Side::Short),
            other => Err(ExchangeError::unknown(
                "side",
                format!("unexpected position side: {other:?}"),
            )),
        }
    }
}

#[async_trait]
impl Exchange for BybitExchange {
    fn name(&self) -> &'static str {
        "bybit"
    }

    async fn connect(&self) -> ExchangeResult<()> {
        self.health_check().await?;
        self.connected.store(true, Ordering::SeqCst);
        info!(base_url = %self.base_url, "bybit connected");
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("bybit disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), name = "bybit::health_check")]
    async fn health_check(&self) -> ExchangeResult<()> {
        let server_time = self.get_server_time().await?;
        check_clock_drift(self.clock.now_ms(), server_time)
    }

    #[instrument(skip(self), name = "bybit::get_candles")]
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let query = format!(
            "category={CATEGORY}&symbol={symbol}&interval={}&limit={limit}",
            interval_code(interval)?
        );
        let body = self.get("/v5/market/kline", &query, false).await?;

        let list = body["result"]["list"]
            .as_array()
            .ok_or_else(|| ExchangeError::network("kline response missing result.list"))?;

        // Bybit returns newest first; the engine wants oldest first.
        let mut candles = Vec::with_capacity(list.len());
        for entry in list.iter().rev() {
            let row = entry
                .as_array()
                .ok_or_else(|| ExchangeError::network("kline entry is not an array"))?;
            if row.len() < 6 {
                warn!(len = row.len(), "skipping malformed kline row");
                continue;
            }
            candles.push(Candle::new(
                parse_str_i64(&row[0], "kline.start")?,
                parse_str_f64(&row[1], "kline.open")?,
                parse_str_f64(&row[2], "kline.high")?,
                parse_str_f64(&row[3], "kline.low")?,
                parse_str_f64(&row[4], "kline.close")?,
                parse_str_f64(&row[5], "kline.volume")?,
            ));
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "bybit::get_latest_price")]
    async fn get_latest_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let body = self.get("/v5/market/tickers", &query, false).await?;

        let ticker = body["result"]["list"]
            .as_array()
            .and_then(|list| list.first())
            .ok_or_else(|| ExchangeError::not_found(format!("no ticker for {symbol}")))?;

        parse_str_f64(&ticker["lastPrice"], "ticker.lastPrice")
    }

    async fn get_server_time(&self) -> ExchangeResult<i64> {
        let body = self.get("/v5/market/time", "", false).await?;
        let seconds = parse_str_i64(&body["result"]["timeSecond"], "timeSecond")?;
        Ok(seconds * 1_000)
    }

    #[instrument(skip(self), name = "bybit::get_symbol_precision")]
    async fn get_symbol_precision(&self, symbol: &str) -> ExchangeResult<SymbolPrecision> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let body = self.get("/v5/market/instruments-info", &query, false).await?;

        let info = body["result"]["list"]
            .as_array()
            .and_then(|list| list.first())
            .ok_or_else(|| ExchangeError::not_found(format!("no instrument info for {symbol}")))?;

        let tick_size = parse_str_f64(&info["priceFilter"]["tickSize"], "tickSize")?;
        let qty_step = parse_str_f64(&info["lotSizeFilter"]["qtyStep"], "qtyStep")?;
        let min_order_qty = parse_str_f64(&info["lotSizeFilter"]["minOrderQty"], "minOrderQty")?;

        Ok(SymbolPrecision {
            price_precision: decimals_of(tick_size),
            quantity_precision: decimals_of(qty_step),
            min_order_qty,
        })
    }

    #[instrument(skip(self), name = "bybit::get_funding_rate")]
    async fn get_funding_rate(&self, symbol: &str) -> ExchangeResult<f64> {
        let query = format!("category={CATEGORY}&symbol={symbol}&limit=1");
        let body = self
            .get("/v5/market/funding/history", &query, false)
            .await?;

        let entry = body["result"]["list"]
            .as_array()
            .and_then(|list| list.first())
            .ok_or_else(|| ExchangeError::not_found(format!("no funding data for {symbol}")))?;

        parse_str_f64(&entry["fundingRate"], "fundingRate")
    }

    #[instrument(skip(self), name = "bybit::get_balance")]
    async fn get_balance(&self) -> ExchangeResult<AccountBalance> {
        let body = self
            .get("/v5/account/wallet-balance", "accountType=UNIFIED", true)
            .await?;

        let account = body["result"]["list"]
            .as_array()
            .and_then(|list| list.first())
            .ok_or_else(|| ExchangeError::network("wallet-balance response empty"))?;

        Ok(AccountBalance {
            wallet: parse_str_f64(&account["totalEquity"], "totalEquity")?,
            available: parse_str_f64(&account["totalAvailableBalance"], "totalAvailableBalance")?,
            margin_used: parse_str_f64(&account["totalInitialMargin"], "totalInitialMargin")
                .unwrap_or(0.0),
            unrealized_pnl: parse_str_f64(&account["totalPerpUPL"], "totalPerpUPL").unwrap_or(0.0),
        })
    }

    #[instrument(skip(self), name = "bybit::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        // 110043 = leverage not modified; that is success for our purposes.
        match self.post("/v5/position/set-leverage", &body).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::Unknown { code, .. }) if code == "110043" => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, request), name = "bybit::open_position")]
    async fn open_position(&self, request: &OpenPositionRequest) -> ExchangeResult<String> {
        let side = match request.side {
            Side::Long => "Buy",
            Side::Short => "Sell",
        };

        let mut body = serde_json::json!({
            "category": CATEGORY,
            "symbol": request.symbol,
            "side": side,
            "orderType": "Market",
            "qty": request.quantity.to_string(),
            "stopLoss": request.stop_loss.to_string(),
            "tpslMode": "Partial",
        });
        if let Some(tp) = request.first_take_profit {
            body["takeProfit"] = serde_json::Value::String(tp.to_string());
        }

        let response = self.post("/v5/order/create", &body).await?;
        let order_id = response["result"]["orderId"]
            .as_str()
            .ok_or_else(|| ExchangeError::network("order response missing orderId"))?
            .to_string();

        info!(
            symbol = %request.symbol,
            side = %request.side,
            qty = request.quantity,
            stop_loss = request.stop_loss,
            order_id = %order_id,
            "position opened with protective orders"
        );
        Ok(order_id)
    }

    #[instrument(skip(self, update), name = "bybit::update_take_profit_partial")]
    async fn update_take_profit_partial(&self, update: &TakeProfitUpdate) -> ExchangeResult<()> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": update.symbol,
            "takeProfit": update.price.to_string(),
            "tpSize": update.size.to_string(),
            "tpslMode": "Partial",
            "positionIdx": 0,
        });
        self.post("/v5/position/trading-stop", &body).await?;
        debug!(symbol = %update.symbol, index = update.index, price = update.price, "TP leg set");
        Ok(())
    }

    #[instrument(skip(self), name = "bybit::close_position")]
    async fn close_position(&self, position_id: &str, percentage: f64) -> ExchangeResult<()> {
        // position_id identifies the opening order; the symbol is encoded in
        // the engine's single-symbol config, carried here via the id registry.
        let symbol = symbol_of(position_id)?;
        let size = self.position_size(&symbol).await?;
        let side = self.position_side(&symbol).await?;
        let close_qty = size * percentage.clamp(0.0, 100.0) / 100.0;

        if close_qty <= 0.0 {
            return Err(ExchangeError::invalid_argument("close quantity is zero"));
        }

        // Closing means the opposite side, reduce-only.
        let close_side = match side {
            Side::Long => "Sell",
            Side::Short => "Buy",
        };

        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "side": close_side,
            "orderType": "Market",
            "qty": close_qty.to_string(),
            "reduceOnly": true,
        });
        self.post("/v5/order/create", &body).await?;

        info!(symbol = %symbol, percentage, qty = close_qty, "position close submitted");
        Ok(())
    }

    #[instrument(skip(self), name = "bybit::update_stop_loss")]
    async fn update_stop_loss(&self, position_id: &str, new_price: f64) -> ExchangeResult<()> {
        let symbol = symbol_of(position_id)?;
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "stopLoss": new_price.to_string(),
            "positionIdx": 0,
        });
        self.post("/v5/position/trading-stop", &body).await?;
        info!(symbol = %symbol, new_price, "stop-loss updated");
        Ok(())
    }

    #[instrument(skip(self), name = "bybit::activate_trailing")]
    async fn activate_trailing(
        &self,
        position_id: &str,
        trailing_percent: f64,
    ) -> ExchangeResult<()> {
        let symbol = symbol_of(position_id)?;
        let price = self.get_latest_price(&symbol).await?;
        let distance = price * trailing_percent / 100.0;

        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "trailingStop": format!("{distance:.8}"),
            "positionIdx": 0,
        });
        self.post("/v5/position/trading-stop", &body).await?;
        info!(symbol = %symbol, trailing_percent, distance, "trailing stop activated");
        Ok(())
    }

    #[instrument(skip(self), name = "bybit::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
        });
        let response = self.post("/v5/order/cancel-all", &body).await?;
        let count = response["result"]["list"]
            .as_array()
            .map(|list| list.len() as u32)
            .unwrap_or(0);
        info!(symbol, count, "orders cancelled");
        Ok(count)
    }

    #[instrument(skip(self), name = "bybit::cancel_all_conditional_orders")]
    async fn cancel_all_conditional_orders(&self) -> ExchangeResult<u32> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "settleCoin": "USDT",
            "orderFilter": "StopOrder",
        });
        let response = self.post("/v5/order/cancel-all", &body).await?;
        let count = response["result"]["list"]
            .as_array()
            .map(|list| list.len() as u32)
            .unwrap_or(0);
        info!(count, "conditional orders cancelled");
        Ok(count)
    }
}

impl std::fmt::Debug for BybitExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitExchange")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Wire helpers
// -----------------------------------------------------------------------------

/// Position ids are `"<symbol>:<order_id>"` so that close-side operations can
/// recover the symbol without another lookup table.
pub fn make_position_id(symbol: &str, order_id: &str) -> String {
    format!("{symbol}:{order_id}")
}

fn symbol_of(position_id: &str) -> ExchangeResult<String> {
    position_id
        .split_once(':')
        .map(|(symbol, _)| symbol.to_string())
        .ok_or_else(|| {
            ExchangeError::invalid_argument(format!("malformed position id: {position_id}"))
        })
}

/// Bybit interval codes: minutes as numbers, days/weeks as letters.
pub(crate) fn interval_code(interval: &str) -> ExchangeResult<&'static str> {
    Ok(match interval {
        "1m" => "1",
        "3m" => "3",
        "5m" => "5",
        "15m" => "15",
        "30m" => "30",
        "1h" => "60",
        "2h" => "120",
        "4h" => "240",
        "6h" => "360",
        "12h" => "720",
        "1d" => "D",
        "1w" => "W",
        other => {
            return Err(ExchangeError::invalid_argument(format!(
                "unsupported interval: {other}"
            )))
        }
    })
}

/// Number of decimal places in a tick/step size like "0.001".
fn decimals_of(step: f64) -> u32 {
    if step <= 0.0 || step >= 1.0 {
        return 0;
    }
    let mut decimals = 0;
    let mut value = step;
    while value < 0.999_999 && decimals < 12 {
        value *= 10.0;
        decimals += 1;
    }
    decimals
}

/// Bybit sends numeric values as JSON strings.
fn parse_str_f64(value: &serde_json::Value, name: &str) -> ExchangeResult<f64> {
    match value {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| ExchangeError::network(format!("failed to parse {name} as f64: {s}"))),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExchangeError::network(format!("field {name} is not a valid f64"))),
        _ => Err(ExchangeError::network(format!(
            "field {name} has unexpected JSON type"
        ))),
    }
}

fn parse_str_i64(value: &serde_json::Value, name: &str) -> ExchangeResult<i64> {
    match value {
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| ExchangeError::network(format!("failed to parse {name} as i64: {s}"))),
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| ExchangeError::network(format!("field {name} is not a valid i64"))),
        _ => Err(ExchangeError::network(format!(
            "field {name} has unexpected JSON type"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn client() -> BybitExchange {
        BybitExchange::new(
            "test-key",
            "test-secret",
            true,
            10,
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let exchange = client();
        let a = exchange.sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT");
        let b = exchange.sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        // Different payloads must not collide.
        let c = exchange.sign(1_700_000_000_000, "category=linear&symbol=ETHUSDT");
        assert_ne!(a, c);
    }

    #[test]
    fn interval_codes_map() {
        assert_eq!(interval_code("1h").unwrap(), "60");
        assert_eq!(interval_code("1d").unwrap(), "D");
        assert_eq!(interval_code("15m").unwrap(), "15");
        assert!(interval_code("7m").is_err());
    }

    #[test]
    fn decimals_from_steps() {
        assert_eq!(decimals_of(0.001), 3);
        assert_eq!(decimals_of(0.1), 1);
        assert_eq!(decimals_of(1.0), 0);
        assert_eq!(decimals_of(10.0), 0);
    }

    #[test]
    fn position_id_roundtrip() {
        let id = make_position_id("BTCUSDT", "abc-123");
        assert_eq!(id, "BTCUSDT:abc-123");
        assert_eq!(symbol_of(&id).unwrap(), "BTCUSDT");
        assert!(symbol_of("no-separator").is_err());
    }

    #[test]
    fn ret_code_mapping() {
        assert_eq!(
            BybitExchange::map_ret_code(10006, "rate".into()).code(),
            "RATE_LIMIT"
        );
        assert_eq!(
            BybitExchange::map_ret_code(10003, "key".into()).code(),
            "AUTHENTICATION"
        );
        assert_eq!(
            BybitExchange::map_ret_code(110007, "funds".into()).code(),
            "INSUFFICIENT_FUNDS"
        );
        assert_eq!(
            BybitExchange::map_ret_code(10001, "param".into()).code(),
            "INVALID_ARGUMENT"
        );
        assert_eq!(
            BybitExchange::map_ret_code(99999, "other".into()).code(),
            "UNKNOWN"
        );
    }

    #[test]
    fn debug_redacts_credentials() {
        let out = format!("{:?}", client());
        assert!(out.contains("<redacted>"));
        assert!(!out.contains("test-secret"));
    }
}
