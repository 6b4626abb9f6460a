// =============================================================================
// Binance USD-M Futures REST Client — HMAC-SHA256 signed query strings
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests put
// the API key in X-MBX-APIKEY and append timestamp, recvWindow, and signature
// to the query string.
//
// Binance cannot attach SL/TP to a market order in one call, so
// `open_position` normalizes through /fapi/v1/batchOrders: entry + stop +
// first TP submitted as one batch.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
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

/// Conditional order types on the futures book.
const CONDITIONAL_TYPES: &[&str] = &["STOP_MARKET", "TAKE_PROFIT_MARKET", "TRAILING_STOP_MARKET"];

pub struct BinanceExchange {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    clock: SharedClock,
    connected: AtomicBool,
}

impl BinanceExchange {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        testnet: bool,
        request_timeout_seconds: u64,
        clock: SharedClock,
    ) -> Self {
        let api_key = api_key.into();
        let base_url = if testnet {
            "https://testnet.binancefuture.com".to_string()
        } else {
            "https://fapi.binance.com".to_string()
        };

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(request_timeout_seconds))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "BinanceExchange initialised");

        Self {
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

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Append timestamp, recvWindow, and signature to a query string.
    fn signed_query(&self, params: &str) -> String {
        let ts = self.clock.now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let signature = self.sign(&base);
        format!("{base}&signature={signature}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
        signed: bool,
    ) -> ExchangeResult<serde_json::Value> {
        let query = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };

        let response = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(map_transport_error)?;

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

        // Binance encodes business errors as {code, msg} with non-2xx status.
        if !status.is_success() {
            if let Some(code) = body["code"].as_i64() {
                let msg = body["msg"].as_str().unwrap_or("").to_string();
                return Err(Self::map_error_code(code, msg, retry_after_ms));
            }
            if let Some(err) = map_http_status(status, retry_after_ms, &body.to_string()) {
                return Err(err);
            }
        }

        Ok(body)
    }

    fn map_error_code(code: i64, message: String, retry_after_ms: Option<u64>) -> ExchangeError {
        match code {
            -1003 | -1015 => ExchangeError::RateLimit {
                retry_after_ms: retry_after_ms.unwrap_or(60_000),
                message,
            },
            -2014 | -2015 | -1022 => ExchangeError::Authentication { message },
            -2018 | -2019 => ExchangeError::InsufficientFunds { message },
            -1013 | -1111 | -1121 | -4003 => ExchangeError::InvalidArgument { message },
            -2011 | -2013 => ExchangeError::not_found(message),
            _ => ExchangeError::unknown(code.to_string(), message),
        }
    }

    /// Signed position lookup: (size, side) for reduce-only closes.
    async fn position_info(&self, symbol: &str) -> ExchangeResult<(f64, Side)> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v2/positionRisk",
                &format!("symbol={symbol}"),
                true,
            )
            .await?;

        let entry = body
            .as_array()
            .and_then(|list| list.first())
            .ok_or_else(|| ExchangeError::not_found(format!("no position for {symbol}")))?;

        let amount = parse_str_f64(&entry["positionAmt"], "positionAmt")?;
        if amount == 0.0 {
            return Err(ExchangeError::not_found(format!(
                "position for {symbol} is flat"
            )));
        }
        let side = if amount > 0.0 { Side::Long } else { Side::Short };
        Ok((amount.abs(), side))
    }

    /// Cancel one order; `true` on success. Used by the best-effort sweeps.
    async fn cancel_order(&self, symbol: &str, order_id: u64) -> bool {
        let result = self
            .request(
                reqwest::Method::DELETE,
                "/fapi/v1/order",
                &format!("symbol={symbol}&orderId={order_id}"),
                true,
            )
            .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(symbol, order_id, error = %e, "order cancel failed — continuing");
                false
            }
        }
    }

    async fn open_orders(&self, symbol: &str) -> ExchangeResult<Vec<serde_json::Value>> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/openOrders",
                &format!("symbol={symbol}"),
                true,
            )
            .await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }
}

#[async_trait]
impl Exchange for BinanceExchange {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn connect(&self) -> ExchangeResult<()> {
        self.health_check().await?;
        self.connected.store(true, Ordering::SeqCst);
        info!(base_url = %self.base_url, "binance connected");
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("binance disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), name = "binance::health_check")]
    async fn health_check(&self) -> ExchangeResult<()> {
        let server_time = self.get_server_time().await?;
        check_clock_drift(self.clock.now_ms(), server_time)
    }

    #[instrument(skip(self), name = "binance::get_candles")]
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
                false,
            )
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::network("klines response is not an array"))?;

        let mut candles = Vec::with_capacity(rows.len());
        for entry in rows {
            let row = entry
                .as_array()
                .ok_or_else(|| ExchangeError::network("kline entry is not an array"))?;
            if row.len() < 6 {
                warn!(len = row.len(), "skipping malformed kline row");
                continue;
            }
            candles.push(Candle::new(
                row[0].as_i64().unwrap_or(0),
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

    #[instrument(skip(self), name = "binance::get_latest_price")]
    async fn get_latest_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/ticker/price",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        parse_str_f64(&body["price"], "ticker.price")
    }

    async fn get_server_time(&self) -> ExchangeResult<i64> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/time", "", false)
            .await?;
        body["serverTime"]
            .as_i64()
            .ok_or_else(|| ExchangeError::network("time response missing serverTime"))
    }

    #[instrument(skip(self), name = "binance::get_symbol_precision")]
    async fn get_symbol_precision(&self, symbol: &str) -> ExchangeResult<SymbolPrecision> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/exchangeInfo",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;

        let info = body["symbols"]
            .as_array()
            .and_then(|list| list.first())
            .ok_or_else(|| ExchangeError::not_found(format!("symbol {symbol} not listed")))?;

        let min_order_qty = info["filters"]
            .as_array()
            .and_then(|filters| {
                filters
                    .iter()
                    .find(|f| f["filterType"].as_str() == Some("LOT_SIZE"))
            })
            .and_then(|f| f["minQty"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(SymbolPrecision {
            price_precision: info["pricePrecision"].as_u64().unwrap_or(2) as u32,
            quantity_precision: info["quantityPrecision"].as_u64().unwrap_or(3) as u32,
            min_order_qty,
        })
    }

    #[instrument(skip(self), name = "binance::get_funding_rate")]
    async fn get_funding_rate(&self, symbol: &str) -> ExchangeResult<f64> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/premiumIndex",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        parse_str_f64(&body["lastFundingRate"], "lastFundingRate")
    }

    #[instrument(skip(self), name = "binance::get_balance")]
    async fn get_balance(&self) -> ExchangeResult<AccountBalance> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/account", "", true)
            .await?;

        Ok(AccountBalance {
            wallet: parse_str_f64(&body["totalWalletBalance"], "totalWalletBalance")?,
            available: parse_str_f64(&body["availableBalance"], "availableBalance")?,
            margin_used: parse_str_f64(&body["totalInitialMargin"], "totalInitialMargin")
                .unwrap_or(0.0),
            unrealized_pnl: parse_str_f64(&body["totalUnrealizedProfit"], "totalUnrealizedProfit")
                .unwrap_or(0.0),
        })
    }

    #[instrument(skip(self), name = "binance::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.request(
            reqwest::Method::POST,
            "/fapi/v1/leverage",
            &format!("symbol={symbol}&leverage={leverage}"),
            true,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, request), name = "binance::open_position")]
    async fn open_position(&self, request: &OpenPositionRequest) -> ExchangeResult<String> {
        let (entry_side, exit_side) = match request.side {
            Side::Long => ("BUY", "SELL"),
            Side::Short => ("SELL", "BUY"),
        };

        // One batch: market entry + protective stop + optional first TP. The
        // batch round-trips as a unit, which is as atomic as this venue gets.
        let mut batch = vec![
            serde_json::json!({
                "symbol": request.symbol,
                "side": entry_side,
                "type": "MARKET",
                "quantity": request.quantity.to_string(),
            }),
            serde_json::json!({
                "symbol": request.symbol,
                "side": exit_side,
                "type": "STOP_MARKET",
                "stopPrice": request.stop_loss.to_string(),
                "closePosition": "true",
            }),
        ];
        if let Some(tp) = request.first_take_profit {
            batch.push(serde_json::json!({
                "symbol": request.symbol,
                "side": exit_side,
                "type": "TAKE_PROFIT_MARKET",
                "stopPrice": tp.to_string(),
                "closePosition": "false",
                "quantity": request.quantity.to_string(),
                "reduceOnly": "true",
            }));
        }

        let encoded = serde_json::to_string(&batch)
            .map_err(|e| ExchangeError::invalid_argument(format!("batch encoding failed: {e}")))?;
        let params = format!("batchOrders={}", urlencode(&encoded));

        let body = self
            .request(reqwest::Method::POST, "/fapi/v1/batchOrders", &params, true)
            .await?;

        let responses = body
            .as_array()
            .ok_or_else(|| ExchangeError::network("batchOrders response is not an array"))?;

        // Entry order failure is fatal; a failed protective leg surfaces too —
        // an unprotected position must never go unnoticed.
        let entry = responses
            .first()
            .ok_or_else(|| ExchangeError::network("batchOrders response empty"))?;
        if let Some(code) = entry["code"].as_i64() {
            return Err(Self::map_error_code(
                code,
                entry["msg"].as_str().unwrap_or("").to_string(),
                None,
            ));
        }
        let order_id = entry["orderId"]
            .as_u64()
            .ok_or_else(|| ExchangeError::network("entry order missing orderId"))?
            .to_string();

        for leg in &responses[1..] {
            if let Some(code) = leg["code"].as_i64() {
                return Err(Self::map_error_code(
                    code,
                    format!(
                        "protective leg rejected: {}",
                        leg["msg"].as_str().unwrap_or("")
                    ),
                    None,
                ));
            }
        }

        info!(
            symbol = %request.symbol,
            side = %request.side,
            qty = request.quantity,
            stop_loss = request.stop_loss,
            order_id = %order_id,
            "position opened with protective batch"
        );
        Ok(order_id)
    }

    #[instrument(skip(self, update), name = "binance::update_take_profit_partial")]
    async fn update_take_profit_partial(&self, update: &TakeProfitUpdate) -> ExchangeResult<()> {
        let (_, side) = self.position_info(&update.symbol).await?;
        let exit_side = match side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };

        self.request(
            reqwest::Method::POST,
            "/fapi/v1/order",
            &format!(
                "symbol={}&side={exit_side}&type=TAKE_PROFIT_MARKET&stopPrice={}&quantity={}&reduceOnly=true",
                update.symbol, update.price, update.size
            ),
            true,
        )
        .await?;

        debug!(symbol = %update.symbol, index = update.index, price = update.price, "TP leg set");
        Ok(())
    }

    #[instrument(skip(self), name = "binance::close_position")]
    async fn close_position(&self, position_id: &str, percentage: f64) -> ExchangeResult<()> {
        let symbol = symbol_of(position_id)?;
        let (size, side) = self.position_info(&symbol).await?;
        let close_qty = size * percentage.clamp(0.0, 100.0) / 100.0;

        if close_qty <= 0.0 {
            return Err(ExchangeError::invalid_argument("close quantity is zero"));
        }

        let close_side = match side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };
        self.request(
            reqwest::Method::POST,
            "/fapi/v1/order",
            &format!(
                "symbol={symbol}&side={close_side}&type=MARKET&quantity={close_qty}&reduceOnly=true"
            ),
            true,
        )
        .await?;

        info!(symbol = %symbol, percentage, qty = close_qty, "position close submitted");
        Ok(())
    }

    #[instrument(skip(self), name = "binance::update_stop_loss")]
    async fn update_stop_loss(&self, position_id: &str, new_price: f64) -> ExchangeResult<()> {
        let symbol = symbol_of(position_id)?;
        let (_, side) = self.position_info(&symbol).await?;
        let exit_side = match side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };

        // Sweep stale stops first so two stops never race each other.
        let orders = self.open_orders(&symbol).await.unwrap_or_default();
        for order in orders
            .iter()
            .filter(|o| o["type"].as_str() == Some("STOP_MARKET"))
        {
            if let Some(order_id) = order["orderId"].as_u64() {
                self.cancel_order(&symbol, order_id).await;
            }
        }

        self.request(
            reqwest::Method::POST,
            "/fapi/v1/order",
            &format!(
                "symbol={symbol}&side={exit_side}&type=STOP_MARKET&stopPrice={new_price}&closePosition=true"
            ),
            true,
        )
        .await?;

        info!(symbol = %symbol, new_price, "stop-loss updated");
        Ok(())
    }

    #[instrument(skip(self), name = "binance::activate_trailing")]
    async fn activate_trailing(
        &self,
        position_id: &str,
        trailing_percent: f64,
    ) -> ExchangeResult<()> {
        let symbol = symbol_of(position_id)?;
        let (size, side) = self.position_info(&symbol).await?;
        let exit_side = match side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };

        self.request(
            reqwest::Method::POST,
            "/fapi/v1/order",
            &format!(
                "symbol={symbol}&side={exit_side}&type=TRAILING_STOP_MARKET&quantity={size}&callbackRate={trailing_percent}&reduceOnly=true"
            ),
            true,
        )
        .await?;

        info!(symbol = %symbol, trailing_percent, "trailing stop activated");
        Ok(())
    }

    #[instrument(skip(self), name = "binance::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        let orders = self.open_orders(symbol).await?;
        let mut cancelled = 0;
        for order in &orders {
            if let Some(order_id) = order["orderId"].as_u64() {
                if self.cancel_order(symbol, order_id).await {
                    cancelled += 1;
                }
            }
        }
        info!(symbol, cancelled, total = orders.len(), "orders cancelled");
        Ok(cancelled)
    }

    #[instrument(skip(self), name = "binance::cancel_all_conditional_orders")]
    async fn cancel_all_conditional_orders(&self) -> ExchangeResult<u32> {
        // Without a symbol filter Binance returns every open futures order.
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/openOrders", "", true)
            .await?;
        let orders = body.as_array().cloned().unwrap_or_default();

        let mut cancelled = 0;
        for order in &orders {
            let order_type = order["type"].as_str().unwrap_or("");
            if !CONDITIONAL_TYPES.contains(&order_type) {
                continue;
            }
            let (Some(symbol), Some(order_id)) =
                (order["symbol"].as_str(), order["orderId"].as_u64())
            else {
                continue;
            };
            if self.cancel_order(symbol, order_id).await {
                cancelled += 1;
            }
        }

        info!(cancelled, "conditional orders cancelled");
        Ok(cancelled)
    }
}

impl std::fmt::Debug for BinanceExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceExchange")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Wire helpers
// -----------------------------------------------------------------------------

fn symbol_of(position_id: &str) -> ExchangeResult<String> {
    position_id
        .split_once(':')
        .map(|(symbol, _)| symbol.to_string())
        .ok_or_else(|| {
            ExchangeError::invalid_argument(format!("malformed position id: {position_id}"))
        })
}

/// Minimal percent-encoding for the batchOrders JSON payload.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 3);
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

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
