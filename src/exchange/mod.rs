// =============================================================================
// Exchange Capability — one contract, interchangeable backends
// =============================================================================
//
// The engine talks to exactly one polymorphic contract covering market data,
// positions, orders, and account state. Bybit and Binance implement it with
// their own wire formats; a paper implementation backs demo mode and tests.
//
// Normalized semantics all backends honour:
//   - `open_position` sets the initial stop-loss and (when given) the first
//     take-profit leg atomically with the entry order.
//   - Cancel operations are per-leg best-effort and return the count of
//     successful cancellations.
//   - `health_check` fails when the server clock drifts more than an hour
//     from ours.
// =============================================================================

pub mod binance;
pub mod bybit;
pub mod paper;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{Candle, Side};

/// Maximum tolerated |local - server| clock drift.
pub const MAX_CLOCK_DRIFT_MS: i64 = 3_600_000;

/// Tick-size information for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolPrecision {
    /// Decimal places on price.
    pub price_precision: u32,
    /// Decimal places on quantity.
    pub quantity_precision: u32,
    pub min_order_qty: f64,
}

impl SymbolPrecision {
    /// Round a price down to the symbol's tick.
    pub fn round_price(&self, price: f64) -> f64 {
        round_to_decimals(price, self.price_precision)
    }

    /// Round a quantity down to the symbol's step.
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        round_to_decimals(quantity, self.quantity_precision)
    }
}

fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).floor() / factor
}

/// Account balance snapshot in quote currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub wallet: f64,
    pub available: f64,
    pub margin_used: f64,
    pub unrealized_pnl: f64,
}

/// Request to open a protected position.
#[derive(Debug, Clone, Serialize)]
pub struct OpenPositionRequest {
    pub symbol: String,
    pub side: Side,
    /// Base-asset quantity.
    pub quantity: f64,
    pub leverage: u32,
    pub stop_loss: f64,
    pub first_take_profit: Option<f64>,
}

/// One additional TP leg (index >= 1; leg 0 rides on the open order).
#[derive(Debug, Clone, Serialize)]
pub struct TakeProfitUpdate {
    pub symbol: String,
    pub price: f64,
    /// Base-asset size of this leg.
    pub size: f64,
    pub index: usize,
}

/// The polymorphic exchange contract.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> ExchangeResult<()>;
    async fn disconnect(&self) -> ExchangeResult<()>;
    fn is_connected(&self) -> bool;

    /// Verify the server is reachable and our clocks agree.
    async fn health_check(&self) -> ExchangeResult<()>;

    // ── Market data ─────────────────────────────────────────────────────
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;
    async fn get_latest_price(&self, symbol: &str) -> ExchangeResult<f64>;
    async fn get_server_time(&self) -> ExchangeResult<i64>;
    async fn get_symbol_precision(&self, symbol: &str) -> ExchangeResult<SymbolPrecision>;
    async fn get_funding_rate(&self, symbol: &str) -> ExchangeResult<f64>;

    // ── Account ─────────────────────────────────────────────────────────
    async fn get_balance(&self) -> ExchangeResult<AccountBalance>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    // ── Orders / positions ──────────────────────────────────────────────
    /// Open a position with its initial SL (and first TP when provided) set
    /// atomically with the entry order. Returns the exchange order id.
    async fn open_position(&self, request: &OpenPositionRequest) -> ExchangeResult<String>;

    async fn update_take_profit_partial(&self, update: &TakeProfitUpdate) -> ExchangeResult<()>;

    /// Close `percentage` (default 100) of the position.
    async fn close_position(&self, position_id: &str, percentage: f64) -> ExchangeResult<()>;

    async fn update_stop_loss(&self, position_id: &str, new_price: f64) -> ExchangeResult<()>;

    async fn activate_trailing(
        &self,
        position_id: &str,
        trailing_percent: f64,
    ) -> ExchangeResult<()>;

    /// Best-effort: returns the number of orders successfully cancelled.
    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<u32>;

    /// Best-effort: returns the number of conditional orders cancelled.
    async fn cancel_all_conditional_orders(&self) -> ExchangeResult<u32>;
}

/// Shared health-check arithmetic: server time vs local time.
pub(crate) fn check_clock_drift(local_ms: i64, server_ms: i64) -> ExchangeResult<()> {
    let drift = (local_ms - server_ms).abs();
    if drift > MAX_CLOCK_DRIFT_MS {
        return Err(ExchangeError::StaleData {
            message: format!("server clock drift {drift} ms exceeds {MAX_CLOCK_DRIFT_MS} ms"),
        });
    }
    Ok(())
}

/// Map an HTTP transport failure onto the taxonomy.
pub(crate) fn map_transport_error(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        ExchangeError::network(format!("request timed out: {err}"))
    } else if err.is_connect() {
        ExchangeError::network(format!("connection failed: {err}"))
    } else {
        ExchangeError::network(err.to_string())
    }
}

/// Map an HTTP status (with optional Retry-After) onto the taxonomy.
pub(crate) fn map_http_status(
    status: reqwest::StatusCode,
    retry_after_ms: Option<u64>,
    body: &str,
) -> Option<ExchangeError> {
    if status.is_success() {
        return None;
    }
    Some(match status.as_u16() {
        429 => ExchangeError::RateLimit {
            retry_after_ms: retry_after_ms.unwrap_or(1_000),
            message: format!("HTTP 429: {body}"),
        },
        401 | 403 => ExchangeError::Authentication {
            message: format!("HTTP {status}: {body}"),
        },
        404 => ExchangeError::not_found(format!("HTTP 404: {body}")),
        400 => ExchangeError::invalid_argument(format!("HTTP 400: {body}")),
        _ => ExchangeError::unknown(status.as_str(), body),
    })
}
