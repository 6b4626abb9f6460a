// =============================================================================
// Paper Exchange — simulated order execution for demo mode and tests
// =============================================================================
//
// Mutating operations fill locally and never reach a venue. Market-data reads
// delegate to a wrapped real exchange when one is supplied (demo mode:
// real data, simulated orders); standalone instances serve seeded data and
// back the unit tests.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::{
    check_clock_drift, AccountBalance, Exchange, OpenPositionRequest, SymbolPrecision,
    TakeProfitUpdate,
};
use crate::types::{Candle, Side};

/// One simulated position.
#[derive(Debug, Clone)]
pub struct PaperPosition {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<(usize, f64, f64)>,
    pub trailing_percent: Option<f64>,
}

#[derive(Debug, Default)]
struct PaperState {
    position: Option<PaperPosition>,
    open_orders: u32,
    conditional_orders: u32,
    seeded_candles: Vec<Candle>,
    seeded_price: f64,
    seeded_funding_rate: f64,
}

/// The simulated venue.
pub struct PaperExchange {
    /// Market-data passthrough; `None` serves the seeded fixtures.
    inner: Option<Arc<dyn Exchange>>,
    state: Mutex<PaperState>,
    balance: Mutex<AccountBalance>,
    clock: SharedClock,
    connected: AtomicBool,
    next_order: AtomicU64,
    // Failure injection for cancellation tests.
    fail_cancel_orders: AtomicBool,
    fail_cancel_conditional: AtomicBool,
}

impl PaperExchange {
    /// Demo mode: real market data through `inner`, simulated fills.
    pub fn wrapping(inner: Arc<dyn Exchange>, clock: SharedClock, starting_balance: f64) -> Self {
        Self::build(Some(inner), clock, starting_balance)
    }

    /// Standalone simulation serving seeded market data.
    pub fn standalone(clock: SharedClock, starting_balance: f64) -> Self {
        Self::build(None, clock, starting_balance)
    }

    fn build(inner: Option<Arc<dyn Exchange>>, clock: SharedClock, starting_balance: f64) -> Self {
        Self {
            inner,
            state: Mutex::new(PaperState {
                seeded_price: 100.0,
                ..Default::default()
            }),
            balance: Mutex::new(AccountBalance {
                wallet: starting_balance,
                available: starting_balance,
                margin_used: 0.0,
                unrealized_pnl: 0.0,
            }),
            clock,
            connected: AtomicBool::new(false),
            next_order: AtomicU64::new(1),
            fail_cancel_orders: AtomicBool::new(false),
            fail_cancel_conditional: AtomicBool::new(false),
        }
    }

    // ── Test / simulation knobs ─────────────────────────────────────────

    pub fn seed_candles(&self, candles: Vec<Candle>) {
        self.state.lock().seeded_candles = candles;
    }

    pub fn seed_price(&self, price: f64) {
        self.state.lock().seeded_price = price;
    }

    pub fn seed_funding_rate(&self, rate: f64) {
        self.state.lock().seeded_funding_rate = rate;
    }

    pub fn seed_open_orders(&self, open: u32, conditional: u32) {
        let mut state = self.state.lock();
        state.open_orders = open;
        state.conditional_orders = conditional;
    }

    pub fn fail_cancel_orders(&self, fail: bool) {
        self.fail_cancel_orders.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cancel_conditional(&self, fail: bool) {
        self.fail_cancel_conditional.store(fail, Ordering::SeqCst);
    }

    pub fn position(&self) -> Option<PaperPosition> {
        self.state.lock().position.clone()
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn connect(&self) -> ExchangeResult<()> {
        if let Some(inner) = &self.inner {
            inner.connect().await?;
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("paper exchange connected (orders simulated)");
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        if let Some(inner) = &self.inner {
            inner.disconnect().await?;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> ExchangeResult<()> {
        let server_time = self.get_server_time().await?;
        check_clock_drift(self.clock.now_ms(), server_time)
    }

    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        if let Some(inner) = &self.inner {
            return inner.get_candles(symbol, interval, limit).await;
        }
        let candles = &self.state.lock().seeded_candles;
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn get_latest_price(&self, symbol: &str) -> ExchangeResult<f64> {
        if let Some(inner) = &self.inner {
            return inner.get_latest_price(symbol).await;
        }
        Ok(self.state.lock().seeded_price)
    }

    async fn get_server_time(&self) -> ExchangeResult<i64> {
        if let Some(inner) = &self.inner {
            return inner.get_server_time().await;
        }
        Ok(self.clock.now_ms())
    }

    async fn get_symbol_precision(&self, symbol: &str) -> ExchangeResult<SymbolPrecision> {
        if let Some(inner) = &self.inner {
            return inner.get_symbol_precision(symbol).await;
        }
        Ok(SymbolPrecision {
            price_precision: 2,
            quantity_precision: 3,
            min_order_qty: 0.001,
        })
    }

    async fn get_funding_rate(&self, symbol: &str) -> ExchangeResult<f64> {
        if let Some(inner) = &self.inner {
            return inner.get_funding_rate(symbol).await;
        }
        Ok(self.state.lock().seeded_funding_rate)
    }

    async fn get_balance(&self) -> ExchangeResult<AccountBalance> {
        Ok(*self.balance.lock())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        debug!(symbol, leverage, "paper: leverage set");
        Ok(())
    }

    async fn open_position(&self, request: &OpenPositionRequest) -> ExchangeResult<String> {
        let mut state = self.state.lock();
        if state.position.is_some() {
            return Err(ExchangeError::invalid_argument(
                "paper: a position is already open",
            ));
        }

        let order_id = format!("paper-{}", self.next_order.fetch_add(1, Ordering::SeqCst));
        let mut take_profits = Vec::new();
        if let Some(tp) = request.first_take_profit {
            take_profits.push((0, tp, request.quantity));
        }

        state.position = Some(PaperPosition {
            order_id: order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            stop_loss: request.stop_loss,
            take_profits,
            trailing_percent: None,
        });
        state.conditional_orders += 1 + u32::from(request.first_take_profit.is_some());

        info!(
            symbol = %request.symbol,
            side = %request.side,
            qty = request.quantity,
            order_id = %order_id,
            "paper: position filled"
        );
        Ok(order_id)
    }

    async fn update_take_profit_partial(&self, update: &TakeProfitUpdate) -> ExchangeResult<()> {
        let mut state = self.state.lock();
        let position = state
            .position
            .as_mut()
            .ok_or_else(|| ExchangeError::not_found("paper: no open position"))?;
        position
            .take_profits
            .push((update.index, update.price, update.size));
        state.conditional_orders += 1;
        Ok(())
    }

    async fn close_position(&self, position_id: &str, percentage: f64) -> ExchangeResult<()> {
        let mut state = self.state.lock();
        let position = state
            .position
            .as_mut()
            .ok_or_else(|| ExchangeError::not_found("paper: no open position"))?;

        if !position_id.contains(&position.order_id) {
            return Err(ExchangeError::not_found(format!(
                "paper: unknown position {position_id}"
            )));
        }

        if percentage >= 100.0 {
            state.position = None;
            state.conditional_orders = 0;
        } else {
            position.quantity *= 1.0 - percentage / 100.0;
        }
        info!(position_id, percentage, "paper: position close filled");
        Ok(())
    }

    async fn update_stop_loss(&self, position_id: &str, new_price: f64) -> ExchangeResult<()> {
        let mut state = self.state.lock();
        let position = state
            .position
            .as_mut()
            .ok_or_else(|| ExchangeError::not_found("paper: no open position"))?;
        if !position_id.contains(&position.order_id) {
            return Err(ExchangeError::not_found(format!(
                "paper: unknown position {position_id}"
            )));
        }
        position.stop_loss = new_price;
        Ok(())
    }

    async fn activate_trailing(
        &self,
        position_id: &str,
        trailing_percent: f64,
    ) -> ExchangeResult<()> {
        let mut state = self.state.lock();
        let position = state
            .position
            .as_mut()
            .ok_or_else(|| ExchangeError::not_found("paper: no open position"))?;
        if !position_id.contains(&position.order_id) {
            return Err(ExchangeError::not_found(format!(
                "paper: unknown position {position_id}"
            )));
        }
        position.trailing_percent = Some(trailing_percent);
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        if self.fail_cancel_orders.load(Ordering::SeqCst) {
            return Err(ExchangeError::network("paper: cancel injection"));
        }
        let mut state = self.state.lock();
        let count = state.open_orders;
        state.open_orders = 0;
        debug!(symbol, count, "paper: orders cancelled");
        Ok(count)
    }

    async fn cancel_all_conditional_orders(&self) -> ExchangeResult<u32> {
        if self.fail_cancel_conditional.load(Ordering::SeqCst) {
            return Err(ExchangeError::network("paper: conditional cancel injection"));
        }
        let mut state = self.state.lock();
        let count = state.conditional_orders;
        state.conditional_orders = 0;
        debug!(count, "paper: conditional orders cancelled");
        Ok(count)
    }
}

impl std::fmt::Debug for PaperExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperExchange")
            .field("wrapping", &self.inner.as_ref().map(|i| i.name()))
            .field("position", &self.state.lock().position.is_some())
            .finish()
    }
}
