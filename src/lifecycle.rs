// =============================================================================
// Position Lifecycle — opens protected positions, applies exits, journals
// =============================================================================
//
// The only code that mutates positions, and it runs exclusively as the action
// queue's handler, so no two mutations overlap.
//
// Open path: sweep dangling conditional orders (best-effort), re-anchor the
// stop to the live price preserving the signal's stop distance, open with SL
// and first TP atomically, lay the remaining TP legs (per-leg best-effort),
// then track + journal + notify.
//
// Close path: exchange first, then journal, then the position-closed sinks in
// declared order (no listener fan-out with undefined ordering).
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::analyzers::Signal;
use crate::clock::SharedClock;
use crate::config::TakeProfitSpec;
use crate::error::{run_with_recovery, LogHooks, RecoveryStrategy, RetryConfig};
use crate::exchange::bybit::make_position_id;
use crate::exchange::{Exchange, OpenPositionRequest, TakeProfitUpdate};
use crate::notify::{NotificationEvent, Notifier};
use crate::queue::{Action, ActionHandler, ActionKind};
use crate::repository::{
    JournalRepository, Position, PositionRepository, PositionStatus, StopLossState, TakeProfitLeg,
    TradeRecord,
};
use crate::session::SessionTracker;

/// Ordered observer of final position closes (no event-emitter fan-out; the
/// declared order here is the invocation order).
pub trait PositionClosedSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn on_position_closed(&self, position: &Position, realized_pnl: f64);
}

impl PositionClosedSink for SessionTracker {
    fn name(&self) -> &'static str {
        "session-stats"
    }

    fn on_position_closed(&self, _position: &Position, realized_pnl: f64) {
        self.on_trade_closed(realized_pnl);
    }
}

fn open_retry() -> RecoveryStrategy {
    RecoveryStrategy::Retry(RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 500,
        backoff_multiplier: 2.0,
        max_delay_ms: 10_000,
    })
}

fn protect_retry() -> RecoveryStrategy {
    RecoveryStrategy::Retry(RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 100,
        backoff_multiplier: 2.0,
        max_delay_ms: 10_000,
    })
}

/// Owns position open/close mechanics behind the action queue.
pub struct PositionLifecycle {
    exchange: Arc<dyn Exchange>,
    positions: Arc<PositionRepository>,
    journal: Arc<JournalRepository>,
    notifier: Arc<dyn Notifier>,
    closed_sinks: Vec<Arc<dyn PositionClosedSink>>,
    clock: SharedClock,
    symbol: String,
    tp_specs: Vec<TakeProfitSpec>,
}

impl PositionLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        positions: Arc<PositionRepository>,
        journal: Arc<JournalRepository>,
        notifier: Arc<dyn Notifier>,
        closed_sinks: Vec<Arc<dyn PositionClosedSink>>,
        clock: SharedClock,
        symbol: impl Into<String>,
        tp_specs: Vec<TakeProfitSpec>,
    ) -> Self {
        Self {
            exchange,
            positions,
            journal,
            notifier,
            closed_sinks,
            clock,
            symbol: symbol.into(),
            tp_specs,
        }
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open a protected position from an approved entry signal.
    pub async fn open_position(
        &self,
        signal: &Signal,
        position_size: f64,
        leverage: u32,
    ) -> anyhow::Result<Position> {
        if self.positions.has_open() {
            anyhow::bail!("a position is already open");
        }

        // ── 1. Sweep dangling conditional orders (best-effort) ───────────
        let swept = run_with_recovery(
            || self.exchange.cancel_all_conditional_orders(),
            &RecoveryStrategy::Skip,
            &LogHooks,
        )
        .await;
        if let Some(count) = swept.value {
            if count > 0 {
                debug!(count, "dangling conditional orders cancelled before open");
            }
        }

        // ── 2. Re-anchor the stop to the live price ──────────────────────
        let price_outcome = run_with_recovery(
            || self.exchange.get_latest_price(&self.symbol),
            &protect_retry(),
            &LogHooks,
        )
        .await;
        let Some(current_price) = price_outcome.value else {
            self.notify_failure(price_outcome.error.as_ref(), "price fetch before open");
            anyhow::bail!("could not fetch price before open");
        };

        let sl_distance = (signal.price - signal.stop_loss).abs();
        let actual_stop_loss = if signal.direction.as_side().map(|s| s.is_long()).unwrap_or(true) {
            current_price - sl_distance
        } else {
            current_price + sl_distance
        };
        let side = signal
            .direction
            .as_side()
            .ok_or_else(|| anyhow::anyhow!("cannot open a HOLD signal"))?;

        // ── 3. Size and round to the symbol's ticks ──────────────────────
        let precision = match self.exchange.get_symbol_precision(&self.symbol).await {
            Ok(precision) => precision,
            Err(e) => {
                warn!(error = %e, "precision lookup failed — using raw values");
                crate::exchange::SymbolPrecision {
                    price_precision: 8,
                    quantity_precision: 8,
                    min_order_qty: 0.0,
                }
            }
        };

        let quantity = precision.round_quantity(position_size / current_price);
        if quantity < precision.min_order_qty || quantity <= 0.0 {
            anyhow::bail!(
                "quantity {quantity} below minimum order size {}",
                precision.min_order_qty
            );
        }

        let first_take_profit = signal
            .take_profits
            .first()
            .map(|&tp| precision.round_price(tp));

        // Leverage mismatch is logged, never fatal.
        if let Err(e) = self.exchange.set_leverage(&self.symbol, leverage).await {
            warn!(error = %e, leverage, "set_leverage failed — continuing");
        }

        // ── 4. Atomic open with SL + first TP ────────────────────────────
        let request = OpenPositionRequest {
            symbol: self.symbol.clone(),
            side,
            quantity,
            leverage,
            stop_loss: precision.round_price(actual_stop_loss),
            first_take_profit,
        };

        let open_outcome =
            run_with_recovery(|| self.exchange.open_position(&request), &open_retry(), &LogHooks)
                .await;
        let Some(order_id) = open_outcome.value else {
            self.notify_failure(open_outcome.error.as_ref(), "position open");
            anyhow::bail!(
                "position open failed after {} attempts: {:?}",
                open_outcome.attempts,
                open_outcome.error
            );
        };
        let position_id = make_position_id(&self.symbol, &order_id);

        // ── 5. Additional TP legs — one missing level is acceptable ──────
        for (index, (&tp_price, spec)) in signal
            .take_profits
            .iter()
            .zip(self.tp_specs.iter())
            .enumerate()
            .skip(1)
        {
            let update = TakeProfitUpdate {
                symbol: self.symbol.clone(),
                price: precision.round_price(tp_price),
                size: precision.round_quantity(quantity * spec.size_percent / 100.0),
                index,
            };
            let leg = run_with_recovery(
                || self.exchange.update_take_profit_partial(&update),
                &RecoveryStrategy::Skip,
                &LogHooks,
            )
            .await;
            if leg.value.is_none() {
                warn!(index, price = tp_price, "TP leg not placed — continuing unreverted");
            }
        }

        // ── 6. Track, journal, notify ────────────────────────────────────
        let take_profits = signal
            .take_profits
            .iter()
            .zip(self.tp_specs.iter())
            .map(|(&tp_price, spec)| TakeProfitLeg {
                level: spec.level,
                size_percent: spec.size_percent,
                price: precision.round_price(tp_price),
                hit: false,
                order_id: None,
            })
            .collect();

        let position = Position {
            id: position_id.clone(),
            symbol: self.symbol.clone(),
            side,
            quantity,
            entry_price: current_price,
            leverage,
            margin_used: position_size / leverage.max(1) as f64,
            stop_loss: StopLossState::new(request.stop_loss),
            take_profits,
            opened_at: self.clock.now_ms(),
            status: PositionStatus::Open,
            exit_state: crate::repository::ExitState::Open,
            unrealized_pnl: 0.0,
        };

        if !self.positions.set_current(position.clone()) {
            // Should be unreachable given the guard above; surfaced loudly.
            error!(id = %position_id, "repository refused the opened position");
        }

        self.journal.record_trade(TradeRecord {
            id: position_id.clone(),
            symbol: self.symbol.clone(),
            side,
            entry_price: current_price,
            exit_price: None,
            quantity,
            entry_time: position.opened_at,
            exit_time: None,
            pnl: 0.0,
            strategy: Some(signal.signal_type.clone()),
            exit_reason: None,
        });

        self.notifier.notify(&NotificationEvent::PositionOpened {
            symbol: self.symbol.clone(),
            side,
            quantity,
            entry_price: current_price,
            stop_loss: request.stop_loss,
        });

        info!(
            id = %position_id,
            side = %side,
            quantity,
            entry = current_price,
            stop_loss = request.stop_loss,
            "position opened and tracked"
        );
        Ok(position)
    }

    // -------------------------------------------------------------------------
    // Close / protect
    // -------------------------------------------------------------------------

    /// Close `percentage` of the tracked position.
    pub async fn close_percent(
        &self,
        position_id: &str,
        percentage: f64,
        reason: &str,
    ) -> anyhow::Result<String> {
        let Some(position) = self.positions.current() else {
            anyhow::bail!("no open position to close");
        };
        if position.id != position_id {
            anyhow::bail!("close for unknown position {position_id}");
        }

        let close_outcome = run_with_recovery(
            || self.exchange.close_position(position_id, percentage),
            &protect_retry(),
            &LogHooks,
        )
        .await;
        if !close_outcome.is_ok() {
            self.notify_failure(close_outcome.error.as_ref(), "position close");
            anyhow::bail!(
                "position close failed after {} attempts: {:?}",
                close_outcome.attempts,
                close_outcome.error
            );
        }

        let exit_price = self
            .exchange
            .get_latest_price(&self.symbol)
            .await
            .unwrap_or(position.entry_price);

        if percentage >= 100.0 {
            self.finalize_close(exit_price, reason).await?;
            return Ok(format!("closed 100% ({reason})"));
        }

        // Partial close: realize the leg's PnL and mark the TP rung hit.
        let closed_qty = position.quantity * percentage / 100.0;
        let partial_pnl = position.side.sign() * (exit_price - position.entry_price) * closed_qty;

        self.positions.update_current(|p| {
            p.quantity -= closed_qty;
            if let Some(leg) = p.take_profits.iter_mut().find(|leg| !leg.hit) {
                leg.hit = true;
            }
            // Exit state follows the number of rungs hit.
            let hits = p.take_profits.iter().filter(|leg| leg.hit).count();
            p.exit_state = match hits {
                0 => p.exit_state,
                1 => crate::repository::ExitState::Tp1Hit,
                2 => crate::repository::ExitState::Tp2Hit,
                _ => crate::repository::ExitState::Tp3Hit,
            };
        });
        self.journal.update_trade(position_id, |t| {
            t.pnl += partial_pnl;
        });

        self.notifier
            .notify(&NotificationEvent::PositionPartiallyClosed {
                symbol: self.symbol.clone(),
                percentage,
                reason: reason.to_string(),
            });

        info!(
            id = %position_id,
            percentage,
            closed_qty,
            partial_pnl,
            reason,
            "partial close executed"
        );
        Ok(format!("closed {percentage}% ({reason})"))
    }

    /// Finalize a close already executed (or reported) on the exchange.
    pub async fn finalize_close(&self, exit_price: f64, reason: &str) -> anyhow::Result<Position> {
        let Some(position) = self.positions.archive_current() else {
            anyhow::bail!("no open position to finalize");
        };

        let final_leg_pnl =
            position.side.sign() * (exit_price - position.entry_price) * position.quantity;
        let now = self.clock.now_ms();
        let reason_owned = reason.to_string();
        self.journal.update_trade(&position.id, |t| {
            t.pnl += final_leg_pnl;
            t.exit_price = Some(exit_price);
            t.exit_time = Some(now);
            t.exit_reason = Some(reason_owned.clone());
        });

        let realized_pnl = self
            .journal
            .query(&crate::repository::TradeQuery::default())
            .iter()
            .find(|t| t.id == position.id)
            .map(|t| t.pnl)
            .unwrap_or(final_leg_pnl);

        // Close-side cache invalidation is idempotent.
        if !self.positions.invalidate_closed(&position.id) {
            debug!(id = %position.id, "close invalidation repeated — no-op");
        }

        // Named sinks in declared order.
        for sink in &self.closed_sinks {
            debug!(sink = sink.name(), id = %position.id, "position-closed sink");
            sink.on_position_closed(&position, realized_pnl);
        }

        self.notifier.notify(&NotificationEvent::PositionClosed {
            symbol: self.symbol.clone(),
            realized_pnl,
            reason: reason.to_string(),
        });

        info!(
            id = %position.id,
            exit_price,
            realized_pnl,
            reason,
            "position closed and archived"
        );
        Ok(position)
    }

    /// The exchange reported the position gone (stop-loss, trailing, manual).
    pub async fn on_reported_closed(&self, exit_price: f64, reason: &str) -> anyhow::Result<()> {
        if self.positions.current().is_none() {
            debug!(reason, "reported close with no tracked position — ignoring");
            return Ok(());
        }
        self.finalize_close(exit_price, reason).await?;
        Ok(())
    }

    /// Move the protective stop; `breakeven` marks the breakeven move.
    pub async fn update_stop_loss(
        &self,
        position_id: &str,
        new_price: f64,
        breakeven: bool,
    ) -> anyhow::Result<String> {
        let outcome = run_with_recovery(
            || self.exchange.update_stop_loss(position_id, new_price),
            &protect_retry(),
            &LogHooks,
        )
        .await;
        if !outcome.is_ok() {
            self.notify_failure(outcome.error.as_ref(), "stop-loss update");
            anyhow::bail!(
                "stop-loss update failed after {} attempts: {:?}",
                outcome.attempts,
                outcome.error
            );
        }

        self.positions.update_current(|p| {
            p.stop_loss.price = new_price;
            if breakeven {
                p.stop_loss.is_breakeven = true;
            }
        });

        self.notifier.notify(&NotificationEvent::StopLossMoved {
            symbol: self.symbol.clone(),
            new_price,
            breakeven,
        });
        Ok(format!("stop-loss moved to {new_price}"))
    }

    /// Switch the stop to trailing mode.
    pub async fn activate_trailing(
        &self,
        position_id: &str,
        trailing_percent: f64,
    ) -> anyhow::Result<String> {
        let outcome = run_with_recovery(
            || self.exchange.activate_trailing(position_id, trailing_percent),
            &protect_retry(),
            &LogHooks,
        )
        .await;
        if !outcome.is_ok() {
            self.notify_failure(outcome.error.as_ref(), "trailing activation");
            anyhow::bail!(
                "trailing activation failed after {} attempts: {:?}",
                outcome.attempts,
                outcome.error
            );
        }

        self.positions.update_current(|p| {
            p.stop_loss.is_trailing = true;
        });

        self.notifier.notify(&NotificationEvent::TrailingActivated {
            symbol: self.symbol.clone(),
            trailing_percent,
        });
        Ok(format!("trailing activated at {trailing_percent}%"))
    }

    fn notify_failure(&self, error: Option<&crate::error::ExchangeError>, context: &str) {
        let Some(error) = error else { return };
        self.notifier.notify(&NotificationEvent::Failure {
            code: error.code(),
            severity: error.severity(),
            message: format!("{context}: {error}"),
        });
    }
}

#[async_trait]
impl ActionHandler for PositionLifecycle {
    async fn handle(&self, action: &Action) -> anyhow::Result<String> {
        match &action.kind {
            ActionKind::OpenPosition {
                signal,
                position_size,
                leverage,
            } => {
                let position = self.open_position(signal, *position_size, *leverage).await?;
                Ok(format!("opened {} {}", position.side, position.id))
            }
            ActionKind::ClosePercent {
                position_id,
                percentage,
                reason,
            } => self.close_percent(position_id, *percentage, reason).await,
            ActionKind::UpdateStopLoss {
                position_id,
                new_price,
                breakeven,
            } => {
                self.update_stop_loss(position_id, *new_price, *breakeven)
                    .await
            }
            ActionKind::ActivateTrailing {
                position_id,
                trailing_percent,
            } => {
                self.activate_trailing(position_id, *trailing_percent)
                    .await
            }
        }
    }
}

impl std::fmt::Debug for PositionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionLifecycle")
            .field("symbol", &self.symbol)
            .field("sinks", &self.closed_sinks.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RiskManagementConfig;
    use crate::exchange::paper::PaperExchange;
    use crate::notify::tests::RecordingNotifier;
    use crate::types::Direction;
    use parking_lot::Mutex;

    struct OrderedSink {
        tag: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl PositionClosedSink for OrderedSink {
        fn name(&self) -> &'static str {
            self.tag
        }
        fn on_position_closed(&self, _position: &Position, _pnl: f64) {
            self.order.lock().push(self.tag);
        }
    }

    struct Fixture {
        paper: Arc<PaperExchange>,
        lifecycle: PositionLifecycle,
        positions: Arc<PositionRepository>,
        journal: Arc<JournalRepository>,
        notifier_events: Arc<Mutex<Vec<String>>>,
        sink_order: Arc<Mutex<Vec<&'static str>>>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let paper = Arc::new(PaperExchange::standalone(clock.clone(), 10_000.0));
        paper.seed_price(100.0);

        let positions = Arc::new(PositionRepository::new());
        let journal = Arc::new(JournalRepository::open(dir.path()));
        let notifier = Arc::new(RecordingNotifier::default());
        let notifier_events = notifier.events.clone();

        let sink_order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let sinks: Vec<Arc<dyn PositionClosedSink>> = vec![
            Arc::new(OrderedSink {
                tag: "risk-monitor",
                order: sink_order.clone(),
            }),
            Arc::new(OrderedSink {
                tag: "journal-stats",
                order: sink_order.clone(),
            }),
        ];

        let lifecycle = PositionLifecycle::new(
            paper.clone(),
            positions.clone(),
            journal.clone(),
            notifier,
            sinks,
            clock,
            "BTCUSDT",
            RiskManagementConfig::default().take_profits,
        );

        Fixture {
            paper,
            lifecycle,
            positions,
            journal,
            notifier_events,
            sink_order,
            _dir: dir,
        }
    }

    fn long_signal() -> Signal {
        let mut signal = Signal::raw(Direction::Long, 80.0, "test entry");
        signal.signal_type = "ema_trend".to_string();
        signal.price = 100.0;
        signal.stop_loss = 98.0;
        signal.take_profits = vec![101.0, 102.0, 103.0];
        signal
    }

    #[tokio::test]
    async fn open_creates_protected_tracked_position() {
        let f = fixture();
        let position = f.lifecycle.open_position(&long_signal(), 1_000.0, 3).await.unwrap();

        // Stop re-anchored to the live price with the signal's distance.
        assert!((position.stop_loss.price - 98.0).abs() < 1e-9);
        assert_eq!(position.take_profits.len(), 3);
        assert_eq!(position.take_profits[0].size_percent, 60.0);
        assert!((position.quantity - 10.0).abs() < 1e-9);

        // Exchange side: position holds SL and all three TP legs.
        let paper_position = f.paper.position().unwrap();
        assert_eq!(paper_position.take_profits.len(), 3);

        // Tracked + journaled + notified.
        assert!(f.positions.has_open());
        assert_eq!(f.journal.trade_count(), 1);
        assert!(f.notifier_events.lock().contains(&"opened".to_string()));
    }

    #[tokio::test]
    async fn open_reanchors_stop_to_moved_price() {
        let f = fixture();
        // Price moved from the signal's 100 to 104 before execution.
        f.paper.seed_price(104.0);
        let position = f.lifecycle.open_position(&long_signal(), 1_000.0, 3).await.unwrap();
        // Distance 2.0 preserved from the new anchor.
        assert!((position.stop_loss.price - 102.0).abs() < 1e-9);
        assert_eq!(position.entry_price, 104.0);
    }

    #[tokio::test]
    async fn partial_close_marks_leg_and_keeps_position() {
        let f = fixture();
        let position = f.lifecycle.open_position(&long_signal(), 1_000.0, 3).await.unwrap();

        f.paper.seed_price(101.1);
        f.lifecycle
            .close_percent(&position.id, 60.0, "TP1")
            .await
            .unwrap();

        let tracked = f.positions.current().unwrap();
        assert!((tracked.quantity - 4.0).abs() < 1e-9);
        assert!(tracked.take_profits[0].hit);
        assert!(!tracked.take_profits[1].hit);
        assert_eq!(tracked.exit_state, crate::repository::ExitState::Tp1Hit);

        // Journal accumulated the partial PnL: (101.1-100) * 6 = 6.6.
        let trade = &f.journal.all_trades()[0];
        assert!((trade.pnl - 6.6).abs() < 1e-9);
        assert!(trade.exit_time.is_none());
    }

    #[tokio::test]
    async fn breakeven_move_flags_stop() {
        let f = fixture();
        let position = f.lifecycle.open_position(&long_signal(), 1_000.0, 3).await.unwrap();

        f.lifecycle
            .update_stop_loss(&position.id, 100.0, true)
            .await
            .unwrap();

        let tracked = f.positions.current().unwrap();
        assert_eq!(tracked.stop_loss.price, 100.0);
        assert!(tracked.stop_loss.is_breakeven);
        assert!(!tracked.stop_loss.is_trailing);
    }

    #[tokio::test]
    async fn trailing_activation_flags_stop() {
        let f = fixture();
        let position = f.lifecycle.open_position(&long_signal(), 1_000.0, 3).await.unwrap();

        f.lifecycle
            .activate_trailing(&position.id, 0.5)
            .await
            .unwrap();

        assert!(f.positions.current().unwrap().stop_loss.is_trailing);
        assert_eq!(f.paper.position().unwrap().trailing_percent, Some(0.5));
    }

    #[tokio::test]
    async fn full_close_archives_and_runs_sinks_in_order() {
        let f = fixture();
        let position = f.lifecycle.open_position(&long_signal(), 1_000.0, 3).await.unwrap();

        f.paper.seed_price(103.0);
        f.lifecycle
            .close_percent(&position.id, 100.0, "TP3")
            .await
            .unwrap();

        assert!(!f.positions.has_open());
        assert_eq!(f.positions.history_len(), 1);
        assert_eq!(*f.sink_order.lock(), vec!["risk-monitor", "journal-stats"]);

        let trade = &f.journal.all_trades()[0];
        assert_eq!(trade.exit_price, Some(103.0));
        assert!(trade.exit_time.is_some());
        assert!((trade.pnl - 30.0).abs() < 1e-9);
        assert!(f.notifier_events.lock().contains(&"closed".to_string()));
    }

    #[tokio::test]
    async fn reported_close_finalizes_without_exchange_call() {
        let f = fixture();
        f.lifecycle.open_position(&long_signal(), 1_000.0, 3).await.unwrap();

        f.lifecycle.on_reported_closed(98.0, "SL").await.unwrap();
        assert!(!f.positions.has_open());

        let trade = &f.journal.all_trades()[0];
        assert_eq!(trade.exit_reason.as_deref(), Some("SL"));
        assert!((trade.pnl + 20.0).abs() < 1e-9);

        // A second report is a clean no-op.
        f.lifecycle.on_reported_closed(98.0, "SL").await.unwrap();
        assert_eq!(f.positions.history_len(), 1);
    }

    #[tokio::test]
    async fn open_failure_leaves_no_tracked_position() {
        let f = fixture();
        // Occupy the venue so the next open is rejected.
        f.lifecycle.open_position(&long_signal(), 1_000.0, 3).await.unwrap();
        f.positions.take_current();

        let err = f
            .lifecycle
            .open_position(&long_signal(), 1_000.0, 3)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("open failed"));
        assert!(!f.positions.has_open());
        assert!(f.notifier_events.lock().contains(&"failure".to_string()));
    }

    #[tokio::test]
    async fn handler_routes_action_kinds() {
        let f = fixture();
        let action = Action {
            id: "a1".to_string(),
            kind: ActionKind::OpenPosition {
                signal: long_signal(),
                position_size: 1_000.0,
                leverage: 3,
            },
            priority: crate::queue::ActionPriority::Normal,
            timestamp: 0,
        };
        let summary = f.lifecycle.handle(&action).await.unwrap();
        assert!(summary.contains("opened LONG"));
        assert!(f.positions.has_open());
    }
}
