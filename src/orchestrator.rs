// =============================================================================
// Trading Orchestrator — candle-close dispatcher over the whole pipeline
// =============================================================================
//
// PRIMARY close: analyzers -> filters -> entry decision -> snapshot + pending
// decision (and, with a position open, the exit machine -> action queue).
//
// ENTRY close: validate the frozen snapshot against the live HTF bias, check
// the entry candle itself (no dojis, direction-aligned), then enqueue the
// OPEN_POSITION action.
//
// Execution events: TP fills advance the ladder bookkeeping; stop-loss and
// trailing fills finalize the position.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::analyzers::AnalyzerRegistry;
use crate::clock::SharedClock;
use crate::data::{CandleProvider, TimeframeProvider};
use crate::entry::{EntryDecision, EntryOrchestrator};
use crate::error::{run_with_recovery, LogHooks, RecoveryStrategy};
use crate::exchange::stream::{ExecutionClassifier, ExecutionEvent, ExecutionKind};
use crate::exchange::Exchange;
use crate::exit::ExitOrchestrator;
use crate::filters::{FilterChain, FilterContext};
use crate::gate::SnapshotGate;
use crate::indicators::PreCalculator;
use crate::lifecycle::PositionLifecycle;
use crate::queue::{ActionKind, ActionPriority, ActionQueue};
use crate::repository::{ExitState, MarketDataRepository, PositionRepository};
use crate::trend::{analyze_trend, TrendAnalysis};
use crate::types::{Candle, Direction, OrderBook, TimeframeRole};

/// Entry candle body must be at least this share of the recent mean body.
const MIN_BODY_RATIO: f64 = 0.30;
/// Window for the mean-body computation on the entry timeframe.
const BODY_WINDOW: usize = 20;

/// An ENTER decision awaiting confirmation on the entry timeframe.
#[derive(Debug, Clone)]
struct PendingDecision {
    snapshot_id: String,
    position_size: f64,
    leverage: u32,
}

/// The thin dispatcher that wires market events to the pipeline.
pub struct TradingOrchestrator {
    provider: Arc<CandleProvider>,
    precalc: Arc<PreCalculator>,
    registry: AnalyzerRegistry,
    filters: FilterChain,
    entry: EntryOrchestrator,
    exit: ExitOrchestrator,
    gate: Arc<SnapshotGate>,
    positions: Arc<PositionRepository>,
    repository: Arc<MarketDataRepository>,
    queue: Arc<ActionQueue>,
    lifecycle: Arc<PositionLifecycle>,
    exchange: Arc<dyn Exchange>,
    timeframes: TimeframeProvider,
    classifier: Mutex<ExecutionClassifier>,
    pending: Mutex<Option<PendingDecision>>,
    symbol: String,
    leverage: u32,
    #[allow(dead_code)]
    clock: SharedClock,
}

impl TradingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<CandleProvider>,
        precalc: Arc<PreCalculator>,
        registry: AnalyzerRegistry,
        filters: FilterChain,
        entry: EntryOrchestrator,
        exit: ExitOrchestrator,
        gate: Arc<SnapshotGate>,
        positions: Arc<PositionRepository>,
        repository: Arc<MarketDataRepository>,
        queue: Arc<ActionQueue>,
        lifecycle: Arc<PositionLifecycle>,
        exchange: Arc<dyn Exchange>,
        timeframes: TimeframeProvider,
        symbol: impl Into<String>,
        leverage: u32,
        clock: SharedClock,
    ) -> Self {
        let symbol = symbol.into();
        Self {
            provider,
            precalc,
            registry,
            filters,
            entry,
            exit,
            gate,
            positions,
            repository,
            queue,
            lifecycle,
            exchange,
            timeframes,
            classifier: Mutex::new(ExecutionClassifier::new(symbol.clone())),
            pending: Mutex::new(None),
            symbol,
            leverage,
            clock,
        }
    }

    // -------------------------------------------------------------------------
    // Candle-close dispatch
    // -------------------------------------------------------------------------

    pub async fn on_candle_closed(&self, role: TimeframeRole, candle: Candle) {
        self.provider.on_candle_closed(role, candle.clone());
        self.precalc.on_candle_closed(role, candle.timestamp);

        match role {
            TimeframeRole::Primary => self.on_primary_closed(candle).await,
            TimeframeRole::Entry => self.on_entry_closed(candle).await,
            _ => {}
        }
    }

    /// PRIMARY close: entry analysis (unless busy) and exit evaluation.
    async fn on_primary_closed(&self, candle: Candle) {
        if self.positions.has_open() {
            debug!("position open — skipping entry analysis");
        } else {
            self.run_entry_analysis(&candle).await;
        }

        self.run_exit_evaluation(candle.close).await;
    }

    async fn run_entry_analysis(&self, candle: &Candle) {
        let primary_candles = self.provider.get_candles(TimeframeRole::Primary, None).await;
        if primary_candles.is_empty() {
            warn!("no primary candles — skipping analysis");
            return;
        }

        let signals = self.registry.collect_signals(&primary_candles);
        if signals.is_empty() {
            debug!("no directional signals this close");
            return;
        }

        let trend = self.current_trend().await;

        // Funding is a refinement; a failed fetch degrades to None.
        let funding = run_with_recovery(
            || self.exchange.get_funding_rate(&self.symbol),
            &RecoveryStrategy::Degrade,
            &LogHooks,
        )
        .await
        .value;

        let ctx = FilterContext {
            signals: &signals,
            trend: &trend,
            funding_rate: funding,
            primary_candles: &primary_candles,
            btc_bias: None,
        };
        if let Some(veto) = self.filters.apply(&ctx) {
            debug!(filter = veto.filter, reason = %veto.reason, "entry vetoed");
            return;
        }

        let balance = run_with_recovery(
            || self.exchange.get_balance(),
            &RecoveryStrategy::Degrade,
            &LogHooks,
        )
        .await
        .value;
        let Some(balance) = balance else {
            warn!("balance unavailable — skipping entry");
            return;
        };

        let decision = self
            .entry
            .evaluate(&signals, balance.available, &[], &trend);

        if let EntryDecision::Enter {
            signal,
            position_size,
            ..
        } = decision
        {
            let snapshot =
                self.gate
                    .create_snapshot(trend.bias, trend.clone(), signal, candle.clone());
            *self.pending.lock() = Some(PendingDecision {
                snapshot_id: snapshot.id.clone(),
                position_size,
                leverage: self.leverage,
            });
            info!(
                snapshot_id = %snapshot.id,
                position_size = format!("{position_size:.2}"),
                "ENTER decision frozen — awaiting entry-timeframe confirmation"
            );
        }
    }

    async fn run_exit_evaluation(&self, current_price: f64) {
        let Some(position) = self.positions.current() else {
            return;
        };

        self.positions.update_current(|p| p.mark_to(current_price));

        let evaluation = self.exit.evaluate(&position, current_price);
        if let Some((from, to)) = evaluation.state_transition {
            info!(from = %from, to = %to, "exit state transition");
            if to == ExitState::Closed && evaluation.actions.is_empty() {
                // The venue already closed it; finalize bookkeeping.
                if let Err(e) = self
                    .lifecycle
                    .on_reported_closed(current_price, "reported closed")
                    .await
                {
                    warn!(error = %e, "reported-close finalization failed");
                }
                return;
            }
        }

        for (kind, priority) in evaluation.actions {
            if let Err(e) = self.queue.enqueue(kind, priority) {
                warn!(error = %e, "exit action rejected by queue");
            }
        }
    }

    /// ENTRY close: validate the frozen decision, inspect the candle, enqueue.
    async fn on_entry_closed(&self, candle: Candle) {
        let Some(pending) = self.pending.lock().clone() else {
            return;
        };

        let current_bias = self.current_trend().await.bias;
        let validation = self.gate.validate(current_bias);
        if !validation.valid {
            warn!(
                snapshot_id = %pending.snapshot_id,
                expired = validation.expired,
                bias_mismatch = validation.bias_mismatch,
                reason = %validation.reason,
                "pending decision dropped"
            );
            *self.pending.lock() = None;
            self.gate.clear_active_snapshot();
            return;
        }

        let Some(snapshot) = self.gate.get_active() else {
            *self.pending.lock() = None;
            return;
        };

        // Entry-candle quality: body large enough, direction aligned.
        let entry_candles = self.provider.get_candles(TimeframeRole::Entry, Some(BODY_WINDOW)).await;
        if !entry_candle_confirms(&candle, &entry_candles, snapshot.signal.direction) {
            info!(
                snapshot_id = %pending.snapshot_id,
                "entry candle does not confirm — decision dropped"
            );
            *self.pending.lock() = None;
            self.gate.clear_active_snapshot();
            return;
        }

        // Consume the snapshot and submit the open.
        let Some(snapshot) = self.gate.take_active() else {
            *self.pending.lock() = None;
            return;
        };
        *self.pending.lock() = None;

        match self.queue.enqueue(
            ActionKind::OpenPosition {
                signal: snapshot.signal,
                position_size: pending.position_size,
                leverage: pending.leverage,
            },
            ActionPriority::Normal,
        ) {
            Ok(action_id) => {
                info!(action_id = %action_id, snapshot_id = %snapshot.id, "OPEN_POSITION enqueued");
            }
            Err(e) => warn!(error = %e, "OPEN_POSITION rejected by queue"),
        }
    }

    // -------------------------------------------------------------------------
    // Orderbook / executions
    // -------------------------------------------------------------------------

    /// Store the latest snapshot; no synchronous heavy work here.
    pub fn on_orderbook_update(&self, book: OrderBook) {
        self.repository.save_orderbook(book);
    }

    pub async fn on_execution(&self, event: ExecutionEvent) {
        let kind = self.classifier.lock().classify(&event);
        match kind {
            ExecutionKind::TakeProfit(level) => {
                debug!(level, price = event.exec_price, "TP fill confirmed by stream");
                // The venue filled this rung: advance the ladder so the exit
                // machine never re-closes it. A duplicate confirmation (the
                // engine's own reduce-only close also classifies as a TP
                // fill) leaves the state unchanged and enqueues nothing.
                let prior = self.positions.current().map(|p| p.exit_state);
                let updated = self.positions.update_current(|p| {
                    if let Some(leg) = p.take_profits.get_mut(level as usize - 1) {
                        leg.hit = true;
                    }
                    let hits = p.take_profits.iter().filter(|leg| leg.hit).count();
                    let by_hits = match hits {
                        0 => p.exit_state,
                        1 => ExitState::Tp1Hit,
                        2 => ExitState::Tp2Hit,
                        _ => ExitState::Tp3Hit,
                    };
                    if by_hits.rank() > p.exit_state.rank() {
                        p.exit_state = by_hits;
                    }
                });

                if let (Some(prior), Some(position)) = (prior, updated) {
                    if position.exit_state.rank() > prior.rank() {
                        let follow_up = match position.exit_state {
                            ExitState::Tp1Hit => Some(ActionKind::UpdateStopLoss {
                                position_id: position.id.clone(),
                                new_price: self.exit.breakeven_target(&position),
                                breakeven: true,
                            }),
                            ExitState::Tp2Hit => Some(ActionKind::ActivateTrailing {
                                position_id: position.id.clone(),
                                trailing_percent: self.exit.trailing_percent(),
                            }),
                            _ => None,
                        };
                        if let Some(kind) = follow_up {
                            if let Err(e) = self.queue.enqueue(kind, ActionPriority::High) {
                                warn!(error = %e, "TP follow-up rejected by queue");
                            }
                        }
                    }
                }
            }
            ExecutionKind::StopLoss => {
                info!(price = event.exec_price, "stop-loss fill — finalizing position");
                if let Err(e) = self
                    .lifecycle
                    .on_reported_closed(event.exec_price, "SL")
                    .await
                {
                    warn!(error = %e, "stop-loss finalization failed");
                }
            }
            ExecutionKind::TrailingStop => {
                info!(price = event.exec_price, "trailing-stop fill — finalizing position");
                if let Err(e) = self
                    .lifecycle
                    .on_reported_closed(event.exec_price, "TrailingStop")
                    .await
                {
                    warn!(error = %e, "trailing finalization failed");
                }
            }
            ExecutionKind::Entry => {
                debug!(order_id = %event.order_id, "entry fill observed");
            }
        }

        // Execution events also drive the exit machine between candle closes.
        if event.exec_price > 0.0 {
            self.run_exit_evaluation(event.exec_price).await;
        }
    }

    // -------------------------------------------------------------------------
    // Helpers / diagnostics
    // -------------------------------------------------------------------------

    /// The live HTF trend from HTF1 candles. The only source of HTF bias.
    async fn current_trend(&self) -> TrendAnalysis {
        let interval = self.timeframes.interval(TimeframeRole::Htf1).to_string();
        let candles = self.provider.get_candles(TimeframeRole::Htf1, None).await;
        analyze_trend(&candles, &interval)
    }

    pub fn has_pending_decision(&self) -> bool {
        self.pending.lock().is_some()
    }
}

impl std::fmt::Debug for TradingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingOrchestrator")
            .field("symbol", &self.symbol)
            .field("pending", &self.pending.lock().is_some())
            .field("snapshots", &self.gate.get_count())
            .finish()
    }
}

/// A valid entry candle has a body at least 30% of the recent mean body and
/// closes in the signal's direction.
fn entry_candle_confirms(candle: &Candle, recent: &[Candle], direction: Direction) -> bool {
    let bodies: Vec<f64> = recent.iter().map(Candle::body).collect();
    if !bodies.is_empty() {
        let mean_body = bodies.iter().sum::<f64>() / bodies.len() as f64;
        if mean_body > 0.0 && candle.body() < mean_body * MIN_BODY_RATIO {
            return false;
        }
    }

    match direction {
        Direction::Long => candle.is_bullish(),
        Direction::Short => !candle.is_bullish(),
        Direction::Hold => false,
    }
}
