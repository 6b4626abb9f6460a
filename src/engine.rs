// =============================================================================
// Engine — event loop, action worker, graceful shutdown
// =============================================================================
//
// All state mutation funnels through one logical worker: stream tasks push
// EngineEvents into an mpsc channel, the event loop dispatches them to the
// orchestrator in arrival order, and the action worker drains the queue
// serially.
//
// Shutdown order: drain pending HIGH actions, reject further enqueues, cancel
// orders (count-reporting, per-leg best-effort), optionally flatten, tear
// down the exchange session, flush the session record — all inside the
// configured time budget.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::GracefulShutdownConfig;
use crate::exchange::stream::ExecutionEvent;
use crate::exchange::Exchange;
use crate::lifecycle::PositionLifecycle;
use crate::notify::{NotificationEvent, Notifier};
use crate::orchestrator::TradingOrchestrator;
use crate::queue::{ActionQueue, HandlerRegistry};
use crate::repository::PositionRepository;
use crate::session::SessionTracker;
use crate::types::{Candle, OrderBook, TimeframeRole};

/// Everything the worker loop can receive.
#[derive(Debug)]
pub enum EngineEvent {
    CandleClosed { role: TimeframeRole, candle: Candle },
    OrderbookUpdate { book: OrderBook },
    Execution { event: ExecutionEvent },
    Shutdown,
}

/// Consume events until a Shutdown arrives or every sender is gone.
pub async fn run_event_loop(
    orchestrator: Arc<TradingOrchestrator>,
    mut rx: mpsc::Receiver<EngineEvent>,
) {
    info!("event loop started");
    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::CandleClosed { role, candle } => {
                orchestrator.on_candle_closed(role, candle).await;
            }
            EngineEvent::OrderbookUpdate { book } => {
                orchestrator.on_orderbook_update(book);
            }
            EngineEvent::Execution { event } => {
                orchestrator.on_execution(event).await;
            }
            EngineEvent::Shutdown => {
                info!("event loop received shutdown");
                break;
            }
        }
    }
    info!("event loop stopped");
}

/// Drain the action queue serially until shutdown empties it.
pub async fn run_action_worker(queue: Arc<ActionQueue>, handlers: Arc<HandlerRegistry>) {
    info!("action worker started");
    while queue.wait_for_work().await {
        let results = queue.process(&handlers).await;
        for result in &results {
            match &result.outcome {
                Ok(summary) => {
                    info!(
                        action_id = %result.action_id,
                        action_type = ?result.action_type,
                        summary = %summary,
                        "action completed"
                    );
                }
                Err(e) => {
                    error!(
                        action_id = %result.action_id,
                        action_type = ?result.action_type,
                        error = %e,
                        "action failed"
                    );
                }
            }
        }
    }
    info!("action worker stopped");
}

/// Best-effort sweep of both cancellation groups; returns how many of the two
/// calls succeeded (0, 1, or 2).
pub async fn cancel_all_pending_orders(exchange: &Arc<dyn Exchange>, symbol: &str) -> u32 {
    let mut successes = 0;

    match exchange.cancel_all_orders(symbol).await {
        Ok(count) => {
            info!(symbol, count, "open orders cancelled at shutdown");
            successes += 1;
        }
        Err(e) => warn!(symbol, error = %e, "cancel_all_orders failed at shutdown"),
    }

    match exchange.cancel_all_conditional_orders().await {
        Ok(count) => {
            info!(count, "conditional orders cancelled at shutdown");
            successes += 1;
        }
        Err(e) => warn!(error = %e, "cancel_all_conditional_orders failed at shutdown"),
    }

    successes
}

/// Drives the shutdown sequence exactly once; repeat invocations return the
/// first run's result.
pub struct ShutdownCoordinator {
    queue: Arc<ActionQueue>,
    handlers: Arc<HandlerRegistry>,
    exchange: Arc<dyn Exchange>,
    lifecycle: Arc<PositionLifecycle>,
    positions: Arc<PositionRepository>,
    session: Arc<SessionTracker>,
    notifier: Arc<dyn Notifier>,
    config: GracefulShutdownConfig,
    symbol: String,
    completed: Mutex<Option<u32>>,
}

impl ShutdownCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<ActionQueue>,
        handlers: Arc<HandlerRegistry>,
        exchange: Arc<dyn Exchange>,
        lifecycle: Arc<PositionLifecycle>,
        positions: Arc<PositionRepository>,
        session: Arc<SessionTracker>,
        notifier: Arc<dyn Notifier>,
        config: GracefulShutdownConfig,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            handlers,
            exchange,
            lifecycle,
            positions,
            session,
            notifier,
            config,
            symbol: symbol.into(),
            completed: Mutex::new(None),
        }
    }

    /// Run the shutdown under its time budget. Returns the number of
    /// successful cancellation groups (see [`cancel_all_pending_orders`]).
    pub async fn execute(&self, reason: &str) -> u32 {
        if let Some(previous) = *self.completed.lock() {
            info!(reason, "shutdown already performed — idempotent return");
            return previous;
        }

        info!(
            reason,
            timeout_seconds = self.config.shutdown_timeout_seconds,
            "graceful shutdown starting"
        );

        let budget = std::time::Duration::from_secs(self.config.shutdown_timeout_seconds);
        let cancelled = match tokio::time::timeout(budget, self.run_sequence()).await {
            Ok(count) => count,
            Err(_) => {
                error!(
                    timeout_seconds = self.config.shutdown_timeout_seconds,
                    "shutdown exceeded its budget — forcing exit"
                );
                0
            }
        };

        self.session.flush();
        self.notifier.notify(&NotificationEvent::EngineStopped {
            reason: reason.to_string(),
        });

        *self.completed.lock() = Some(cancelled);
        info!(cancelled_groups = cancelled, "graceful shutdown complete");
        cancelled
    }

    async fn run_sequence(&self) -> u32 {
        // 1. Drain pending HIGH actions, then the queue rejects everything.
        self.queue.begin_shutdown();
        let high = self.queue.drain_high();
        if !high.is_empty() {
            info!(count = high.len(), "processing pending HIGH actions");
            for action in high {
                if let Err(e) = self.handlers.dispatch(&action).await {
                    warn!(action_id = %action.id, error = %e, "HIGH action failed at shutdown");
                }
            }
        }

        // 2. Order cancellation (count-reporting, per-leg best-effort).
        let mut cancelled = 0;
        if self.config.cancel_orders_on_shutdown {
            cancelled = cancel_all_pending_orders(&self.exchange, &self.symbol).await;
        }

        // 3. Optionally flatten the book.
        if self.config.close_positions_on_shutdown {
            if let Some(position) = self.positions.current() {
                info!(id = %position.id, "closing position at shutdown");
                if let Err(e) = self
                    .lifecycle
                    .close_percent(&position.id, 100.0, "shutdown")
                    .await
                {
                    error!(error = %e, "position close at shutdown failed");
                }
            }
        }

        // 4. Tear down the exchange session.
        if let Err(e) = self.exchange.disconnect().await {
            warn!(error = %e, "exchange disconnect failed");
        }

        cancelled
    }

}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("symbol", &self.symbol)
            .field("completed", &self.completed.lock().is_some())
            .finish()
    }
}
