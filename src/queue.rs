// =============================================================================
// Action Queue — prioritized, serialized command bus
// =============================================================================
//
// Every mutating operation against the exchange goes through here: the queue
// is drained by a single worker, so no two mutations ever overlap. HIGH
// strictly precedes NORMAL; FIFO within a priority; each action is handled
// at most once.
//
// Shutdown: `begin_shutdown` rejects further enqueues; `drain_high` hands the
// remaining HIGH actions to the shutdown path and drops the rest.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analyzers::Signal;
use crate::clock::SharedClock;

/// Default queue capacity per priority.
pub const DEFAULT_CAPACITY: usize = 64;

/// Dispatch priority. HIGH drains before NORMAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActionPriority {
    High,
    Normal,
}

/// The command payloads orchestrators may emit.
#[derive(Debug, Clone, Serialize)]
pub enum ActionKind {
    OpenPosition {
        signal: Signal,
        position_size: f64,
        leverage: u32,
    },
    ClosePercent {
        position_id: String,
        percentage: f64,
        reason: String,
    },
    UpdateStopLoss {
        position_id: String,
        new_price: f64,
        breakeven: bool,
    },
    ActivateTrailing {
        position_id: String,
        trailing_percent: f64,
    },
}

/// Routing key for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActionType {
    OpenPosition,
    ClosePercent,
    UpdateStopLoss,
    ActivateTrailing,
}

impl ActionKind {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::OpenPosition { .. } => ActionType::OpenPosition,
            Self::ClosePercent { .. } => ActionType::ClosePercent,
            Self::UpdateStopLoss { .. } => ActionType::UpdateStopLoss,
            Self::ActivateTrailing { .. } => ActionType::ActivateTrailing,
        }
    }
}

/// A queued command with its identity and enqueue timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub id: String,
    pub kind: ActionKind,
    pub priority: ActionPriority,
    pub timestamp: i64,
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is shutting down")]
    ShuttingDown,
}

/// Handler outcome collected per processed action.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub action_id: String,
    pub action_type: ActionType,
    pub outcome: Result<String, String>,
}

/// One registered handler for an action type.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, action: &Action) -> anyhow::Result<String>;
}

/// Handler table, routing by action type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action_type: ActionType, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type, handler);
    }

    fn get(&self, action_type: ActionType) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(&action_type)
    }

    /// Route one action to its registered handler.
    pub async fn dispatch(&self, action: &Action) -> Result<String, String> {
        match self.get(action.kind.action_type()) {
            Some(handler) => match handler.handle(action).await {
                Ok(summary) => Ok(summary),
                Err(e) => {
                    warn!(
                        id = %action.id,
                        action_type = ?action.kind.action_type(),
                        error = %e,
                        "action handler failed"
                    );
                    Err(e.to_string())
                }
            },
            None => {
                warn!(action_type = ?action.kind.action_type(), "no handler registered");
                Err("no handler registered".to_string())
            }
        }
    }
}

struct Lanes {
    high: VecDeque<Action>,
    normal: VecDeque<Action>,
    shutting_down: bool,
}

/// The serialized command bus.
pub struct ActionQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
    clock: SharedClock,
    capacity: usize,
}

impl ActionQueue {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_capacity(clock, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(clock: SharedClock, capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            clock,
            capacity,
        }
    }

    /// Enqueue a command; assigns its id and timestamp. Returns the id.
    pub fn enqueue(
        &self,
        kind: ActionKind,
        priority: ActionPriority,
    ) -> Result<String, EnqueueError> {
        let action = Action {
            id: Uuid::new_v4().to_string(),
            kind,
            priority,
            timestamp: self.clock.now_ms(),
        };

        let mut lanes = self.lanes.lock();
        if lanes.shutting_down {
            return Err(EnqueueError::ShuttingDown);
        }
        let lane = match priority {
            ActionPriority::High => &mut lanes.high,
            ActionPriority::Normal => &mut lanes.normal,
        };
        if lane.len() >= self.capacity {
            warn!(priority = ?priority, capacity = self.capacity, "action queue full");
            return Err(EnqueueError::Full);
        }

        debug!(
            id = %action.id,
            action_type = ?action.kind.action_type(),
            priority = ?priority,
            "action enqueued"
        );
        let id = action.id.clone();
        lane.push_back(action);
        self.notify.notify_one();
        Ok(id)
    }

    /// Remove the next action: HIGH first, FIFO within a priority.
    pub fn pop(&self) -> Option<Action> {
        let mut lanes = self.lanes.lock();
        lanes.high.pop_front().or_else(|| lanes.normal.pop_front())
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.high.len() + lanes.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until work is available. Returns `false` when the queue is empty
    /// and shutting down — the worker's signal to exit.
    pub async fn wait_for_work(&self) -> bool {
        loop {
            if !self.is_empty() {
                return true;
            }
            if self.is_shutting_down() {
                return false;
            }
            self.notify.notified().await;
        }
    }

    /// Drain everything currently queued through `handlers`, serially, and
    /// collect the results. An action whose type has no handler fails with an
    /// error result; it is never retried.
    pub async fn process(&self, handlers: &HandlerRegistry) -> Vec<ActionResult> {
        let mut results = Vec::new();

        while let Some(action) = self.pop() {
            let action_type = action.kind.action_type();
            let outcome = handlers.dispatch(&action).await;
            results.push(ActionResult {
                action_id: action.id,
                action_type,
                outcome,
            });
        }

        results
    }

    /// Stop accepting new actions.
    pub fn begin_shutdown(&self) {
        let mut lanes = self.lanes.lock();
        if !lanes.shutting_down {
            lanes.shutting_down = true;
            info!(
                pending_high = lanes.high.len(),
                pending_normal = lanes.normal.len(),
                "action queue shutting down"
            );
        }
        // Wake the worker so it can observe the shutdown.
        self.notify.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lanes.lock().shutting_down
    }

    /// Remove and return the pending HIGH actions, dropping the NORMAL lane.
    /// Used by the shutdown path after `begin_shutdown`.
    pub fn drain_high(&self) -> Vec<Action> {
        let mut lanes = self.lanes.lock();
        let dropped = lanes.normal.len();
        if dropped > 0 {
            warn!(dropped, "dropping pending NORMAL actions at shutdown");
        }
        lanes.normal.clear();
        lanes.high.drain(..).collect()
    }
}

impl std::fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lanes = self.lanes.lock();
        f.debug_struct("ActionQueue")
            .field("high", &lanes.high.len())
            .field("normal", &lanes.normal.len())
            .field("shutting_down", &lanes.shutting_down)
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
    use crate::types::Direction;
    use parking_lot::Mutex as PMutex;

    fn queue() -> ActionQueue {
        ActionQueue::new(Arc::new(ManualClock::new(1_000)))
    }

    fn close_kind(tag: &str) -> ActionKind {
        ActionKind::ClosePercent {
            position_id: tag.to_string(),
            percentage: 100.0,
            reason: "test".to_string(),
        }
    }

    struct RecordingHandler {
        seen: Arc<PMutex<Vec<String>>>,
    }

    #[async_trait]
    impl ActionHandler for RecordingHandler {
        async fn handle(&self, action: &Action) -> anyhow::Result<String> {
            if let ActionKind::ClosePercent { position_id, .. } = &action.kind {
                self.seen.lock().push(position_id.clone());
            }
            Ok("ok".to_string())
        }
    }

    #[test]
    fn high_precedes_normal_fifo_within_priority() {
        let queue = queue();
        queue.enqueue(close_kind("n1"), ActionPriority::Normal).unwrap();
        queue.enqueue(close_kind("h1"), ActionPriority::High).unwrap();
        queue.enqueue(close_kind("n2"), ActionPriority::Normal).unwrap();
        queue.enqueue(close_kind("h2"), ActionPriority::High).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|a| match a.kind {
                ActionKind::ClosePercent { position_id, .. } => position_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec!["h1", "h2", "n1", "n2"]);
    }

    #[test]
    fn enqueue_assigns_id_and_timestamp() {
        let queue = queue();
        let id = queue.enqueue(close_kind("x"), ActionPriority::Normal).unwrap();
        let action = queue.pop().unwrap();
        assert_eq!(action.id, id);
        assert_eq!(action.timestamp, 1_000);
    }

    #[test]
    fn capacity_is_enforced_per_lane() {
        let queue = ActionQueue::with_capacity(Arc::new(ManualClock::new(0)), 2);
        queue.enqueue(close_kind("a"), ActionPriority::Normal).unwrap();
        queue.enqueue(close_kind("b"), ActionPriority::Normal).unwrap();
        assert_eq!(
            queue.enqueue(close_kind("c"), ActionPriority::Normal),
            Err(EnqueueError::Full)
        );
        // The HIGH lane still has room.
        assert!(queue.enqueue(close_kind("d"), ActionPriority::High).is_ok());
    }

    #[test]
    fn shutdown_rejects_enqueues_and_drains_high() {
        let queue = queue();
        queue.enqueue(close_kind("h1"), ActionPriority::High).unwrap();
        queue.enqueue(close_kind("n1"), ActionPriority::Normal).unwrap();

        queue.begin_shutdown();
        assert_eq!(
            queue.enqueue(close_kind("late"), ActionPriority::High),
            Err(EnqueueError::ShuttingDown)
        );

        let high = queue.drain_high();
        assert_eq!(high.len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn process_dispatches_in_order_and_collects_results() {
        let queue = queue();
        let seen = Arc::new(PMutex::new(Vec::new()));
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            ActionType::ClosePercent,
            Arc::new(RecordingHandler { seen: seen.clone() }),
        );

        queue.enqueue(close_kind("n1"), ActionPriority::Normal).unwrap();
        queue.enqueue(close_kind("h1"), ActionPriority::High).unwrap();
        queue
            .enqueue(
                ActionKind::UpdateStopLoss {
                    position_id: "p".to_string(),
                    new_price: 100.0,
                    breakeven: true,
                },
                ActionPriority::Normal,
            )
            .unwrap();

        let results = queue.process(&handlers).await;
        assert_eq!(results.len(), 3);
        assert_eq!(*seen.lock(), vec!["h1", "n1"]);

        // The unhandled type failed but did not stop the drain.
        let unhandled = results
            .iter()
            .find(|r| r.action_type == ActionType::UpdateStopLoss)
            .unwrap();
        assert!(unhandled.outcome.is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn each_action_is_handled_at_most_once() {
        let queue = queue();
        let seen = Arc::new(PMutex::new(Vec::new()));
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            ActionType::ClosePercent,
            Arc::new(RecordingHandler { seen: seen.clone() }),
        );

        queue.enqueue(close_kind("once"), ActionPriority::Normal).unwrap();
        queue.process(&handlers).await;
        queue.process(&handlers).await;
        assert_eq!(seen.lock().len(), 1);
    }
}
