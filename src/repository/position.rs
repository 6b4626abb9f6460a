// =============================================================================
// Position Repository — the single open position and a bounded history
// =============================================================================
//
// At most one position is OPEN at a time. Closed positions move into a
// bounded history ring (oldest dropped past 100). All mutation goes through
// the action-queue handlers; analyzers and orchestrators only read.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::Side;

/// Maximum number of archived positions retained.
pub const MAX_HISTORY: usize = 100;

/// Whether the position is live on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Progress through the ladder-TP exit machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitState {
    Open,
    Tp1Hit,
    Tp2Hit,
    Tp3Hit,
    Closed,
}

impl ExitState {
    /// Monotone rank; transitions only ever increase it.
    pub fn rank(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Tp1Hit => 1,
            Self::Tp2Hit => 2,
            Self::Tp3Hit => 3,
            Self::Closed => 4,
        }
    }
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Tp1Hit => write!(f, "TP1_HIT"),
            Self::Tp2Hit => write!(f, "TP2_HIT"),
            Self::Tp3Hit => write!(f, "TP3_HIT"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Stop-loss bookkeeping for a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossState {
    pub price: f64,
    /// The stop as originally placed, before breakeven/trailing moves.
    pub initial: f64,
    pub is_breakeven: bool,
    pub is_trailing: bool,
}

impl StopLossState {
    pub fn new(price: f64) -> Self {
        Self {
            price,
            initial: price,
            is_breakeven: false,
            is_trailing: false,
        }
    }
}

/// One ladder take-profit leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLeg {
    pub level: u8,
    pub size_percent: f64,
    pub price: f64,
    pub hit: bool,
    pub order_id: Option<String>,
}

/// A tracked futures position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Exchange order id of the opening order.
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub margin_used: f64,
    pub stop_loss: StopLossState,
    pub take_profits: Vec<TakeProfitLeg>,
    /// Milliseconds since the UNIX epoch.
    pub opened_at: i64,
    pub status: PositionStatus,
    pub exit_state: ExitState,
    #[serde(default)]
    pub unrealized_pnl: f64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Recompute unrealized PnL from a mark price.
    pub fn mark_to(&mut self, price: f64) {
        self.unrealized_pnl = self.side.sign() * (price - self.entry_price) * self.quantity;
    }
}

struct Inner {
    current: Option<Position>,
    history: VecDeque<Position>,
    /// Ids already run through close invalidation, for idempotence.
    invalidated: VecDeque<String>,
}

/// Thread-safe owner of the current position and its history.
pub struct PositionRepository {
    inner: RwLock<Inner>,
}

impl PositionRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                current: None,
                history: VecDeque::new(),
                invalidated: VecDeque::new(),
            }),
        }
    }

    /// Install the open position. Returns `false` (and leaves state untouched)
    /// when one is already open.
    pub fn set_current(&self, position: Position) -> bool {
        let mut inner = self.inner.write();
        if inner.current.is_some() {
            debug!(id = %position.id, "rejecting second open position");
            return false;
        }
        info!(id = %position.id, symbol = %position.symbol, side = %position.side, "position tracked");
        inner.current = Some(position);
        true
    }

    /// Snapshot of the current position.
    pub fn current(&self) -> Option<Position> {
        self.inner.read().current.clone()
    }

    pub fn has_open(&self) -> bool {
        self.inner.read().current.is_some()
    }

    /// Apply a mutation to the current position, if any. Returns the updated
    /// snapshot.
    pub fn update_current<F>(&self, f: F) -> Option<Position>
    where
        F: FnOnce(&mut Position),
    {
        let mut inner = self.inner.write();
        if let Some(pos) = inner.current.as_mut() {
            f(pos);
            return Some(pos.clone());
        }
        None
    }

    /// Remove and return the current position without archiving it.
    pub fn take_current(&self) -> Option<Position> {
        self.inner.write().current.take()
    }

    /// Move the current position (marked closed) into the history ring.
    pub fn archive_current(&self) -> Option<Position> {
        let mut inner = self.inner.write();
        let mut position = inner.current.take()?;
        position.status = PositionStatus::Closed;
        position.exit_state = ExitState::Closed;
        position.unrealized_pnl = 0.0;

        inner.history.push_back(position.clone());
        while inner.history.len() > MAX_HISTORY {
            inner.history.pop_front();
        }
        Some(position)
    }

    /// Most recent `count` archived positions, newest first.
    pub fn history(&self, count: usize) -> Vec<Position> {
        let inner = self.inner.read();
        inner.history.iter().rev().take(count).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.inner.read().history.len()
    }

    /// Record that close-side caches for `position_id` were invalidated.
    /// The second call for the same id is a no-op.
    ///
    /// Returns `true` when this call performed the invalidation.
    pub fn invalidate_closed(&self, position_id: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.invalidated.iter().any(|id| id == position_id) {
            debug!(id = %position_id, "close invalidation already performed — no-op");
            return false;
        }
        inner.invalidated.push_back(position_id.to_string());
        while inner.invalidated.len() > MAX_HISTORY {
            inner.invalidated.pop_front();
        }
        true
    }
}

impl Default for PositionRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PositionRepository")
            .field("open", &inner.current.is_some())
            .field("history", &inner.history.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_position(id: &str, side: Side) -> Position {
        Position {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            quantity: 0.5,
            entry_price: 100.0,
            leverage: 3,
            margin_used: 16.7,
            stop_loss: StopLossState::new(98.0),
            take_profits: vec![
                TakeProfitLeg {
                    level: 1,
                    size_percent: 60.0,
                    price: 101.0,
                    hit: false,
                    order_id: None,
                },
                TakeProfitLeg {
                    level: 2,
                    size_percent: 30.0,
                    price: 102.0,
                    hit: false,
                    order_id: None,
                },
                TakeProfitLeg {
                    level: 3,
                    size_percent: 10.0,
                    price: 103.0,
                    hit: false,
                    order_id: None,
                },
            ],
            opened_at: 0,
            status: PositionStatus::Open,
            exit_state: ExitState::Open,
            unrealized_pnl: 0.0,
        }
    }

    #[test]
    fn at_most_one_open_position() {
        let repo = PositionRepository::new();
        assert!(repo.set_current(sample_position("a", Side::Long)));
        assert!(!repo.set_current(sample_position("b", Side::Short)));
        assert_eq!(repo.current().unwrap().id, "a");
    }

    #[test]
    fn archive_moves_to_history_and_caps() {
        let repo = PositionRepository::new();
        for i in 0..(MAX_HISTORY + 20) {
            repo.set_current(sample_position(&format!("p{i}"), Side::Long));
            let archived = repo.archive_current().unwrap();
            assert_eq!(archived.status, PositionStatus::Closed);
            assert_eq!(archived.exit_state, ExitState::Closed);
        }
        assert_eq!(repo.history_len(), MAX_HISTORY);
        // Newest first.
        let recent = repo.history(1);
        assert_eq!(recent[0].id, format!("p{}", MAX_HISTORY + 19));
        assert!(!repo.has_open());
    }

    #[test]
    fn update_current_mutates_in_place() {
        let repo = PositionRepository::new();
        repo.set_current(sample_position("a", Side::Long));
        let updated = repo
            .update_current(|p| {
                p.stop_loss.price = p.entry_price;
                p.stop_loss.is_breakeven = true;
            })
            .unwrap();
        assert!(updated.stop_loss.is_breakeven);
        assert_eq!(repo.current().unwrap().stop_loss.price, 100.0);
    }

    #[test]
    fn invalidation_is_idempotent() {
        let repo = PositionRepository::new();
        assert!(repo.invalidate_closed("p1"));
        assert!(!repo.invalidate_closed("p1"));
        assert!(repo.invalidate_closed("p2"));
    }

    #[test]
    fn mark_to_updates_unrealized_pnl() {
        let mut long = sample_position("a", Side::Long);
        long.mark_to(102.0);
        assert!((long.unrealized_pnl - 1.0).abs() < 1e-9);

        let mut short = sample_position("b", Side::Short);
        short.mark_to(102.0);
        assert!((short.unrealized_pnl + 1.0).abs() < 1e-9);
    }

    #[test]
    fn exit_state_ranks_are_monotone() {
        assert!(ExitState::Open.rank() < ExitState::Tp1Hit.rank());
        assert!(ExitState::Tp1Hit.rank() < ExitState::Tp2Hit.rank());
        assert!(ExitState::Tp2Hit.rank() < ExitState::Tp3Hit.rank());
        assert!(ExitState::Tp3Hit.rank() < ExitState::Closed.rank());
    }
}
