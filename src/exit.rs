// =============================================================================
// Exit Orchestrator — the ladder-TP position exit state machine
// =============================================================================
//
//   OPEN -> TP1_HIT -> TP2_HIT -> TP3_HIT -> CLOSED
//
// TP1: partial close + stop to breakeven.
// TP2: partial close + trailing stop activation.
// TP3: close the remainder.
// Any state collapses to CLOSED when the exchange reports the position gone
// (stop-loss hit, manual close); CLOSED emits nothing.
//
// The orchestrator is pure: it never mutates the position and returns
// identical output for identical input. Handlers apply the emitted actions
// through the queue, one transition per tick.
// =============================================================================

use tracing::{debug, info};

use crate::queue::{ActionKind, ActionPriority};
use crate::repository::{ExitState, Position, PositionStatus, TakeProfitLeg};

/// One tick's verdict: the transition (if any) and the actions to enqueue.
#[derive(Debug, Clone)]
pub struct ExitEvaluation {
    pub new_state: Option<ExitState>,
    pub state_transition: Option<(ExitState, ExitState)>,
    pub actions: Vec<(ActionKind, ActionPriority)>,
}

impl ExitEvaluation {
    fn idle() -> Self {
        Self {
            new_state: None,
            state_transition: None,
            actions: Vec::new(),
        }
    }

    fn transition(from: ExitState, to: ExitState, actions: Vec<(ActionKind, ActionPriority)>) -> Self {
        Self {
            new_state: Some(to),
            state_transition: Some((from, to)),
            actions,
        }
    }
}

/// Drives positions through the ladder-TP exit machine.
pub struct ExitOrchestrator {
    trailing_percent: f64,
    breakeven_offset_percent: f64,
}

impl ExitOrchestrator {
    pub fn new(trailing_percent: f64, breakeven_offset_percent: f64) -> Self {
        Self {
            trailing_percent,
            breakeven_offset_percent,
        }
    }

    pub fn trailing_percent(&self) -> f64 {
        self.trailing_percent
    }

    /// The breakeven stop target for a position (entry plus the configured
    /// offset in the profitable direction).
    pub fn breakeven_target(&self, position: &Position) -> f64 {
        breakeven_price(position, self.breakeven_offset_percent)
    }

    /// Evaluate one tick. At most one transition is produced per call; the
    /// next tick sees the handler-updated state and advances further if the
    /// price already cleared the next rung.
    pub fn evaluate(&self, position: &Position, current_price: f64) -> ExitEvaluation {
        // Terminal state emits nothing, ever.
        if position.exit_state == ExitState::Closed {
            return ExitEvaluation::idle();
        }

        // The exchange reported the position gone (SL hit, manual close).
        if position.status == PositionStatus::Closed {
            info!(
                id = %position.id,
                from = %position.exit_state,
                "position reported closed — collapsing exit state"
            );
            return ExitEvaluation::transition(position.exit_state, ExitState::Closed, Vec::new());
        }

        if current_price <= 0.0 {
            debug!(id = %position.id, price = current_price, "invalid price — skipping exit tick");
            return ExitEvaluation::idle();
        }

        match position.exit_state {
            ExitState::Open => self.check_rung(position, current_price, 0),
            ExitState::Tp1Hit => self.check_rung(position, current_price, 1),
            ExitState::Tp2Hit => self.check_rung(position, current_price, 2),
            ExitState::Tp3Hit | ExitState::Closed => ExitEvaluation::idle(),
        }
    }

    fn check_rung(&self, position: &Position, current_price: f64, index: usize) -> ExitEvaluation {
        let Some(leg) = position.take_profits.get(index) else {
            debug!(id = %position.id, index, "no TP leg at this rung");
            return ExitEvaluation::idle();
        };

        if !tp_hit(position, leg, current_price) {
            return ExitEvaluation::idle();
        }

        let from = position.exit_state;
        let (to, actions) = match index {
            0 => {
                let breakeven_price = breakeven_price(position, self.breakeven_offset_percent);
                info!(
                    id = %position.id,
                    price = current_price,
                    tp = leg.price,
                    size_percent = leg.size_percent,
                    breakeven = breakeven_price,
                    "TP1 hit — partial close, stop to breakeven"
                );
                (
                    ExitState::Tp1Hit,
                    vec![
                        (
                            ActionKind::ClosePercent {
                                position_id: position.id.clone(),
                                percentage: leg.size_percent,
                                reason: "TP1".to_string(),
                            },
                            ActionPriority::High,
                        ),
                        (
                            ActionKind::UpdateStopLoss {
                                position_id: position.id.clone(),
                                new_price: breakeven_price,
                                breakeven: true,
                            },
                            ActionPriority::High,
                        ),
                    ],
                )
            }
            1 => {
                info!(
                    id = %position.id,
                    price = current_price,
                    tp = leg.price,
                    size_percent = leg.size_percent,
                    trailing_percent = self.trailing_percent,
                    "TP2 hit — partial close, trailing on"
                );
                (
                    ExitState::Tp2Hit,
                    vec![
                        (
                            ActionKind::ClosePercent {
                                position_id: position.id.clone(),
                                percentage: leg.size_percent,
                                reason: "TP2".to_string(),
                            },
                            ActionPriority::High,
                        ),
                        (
                            ActionKind::ActivateTrailing {
                                position_id: position.id.clone(),
                                trailing_percent: self.trailing_percent,
                            },
                            ActionPriority::High,
                        ),
                    ],
                )
            }
            _ => {
                info!(
                    id = %position.id,
                    price = current_price,
                    tp = leg.price,
                    "TP3 hit — closing remainder"
                );
                (
                    ExitState::Tp3Hit,
                    vec![(
                        ActionKind::ClosePercent {
                            position_id: position.id.clone(),
                            percentage: 100.0,
                            reason: "TP3".to_string(),
                        },
                        ActionPriority::High,
                    )],
                )
            }
        };

        ExitEvaluation::transition(from, to, actions)
    }
}

/// A TP leg is hit when price has crossed it in the profitable direction.
fn tp_hit(position: &Position, leg: &TakeProfitLeg, current_price: f64) -> bool {
    if position.side.is_long() {
        current_price >= leg.price
    } else {
        current_price <= leg.price
    }
}

/// Breakeven target: the entry, nudged by the configured offset in the
/// profitable direction (covers fees).
fn breakeven_price(position: &Position, offset_percent: f64) -> f64 {
    position.entry_price * (1.0 + position.side.sign() * offset_percent / 100.0)
}
