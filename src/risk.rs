// =============================================================================
// Risk Manager — the atomic gatekeeper in front of every entry
// =============================================================================
//
// One `approve` call returns the whole decision: pass/reject plus the sized
// notional. Checks run in order:
//   1. Daily realized-loss limit
//   2. Loss-streak attenuation (and outright stop)
//   3. Concurrent exposure (optional)
//   4. Position sizing with notional cap
//
// Given identical inputs (including journal state) the verdict is identical.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analyzers::Signal;
use crate::clock::SharedClock;
use crate::config::RiskManagerConfig;
use crate::repository::{JournalRepository, Position};

/// Outcome of a risk approval.
#[derive(Debug, Clone, Serialize)]
pub enum RiskVerdict {
    Approved {
        /// Notional position size in quote currency (USDT).
        position_size: f64,
        /// Notional / balance.
        effective_leverage: f64,
        /// The streak attenuation that was applied.
        streak_multiplier: f64,
    },
    Rejected {
        reason: String,
    },
}

impl RiskVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    pub fn position_size(&self) -> Option<f64> {
        match self {
            Self::Approved { position_size, .. } => Some(*position_size),
            Self::Rejected { .. } => None,
        }
    }

    pub fn reject_reason(&self) -> Option<&str> {
        match self {
            Self::Rejected { reason } => Some(reason),
            Self::Approved { .. } => None,
        }
    }
}

/// Evaluates every entry against capital-protection rules.
pub struct RiskManager {
    config: RiskManagerConfig,
    journal: Arc<JournalRepository>,
    clock: SharedClock,
}

impl RiskManager {
    pub fn new(config: RiskManagerConfig, journal: Arc<JournalRepository>, clock: SharedClock) -> Self {
        Self {
            config,
            journal,
            clock,
        }
    }

    /// The single atomic gate. Returns the decision and, on approval, the
    /// sized notional with its effective leverage.
    pub fn approve(&self, signal: &Signal, balance: f64, open_positions: &[Position]) -> RiskVerdict {
        if balance <= 0.0 {
            return self.reject("no balance available");
        }
        if signal.price <= 0.0 {
            return self.reject("signal has no price");
        }

        // ── 1. Daily loss limit ──────────────────────────────────────────
        let daily_pnl = self.journal.realized_pnl_for_day(self.clock.now_ms());
        let daily_loss_percent = if daily_pnl < 0.0 {
            (-daily_pnl / balance) * 100.0
        } else {
            0.0
        };
        if daily_loss_percent >= self.config.daily_limits.max_daily_loss_percent {
            return self.reject(format!(
                "daily loss limit reached: {:.2}% lost (limit {:.2}%)",
                daily_loss_percent, self.config.daily_limits.max_daily_loss_percent
            ));
        }

        // ── 2. Loss streak ───────────────────────────────────────────────
        let streak = self.journal.consecutive_losses();
        if streak >= self.config.loss_streak.stop_after_losses {
            return self.reject(format!(
                "loss-streak stop: {} consecutive losses (limit {})",
                streak, self.config.loss_streak.stop_after_losses
            ));
        }
        let streak_multiplier = self.config.loss_streak.multiplier(streak);
        if streak >= 2 {
            debug!(
                streak,
                multiplier = streak_multiplier,
                "loss streak attenuation active"
            );
        }

        // ── 3. Concurrent exposure (optional) ────────────────────────────
        let sizing = &self.config.position_sizing;
        let risk_amount = balance * sizing.risk_per_trade_percent / 100.0 * streak_multiplier;

        if self.config.concurrent_risk.enabled {
            if open_positions.len() as u32 >= self.config.concurrent_risk.max_positions {
                return self.reject(format!(
                    "max concurrent positions reached ({})",
                    self.config.concurrent_risk.max_positions
                ));
            }

            let open_risk: f64 = open_positions.iter().map(position_risk).sum();
            let total_percent = (open_risk + risk_amount) / balance * 100.0;
            if total_percent > self.config.concurrent_risk.max_total_exposure_percent {
                return self.reject(format!(
                    "total exposure {:.2}% would exceed {:.2}%",
                    total_percent, self.config.concurrent_risk.max_total_exposure_percent
                ));
            }
        }

        // ── 4. Position sizing ───────────────────────────────────────────
        let sl_distance = (signal.price - signal.stop_loss).abs();
        if sl_distance <= 0.0 {
            return self.reject("stop-loss distance is zero");
        }

        let sl_fraction = sl_distance / signal.price;
        let position_size = (risk_amount / sl_fraction).clamp(sizing.min_usdt, sizing.max_usdt);

        let max_notional = balance * sizing.max_leverage_multiplier;
        if position_size > max_notional {
            return self.reject(format!(
                "notional {:.2} exceeds leverage cap {:.2}",
                position_size, max_notional
            ));
        }

        let effective_leverage = position_size / balance;

        info!(
            direction = %signal.direction,
            position_size = format!("{position_size:.2}"),
            effective_leverage = format!("{effective_leverage:.2}"),
            streak_multiplier,
            "risk approved"
        );

        RiskVerdict::Approved {
            position_size,
            effective_leverage,
            streak_multiplier,
        }
    }

    fn reject(&self, reason: impl Into<String>) -> RiskVerdict {
        let reason = reason.into();
        warn!(reason = %reason, "risk rejected");
        RiskVerdict::Rejected { reason }
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field(
                "max_daily_loss_percent",
                &self.config.daily_limits.max_daily_loss_percent,
            )
            .field(
                "stop_after_losses",
                &self.config.loss_streak.stop_after_losses,
            )
            .finish()
    }
}

/// Capital at risk for an open position: stop distance times quantity.
fn position_risk(position: &Position) -> f64 {
    (position.entry_price - position.stop_loss.price).abs() * position.quantity
}
