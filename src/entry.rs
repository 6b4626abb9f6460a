// =============================================================================
// Entry Orchestrator — consolidates producer signals into one decision
// =============================================================================
//
// Pipeline per PRIMARY close:
//   1. Busy check (one position at a time)
//   2. Drop signals the HTF trend restricts
//   3. Score per direction: sum of confidence/100 x weight
//   4. Winner by score, ties by priority
//   5. Threshold against the normalized score (0-100)
//   6. Build one representative signal
//   7. Atomic risk approval attaches the sized notional
//
// Producers emit confidence 0-100; this is the only place it is scaled to
// 0-1 (and back for the threshold comparison).
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::analyzers::Signal;
use crate::repository::Position;
use crate::risk::{RiskManager, RiskVerdict};
use crate::trend::TrendAnalysis;
use crate::types::Direction;

/// The consolidated entry decision.
#[derive(Debug, Clone, Serialize)]
pub enum EntryDecision {
    Enter {
        signal: Signal,
        /// Notional size approved by the risk manager (USDT).
        position_size: f64,
        effective_leverage: f64,
    },
    Skip {
        reason: String,
    },
}

impl EntryDecision {
    pub fn is_enter(&self) -> bool {
        matches!(self, Self::Enter { .. })
    }

    fn skip(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        debug!(reason = %reason, "entry skipped");
        Self::Skip { reason }
    }
}

/// Consolidates signals, gates them against the trend, and asks risk.
pub struct EntryOrchestrator {
    min_confidence_to_enter: f64,
    risk: Arc<RiskManager>,
}

impl EntryOrchestrator {
    pub fn new(min_confidence_to_enter: f64, risk: Arc<RiskManager>) -> Self {
        Self {
            min_confidence_to_enter,
            risk,
        }
    }

    pub fn evaluate(
        &self,
        signals: &[Signal],
        current_balance: f64,
        open_positions: &[Position],
        trend: &TrendAnalysis,
    ) -> EntryDecision {
        // ── 1. One position at a time ────────────────────────────────────
        if !open_positions.is_empty() {
            return EntryDecision::skip("already in position");
        }

        // ── 2. Trend restriction ─────────────────────────────────────────
        let aligned: Vec<&Signal> = signals
            .iter()
            .filter(|s| !trend.restricts(s.direction))
            .collect();

        // ── 3. Nothing left ──────────────────────────────────────────────
        if aligned.is_empty() {
            return EntryDecision::skip("no aligned signals");
        }

        // ── 4. Score per direction, winner by score then priority ────────
        let long = DirectionScore::aggregate(&aligned, Direction::Long);
        let short = DirectionScore::aggregate(&aligned, Direction::Short);

        let winner = match (long.has_signals(), short.has_signals()) {
            (false, false) => return EntryDecision::skip("no directional signals"),
            (true, false) => long,
            (false, true) => short,
            (true, true) => {
                if (long.score - short.score).abs() < f64::EPSILON {
                    if long.max_priority >= short.max_priority {
                        long
                    } else {
                        short
                    }
                } else if long.score > short.score {
                    long
                } else {
                    short
                }
            }
        };

        // ── 5. Threshold on the normalized score ─────────────────────────
        let normalized = winner.normalized();
        if normalized < self.min_confidence_to_enter {
            return EntryDecision::skip(format!(
                "score {:.1} below entry threshold {:.1}",
                normalized, self.min_confidence_to_enter
            ));
        }

        // ── 6. Representative signal ─────────────────────────────────────
        let signal = winner.representative(normalized);

        // ── 7. Risk approval ─────────────────────────────────────────────
        match self.risk.approve(&signal, current_balance, open_positions) {
            RiskVerdict::Approved {
                position_size,
                effective_leverage,
                ..
            } => {
                info!(
                    direction = %signal.direction,
                    confidence = format!("{:.1}", signal.confidence),
                    position_size = format!("{position_size:.2}"),
                    contributors = %signal.signal_type,
                    "ENTER decision"
                );
                EntryDecision::Enter {
                    signal,
                    position_size,
                    effective_leverage,
                }
            }
            RiskVerdict::Rejected { reason } => EntryDecision::skip(reason),
        }
    }
}

impl std::fmt::Debug for EntryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryOrchestrator")
            .field("min_confidence_to_enter", &self.min_confidence_to_enter)
            .finish()
    }
}

/// Aggregated score for one direction.
struct DirectionScore<'a> {
    direction: Direction,
    /// Sum of confidence/100 x weight.
    score: f64,
    /// Sum of contributing weights, for normalization.
    total_weight: f64,
    max_priority: u8,
    contributors: Vec<&'a Signal>,
}

impl<'a> DirectionScore<'a> {
    fn aggregate(signals: &[&'a Signal], direction: Direction) -> Self {
        let mut score = 0.0;
        let mut total_weight = 0.0;
        let mut max_priority = 0;
        let mut contributors = Vec::new();

        for signal in signals.iter().filter(|s| s.direction == direction) {
            score += signal.confidence / 100.0 * signal.weight;
            total_weight += signal.weight;
            max_priority = max_priority.max(signal.priority);
            contributors.push(*signal);
        }

        Self {
            direction,
            score,
            total_weight,
            max_priority,
            contributors,
        }
    }

    fn has_signals(&self) -> bool {
        !self.contributors.is_empty()
    }

    /// Weighted-average confidence on the 0-100 scale.
    fn normalized(&self) -> f64 {
        if self.total_weight <= 0.0 {
            return 0.0;
        }
        (self.score / self.total_weight) * 100.0
    }

    /// Build the single signal that represents this direction: price from the
    /// latest contributor, protection from the highest-priority one, reasons
    /// concatenated.
    fn representative(&self, confidence: f64) -> Signal {
        let lead = self
            .contributors
            .iter()
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.confidence.total_cmp(&b.confidence))
            })
            .expect("representative requires contributors");

        let reason = self
            .contributors
            .iter()
            .map(|s| format!("{}: {}", s.signal_type, s.reason))
            .collect::<Vec<_>>()
            .join(" | ");
        let signal_type = self
            .contributors
            .iter()
            .map(|s| s.signal_type.as_str())
            .collect::<Vec<_>>()
            .join("+");

        Signal {
            direction: self.direction,
            confidence,
            signal_type,
            price: lead.price,
            stop_loss: lead.stop_loss,
            take_profits: lead.take_profits.clone(),
            reason,
            timestamp: lead.timestamp,
            weight: 1.0,
            priority: self.max_priority,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RiskManagerConfig;
    use crate::repository::position::tests::sample_position;
    use crate::repository::JournalRepository;
    use crate::types::{Side, TrendBias};

    fn signal(direction: Direction, confidence: f64, weight: f64, priority: u8) -> Signal {
        let mut s = Signal::raw(direction, confidence, "r");
        s.signal_type = format!("prod-{direction}-{priority}");
        s.price = 100.0;
        s.stop_loss = if direction == Direction::Long { 99.0 } else { 101.0 };
        s.take_profits = vec![101.0, 102.0, 103.0];
        s.weight = weight;
        s.priority = priority;
        s
    }

    fn orchestrator(threshold: f64) -> (EntryOrchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(JournalRepository::open(dir.path()));
        let clock = Arc::new(ManualClock::new(0));
        let risk = Arc::new(RiskManager::new(RiskManagerConfig::default(), journal, clock));
        (EntryOrchestrator::new(threshold, risk), dir)
    }

    fn bullish_trend() -> TrendAnalysis {
        TrendAnalysis {
            bias: TrendBias::Bullish,
            strength: 0.8,
            timeframe: "4h".to_string(),
            restricted_directions: vec![Direction::Short],
        }
    }

    #[test]
    fn open_position_skips_immediately() {
        let (orchestrator, _dir) = orchestrator(50.0);
        let open = vec![sample_position("p", Side::Long)];
        let decision = orchestrator.evaluate(
            &[signal(Direction::Long, 90.0, 1.0, 0)],
            10_000.0,
            &open,
            &TrendAnalysis::neutral("4h"),
        );
        match decision {
            EntryDecision::Skip { reason } => assert_eq!(reason, "already in position"),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn restricted_direction_is_dropped() {
        let (orchestrator, _dir) = orchestrator(50.0);
        let decision = orchestrator.evaluate(
            &[signal(Direction::Short, 95.0, 1.0, 0)],
            10_000.0,
            &[],
            &bullish_trend(),
        );
        match decision {
            EntryDecision::Skip { reason } => assert_eq!(reason, "no aligned signals"),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn winning_direction_enters_with_size() {
        let (orchestrator, _dir) = orchestrator(50.0);
        let signals = vec![
            signal(Direction::Long, 80.0, 1.0, 1),
            signal(Direction::Long, 60.0, 0.5, 0),
            signal(Direction::Short, 90.0, 0.2, 0),
        ];
        let decision = orchestrator.evaluate(
            &signals,
            10_000.0,
            &[],
            &TrendAnalysis::neutral("4h"),
        );
        match decision {
            EntryDecision::Enter {
                signal,
                position_size,
                ..
            } => {
                assert_eq!(signal.direction, Direction::Long);
                // Weighted average: (0.8*1 + 0.6*0.5)/1.5 = 0.7333 -> 73.3
                assert!((signal.confidence - 73.333).abs() < 0.01);
                assert!(position_size > 0.0);
                assert!(signal.signal_type.contains("prod-LONG-1"));
                assert!(signal.reason.contains(" | "));
                // Protection comes from the highest-priority contributor.
                assert_eq!(signal.stop_loss, 99.0);
            }
            other => panic!("expected enter, got {other:?}"),
        }
    }

    #[test]
    fn below_threshold_skips() {
        let (orchestrator, _dir) = orchestrator(80.0);
        let decision = orchestrator.evaluate(
            &[signal(Direction::Long, 60.0, 1.0, 0)],
            10_000.0,
            &[],
            &TrendAnalysis::neutral("4h"),
        );
        match decision {
            EntryDecision::Skip { reason } => assert!(reason.contains("below entry threshold")),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn tie_breaks_by_priority() {
        let (orchestrator, _dir) = orchestrator(10.0);
        // Identical scores; short has the higher priority.
        let signals = vec![
            signal(Direction::Long, 80.0, 0.5, 0),
            signal(Direction::Short, 80.0, 0.5, 3),
        ];
        let decision = orchestrator.evaluate(
            &signals,
            10_000.0,
            &[],
            &TrendAnalysis::neutral("4h"),
        );
        match decision {
            EntryDecision::Enter { signal, .. } => assert_eq!(signal.direction, Direction::Short),
            other => panic!("expected enter, got {other:?}"),
        }
    }

    #[test]
    fn no_signals_at_all_skips() {
        let (orchestrator, _dir) = orchestrator(50.0);
        let decision =
            orchestrator.evaluate(&[], 10_000.0, &[], &TrendAnalysis::neutral("4h"));
        assert!(!decision.is_enter());
    }
}
