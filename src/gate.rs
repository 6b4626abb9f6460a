// =============================================================================
// MTF Snapshot Gate — freezes HTF bias between decision and execution
// =============================================================================
//
// An entry decision forms on the PRIMARY close, but executes on a later ENTRY
// close. The higher-timeframe bias can reverse in between; executing against
// a reversed bias is a known failure mode. The gate captures
// (htf_bias, trend, signal, primary candle) at decision time and validates it
// against the live bias at execution time.
//
// State machine: Empty -> Active (create) -> Empty (clear / expire / consume).
// At most one snapshot is active.
// =============================================================================

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analyzers::Signal;
use crate::clock::SharedClock;
use crate::trend::TrendAnalysis;
use crate::types::{Candle, Direction, TrendBias};

/// Snapshot lifetime (fixed in this version).
pub const SNAPSHOT_TTL_MS: i64 = 120_000;

/// Context frozen at the PRIMARY-close entry decision.
#[derive(Debug, Clone, Serialize)]
pub struct MtfSnapshot {
    pub id: String,
    pub htf_bias: TrendBias,
    pub trend: TrendAnalysis,
    pub signal: Signal,
    pub primary_candle: Candle,
    pub created_at: i64,
    pub expires_at: i64,
}

/// The bias pair that failed validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictingBias {
    pub signal_direction: Direction,
    pub current_bias: TrendBias,
}

/// Result of validating the active snapshot against the live HTF bias.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotValidation {
    pub valid: bool,
    pub expired: bool,
    pub bias_mismatch: bool,
    pub reason: String,
    pub conflicting: Option<ConflictingBias>,
}

impl SnapshotValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            expired: false,
            bias_mismatch: false,
            reason: "snapshot valid".to_string(),
            conflicting: None,
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            expired: false,
            bias_mismatch: false,
            reason: reason.into(),
            conflicting: None,
        }
    }
}

/// Diagnostic view of the active snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDebugInfo {
    pub id: String,
    pub age_ms: i64,
    pub expires_in_ms: i64,
}

/// Owner of the single active snapshot.
pub struct SnapshotGate {
    active: RwLock<Option<MtfSnapshot>>,
    clock: SharedClock,
    ttl_ms: i64,
}

impl SnapshotGate {
    pub fn new(clock: SharedClock, ttl_ms: i64) -> Self {
        Self {
            active: RwLock::new(None),
            clock,
            ttl_ms,
        }
    }

    /// Capture a snapshot, replacing any prior one.
    pub fn create_snapshot(
        &self,
        htf_bias: TrendBias,
        trend: TrendAnalysis,
        signal: Signal,
        primary_candle: Candle,
    ) -> MtfSnapshot {
        let created_at = self.clock.now_ms();
        let snapshot = MtfSnapshot {
            id: Uuid::new_v4().to_string(),
            htf_bias,
            trend,
            signal,
            primary_candle,
            created_at,
            expires_at: created_at + self.ttl_ms,
        };

        let mut active = self.active.write();
        if let Some(prior) = active.as_ref() {
            warn!(prior = %prior.id, new = %snapshot.id, "replacing active snapshot");
        }
        info!(
            id = %snapshot.id,
            bias = %snapshot.htf_bias,
            direction = %snapshot.signal.direction,
            expires_in_ms = self.ttl_ms,
            "snapshot created"
        );
        *active = Some(snapshot.clone());
        snapshot
    }

    /// Validate the active snapshot against the live HTF bias.
    ///
    /// An expired snapshot is dropped as a side-effect (Active -> Empty).
    pub fn validate(&self, current_htf_bias: TrendBias) -> SnapshotValidation {
        let now = self.clock.now_ms();
        let mut active = self.active.write();

        let Some(snapshot) = active.as_ref() else {
            return SnapshotValidation::invalid("No active snapshot");
        };

        if now > snapshot.expires_at {
            let mut result = SnapshotValidation::invalid(format!(
                "snapshot expired {} ms ago",
                now - snapshot.expires_at
            ));
            result.expired = true;
            debug!(id = %snapshot.id, "snapshot expired — dropping");
            *active = None;
            return result;
        }

        if Self::bias_conflicts(snapshot.htf_bias, snapshot.signal.direction, current_htf_bias) {
            let mut result = SnapshotValidation::invalid(format!(
                "HTF bias reversed: snapshot {} / signal {} vs current {}",
                snapshot.htf_bias, snapshot.signal.direction, current_htf_bias
            ));
            result.bias_mismatch = true;
            result.conflicting = Some(ConflictingBias {
                signal_direction: snapshot.signal.direction,
                current_bias: current_htf_bias,
            });
            return result;
        }

        SnapshotValidation::ok()
    }

    /// A neutral snapshot bias is compatible with any live bias; otherwise
    /// the live bias must not oppose the signal direction.
    fn bias_conflicts(
        snapshot_bias: TrendBias,
        signal_direction: Direction,
        current_bias: TrendBias,
    ) -> bool {
        if snapshot_bias == TrendBias::Neutral {
            return false;
        }
        matches!(
            (signal_direction, current_bias),
            (Direction::Long, TrendBias::Bearish) | (Direction::Short, TrendBias::Bullish)
        )
    }

    /// Drop the active snapshot.
    pub fn clear_active_snapshot(&self) {
        let mut active = self.active.write();
        if let Some(snapshot) = active.take() {
            debug!(id = %snapshot.id, "snapshot cleared");
        }
    }

    /// Remove and return the active snapshot (consume on execution).
    pub fn take_active(&self) -> Option<MtfSnapshot> {
        self.active.write().take()
    }

    pub fn get_active(&self) -> Option<MtfSnapshot> {
        self.active.read().clone()
    }

    /// 0 or 1.
    pub fn get_count(&self) -> usize {
        usize::from(self.active.read().is_some())
    }

    pub fn debug_info(&self) -> Option<SnapshotDebugInfo> {
        let now = self.clock.now_ms();
        self.active.read().as_ref().map(|s| SnapshotDebugInfo {
            id: s.id.clone(),
            age_ms: now - s.created_at,
            expires_in_ms: s.expires_at - now,
        })
    }
}

impl std::fmt::Debug for SnapshotGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotGate")
            .field("active", &self.get_count())
            .field("ttl_ms", &self.ttl_ms)
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
    use std::sync::Arc;

    fn gate_at(now_ms: i64) -> (SnapshotGate, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now_ms));
        (SnapshotGate::new(clock.clone(), SNAPSHOT_TTL_MS), clock)
    }

    fn long_signal(price: f64, stop_loss: f64) -> Signal {
        let mut signal = Signal::raw(Direction::Long, 80.0, "test");
        signal.price = price;
        signal.stop_loss = stop_loss;
        signal
    }

    fn candle() -> Candle {
        Candle::new(0, 999.0, 1001.0, 998.0, 1000.0, 10.0)
    }

    #[test]
    fn count_is_zero_or_one() {
        let (gate, _) = gate_at(0);
        assert_eq!(gate.get_count(), 0);

        gate.create_snapshot(
            TrendBias::Bullish,
            TrendAnalysis::neutral("4h"),
            long_signal(1000.0, 990.0),
            candle(),
        );
        assert_eq!(gate.get_count(), 1);

        // A second create replaces, never stacks.
        gate.create_snapshot(
            TrendBias::Bullish,
            TrendAnalysis::neutral("4h"),
            long_signal(1001.0, 991.0),
            candle(),
        );
        assert_eq!(gate.get_count(), 1);

        gate.clear_active_snapshot();
        assert_eq!(gate.get_count(), 0);
    }

    #[test]
    fn expires_at_is_created_at_plus_ttl() {
        let (gate, _) = gate_at(5_000);
        let snapshot = gate.create_snapshot(
            TrendBias::Bullish,
            TrendAnalysis::neutral("4h"),
            long_signal(1000.0, 990.0),
            candle(),
        );
        assert_eq!(snapshot.expires_at - snapshot.created_at, 120_000);
    }

    #[test]
    fn validate_without_snapshot() {
        let (gate, _) = gate_at(0);
        let result = gate.validate(TrendBias::Bullish);
        assert!(!result.valid);
        assert!(!result.expired);
        assert!(!result.bias_mismatch);
        assert_eq!(result.reason, "No active snapshot");
    }

    #[test]
    fn bullish_long_snapshot_validation_table() {
        let (gate, clock) = gate_at(0);
        gate.create_snapshot(
            TrendBias::Bullish,
            TrendAnalysis::neutral("4h"),
            long_signal(1000.0, 990.0),
            candle(),
        );

        clock.set(60_000);
        assert!(gate.validate(TrendBias::Bullish).valid);
        assert!(gate.validate(TrendBias::Neutral).valid);

        let mismatch = gate.validate(TrendBias::Bearish);
        assert!(!mismatch.valid);
        assert!(mismatch.bias_mismatch);
        assert_eq!(
            mismatch.conflicting,
            Some(ConflictingBias {
                signal_direction: Direction::Long,
                current_bias: TrendBias::Bearish,
            })
        );
        // Mismatch does not auto-clear; the orchestrator decides.
        assert_eq!(gate.get_count(), 1);
    }

    #[test]
    fn bearish_short_snapshot_validation_table() {
        let (gate, _) = gate_at(0);
        let mut signal = long_signal(1000.0, 1010.0);
        signal.direction = Direction::Short;
        gate.create_snapshot(
            TrendBias::Bearish,
            TrendAnalysis::neutral("4h"),
            signal,
            candle(),
        );

        assert!(gate.validate(TrendBias::Bearish).valid);
        assert!(gate.validate(TrendBias::Neutral).valid);
        let result = gate.validate(TrendBias::Bullish);
        assert!(!result.valid);
        assert!(result.bias_mismatch);
    }

    #[test]
    fn neutral_snapshot_accepts_any_bias() {
        let (gate, _) = gate_at(0);
        gate.create_snapshot(
            TrendBias::Neutral,
            TrendAnalysis::neutral("4h"),
            long_signal(1000.0, 990.0),
            candle(),
        );
        assert!(gate.validate(TrendBias::Bullish).valid);
        assert!(gate.validate(TrendBias::Bearish).valid);
        assert!(gate.validate(TrendBias::Neutral).valid);
    }

    #[test]
    fn expiry_at_121_seconds() {
        let (gate, clock) = gate_at(0);
        gate.create_snapshot(
            TrendBias::Bullish,
            TrendAnalysis::neutral("4h"),
            long_signal(1000.0, 990.0),
            candle(),
        );

        clock.set(121_000);
        let result = gate.validate(TrendBias::Bullish);
        assert!(!result.valid);
        assert!(result.expired);
        // Expired snapshot is dropped.
        assert_eq!(gate.get_count(), 0);
    }

    #[test]
    fn boundary_exactly_at_expiry_is_still_valid() {
        let (gate, clock) = gate_at(0);
        gate.create_snapshot(
            TrendBias::Bullish,
            TrendAnalysis::neutral("4h"),
            long_signal(1000.0, 990.0),
            candle(),
        );

        clock.set(120_000); // now == expires_at
        assert!(gate.validate(TrendBias::Bullish).valid);
    }

    #[test]
    fn debug_info_reports_age_and_remaining() {
        let (gate, clock) = gate_at(1_000);
        gate.create_snapshot(
            TrendBias::Bullish,
            TrendAnalysis::neutral("4h"),
            long_signal(1000.0, 990.0),
            candle(),
        );

        clock.set(31_000);
        let info = gate.debug_info().unwrap();
        assert_eq!(info.age_ms, 30_000);
        assert_eq!(info.expires_in_ms, 90_000);
    }

    #[test]
    fn take_active_consumes() {
        let (gate, _) = gate_at(0);
        gate.create_snapshot(
            TrendBias::Bullish,
            TrendAnalysis::neutral("4h"),
            long_signal(1000.0, 990.0),
            candle(),
        );
        assert!(gate.take_active().is_some());
        assert_eq!(gate.get_count(), 0);
        assert!(gate.take_active().is_none());
    }
}
