// =============================================================================
// Session Tracker — per-run trade statistics, flushed to the journal at exit
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::clock::SharedClock;
use crate::repository::{JournalRepository, SessionRecord};

/// Tracks this process run's trade outcomes.
pub struct SessionTracker {
    record: Mutex<SessionRecord>,
    journal: Arc<JournalRepository>,
    clock: SharedClock,
}

impl SessionTracker {
    pub fn new(journal: Arc<JournalRepository>, clock: SharedClock) -> Self {
        let record = SessionRecord::new(clock.now_ms());
        info!(session_id = %record.id, "session started");
        Self {
            record: Mutex::new(record),
            journal,
            clock,
        }
    }

    /// Fold one completed trade into the session counters.
    pub fn on_trade_closed(&self, realized_pnl: f64) {
        let mut record = self.record.lock();
        record.trades += 1;
        if realized_pnl >= 0.0 {
            record.wins += 1;
        } else {
            record.losses += 1;
        }
        record.realized_pnl += realized_pnl;
    }

    pub fn snapshot(&self) -> SessionRecord {
        self.record.lock().clone()
    }

    /// Seal the session and persist it. Called once at shutdown; a second
    /// call appends nothing new because the record id is stable.
    pub fn flush(&self) {
        let record = {
            let mut record = self.record.lock();
            if record.ended_at.is_some() {
                return;
            }
            record.ended_at = Some(self.clock.now_ms());
            record.clone()
        };

        info!(
            session_id = %record.id,
            trades = record.trades,
            wins = record.wins,
            losses = record.losses,
            realized_pnl = record.realized_pnl,
            "session flushed to journal"
        );
        self.journal.record_session(record);
    }
}

impl std::fmt::Debug for SessionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record.lock();
        f.debug_struct("SessionTracker")
            .field("trades", &record.trades)
            .field("realized_pnl", &record.realized_pnl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn counters_accumulate_and_flush_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(JournalRepository::open(dir.path()));
        let clock = Arc::new(ManualClock::new(1_000));
        let tracker = SessionTracker::new(journal.clone(), clock.clone());

        tracker.on_trade_closed(5.0);
        tracker.on_trade_closed(-2.0);
        tracker.on_trade_closed(1.0);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.trades, 3);
        assert_eq!(snapshot.wins, 2);
        assert_eq!(snapshot.losses, 1);
        assert!((snapshot.realized_pnl - 4.0).abs() < 1e-9);

        clock.set(9_000);
        tracker.flush();
        tracker.flush(); // no double write
        assert_eq!(journal.sessions().len(), 1);
        assert_eq!(journal.sessions()[0].ended_at, Some(9_000));
    }
}
