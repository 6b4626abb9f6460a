// =============================================================================
// Journal Repository — trade + session records persisted to JSON files
// =============================================================================
//
// Cache-through design: everything lives in memory and every mutation flushes
// to disk with an atomic tmp + rename write. Load failures never propagate:
// a missing file means an empty journal, a corrupt file is logged and
// replaced by an empty state on the next flush.
//
// Flush failures get one retry after 50 ms, then are swallowed with a loud
// log — a trading tick must never die on a journal write.
// =============================================================================

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::types::Side;

const FLUSH_RETRY_DELAY_MS: u64 = 50;

/// One journaled trade. Appended at open, updated at partial and final close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    #[serde(default)]
    pub exit_price: Option<f64>,
    pub quantity: f64,
    /// Milliseconds since the UNIX epoch.
    pub entry_time: i64,
    #[serde(default)]
    pub exit_time: Option<i64>,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub exit_reason: Option<String>,
}

impl TradeRecord {
    /// Recompute realized PnL from the exit price, preserving the invariant
    /// that an exit price always carries an exit time.
    pub fn apply_exit(&mut self, exit_price: f64, exit_time: i64, reason: impl Into<String>) {
        self.exit_price = Some(exit_price);
        self.exit_time = Some(exit_time);
        self.exit_reason = Some(reason.into());
        self.pnl = self.side.sign() * (exit_price - self.entry_price) * self.quantity;
    }
}

/// One trading session (process lifetime), flushed at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub started_at: i64,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub trades: u32,
    #[serde(default)]
    pub wins: u32,
    #[serde(default)]
    pub losses: u32,
    #[serde(default)]
    pub realized_pnl: f64,
}

impl SessionRecord {
    pub fn new(started_at: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at,
            ended_at: None,
            trades: 0,
            wins: 0,
            losses: 0,
            realized_pnl: 0.0,
        }
    }
}

/// Filter for [`JournalRepository::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TradeQuery {
    pub symbol: Option<String>,
    pub side: Option<Side>,
    /// Inclusive entry-time window, milliseconds.
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub strategy: Option<String>,
}

impl TradeQuery {
    fn matches(&self, trade: &TradeRecord) -> bool {
        if let Some(symbol) = &self.symbol {
            if &trade.symbol != symbol {
                return false;
            }
        }
        if let Some(side) = self.side {
            if trade.side != side {
                return false;
            }
        }
        if let Some(from) = self.from {
            if trade.entry_time < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if trade.entry_time > to {
                return false;
            }
        }
        if let Some(strategy) = &self.strategy {
            if trade.strategy.as_deref() != Some(strategy.as_str()) {
                return false;
            }
        }
        true
    }
}

struct Inner {
    trades: Vec<TradeRecord>,
    sessions: Vec<SessionRecord>,
}

/// File-backed journal of trades and sessions.
pub struct JournalRepository {
    inner: RwLock<Inner>,
    trades_path: PathBuf,
    sessions_path: PathBuf,
}

impl JournalRepository {
    /// Open (or create) the journal under `data_dir`. Never fails: missing or
    /// corrupt files produce an empty state.
    pub fn open(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        if let Err(e) = std::fs::create_dir_all(data_dir) {
            warn!(dir = %data_dir.display(), error = %e, "could not create journal directory");
        }

        let trades_path = data_dir.join("trades.json");
        let sessions_path = data_dir.join("sessions.json");

        let trades: Vec<TradeRecord> = load_json_array(&trades_path);
        let sessions: Vec<SessionRecord> = load_json_array(&sessions_path);

        info!(
            trades = trades.len(),
            sessions = sessions.len(),
            dir = %data_dir.display(),
            "journal loaded"
        );

        Self {
            inner: RwLock::new(Inner { trades, sessions }),
            trades_path,
            sessions_path,
        }
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// Append a trade and flush.
    pub fn record_trade(&self, trade: TradeRecord) {
        {
            let mut inner = self.inner.write();
            inner.trades.push(trade);
        }
        self.flush_trades();
    }

    /// Mutate the trade with `id` in place, then flush. Returns `false` when
    /// no such trade exists.
    pub fn update_trade<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut TradeRecord),
    {
        let found = {
            let mut inner = self.inner.write();
            match inner.trades.iter_mut().find(|t| t.id == id) {
                Some(trade) => {
                    f(trade);
                    true
                }
                None => false,
            }
        };
        if found {
            self.flush_trades();
        } else {
            debug!(id, "update_trade: no matching trade");
        }
        found
    }

    /// Trades matching `query`, in record order.
    pub fn query(&self, query: &TradeQuery) -> Vec<TradeRecord> {
        self.inner
            .read()
            .trades
            .iter()
            .filter(|t| query.matches(t))
            .cloned()
            .collect()
    }

    pub fn all_trades(&self) -> Vec<TradeRecord> {
        self.inner.read().trades.clone()
    }

    pub fn trade_count(&self) -> usize {
        self.inner.read().trades.len()
    }

    /// `|{t : t.pnl > 0}| / |trades|`, or 0 for an empty journal. Only closed
    /// trades (exit time set) are counted.
    pub fn win_rate(&self) -> f64 {
        let inner = self.inner.read();
        let closed: Vec<&TradeRecord> =
            inner.trades.iter().filter(|t| t.exit_time.is_some()).collect();
        if closed.is_empty() {
            return 0.0;
        }
        let wins = closed.iter().filter(|t| t.pnl > 0.0).count();
        wins as f64 / closed.len() as f64
    }

    /// Realized PnL of all closed trades whose entry falls inside the day
    /// (UTC) containing `now_ms`.
    pub fn realized_pnl_for_day(&self, now_ms: i64) -> f64 {
        const DAY_MS: i64 = 86_400_000;
        let day_start = (now_ms / DAY_MS) * DAY_MS;
        let day_end = day_start + DAY_MS - 1;
        self.inner
            .read()
            .trades
            .iter()
            .filter(|t| {
                t.exit_time.is_some() && t.entry_time >= day_start && t.entry_time <= day_end
            })
            .map(|t| t.pnl)
            .sum()
    }

    /// Length of the trailing run of consecutive losing closed trades.
    pub fn consecutive_losses(&self) -> u32 {
        let inner = self.inner.read();
        let mut streak = 0;
        for trade in inner.trades.iter().rev().filter(|t| t.exit_time.is_some()) {
            if trade.pnl < 0.0 {
                streak += 1;
            } else {
                break;
            }
        }
        streak
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Append a session record and flush.
    pub fn record_session(&self, session: SessionRecord) {
        {
            let mut inner = self.inner.write();
            inner.sessions.push(session);
        }
        self.flush_sessions();
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.inner.read().sessions.clone()
    }

    /// `Σ pnl` of trades whose entry time falls inside the session window.
    pub fn session_pnl(&self, session: &SessionRecord) -> f64 {
        let end = session.ended_at.unwrap_or(i64::MAX);
        self.inner
            .read()
            .trades
            .iter()
            .filter(|t| t.entry_time >= session.started_at && t.entry_time <= end)
            .map(|t| t.pnl)
            .sum()
    }

    // -------------------------------------------------------------------------
    // Flushing
    // -------------------------------------------------------------------------

    fn flush_trades(&self) {
        let snapshot = self.inner.read().trades.clone();
        flush_json_array(&self.trades_path, &snapshot);
    }

    fn flush_sessions(&self) {
        let snapshot = self.inner.read().sessions.clone();
        flush_json_array(&self.sessions_path, &snapshot);
    }
}

impl std::fmt::Debug for JournalRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("JournalRepository")
            .field("trades", &inner.trades.len())
            .field("sessions", &inner.sessions.len())
            .field("trades_path", &self.trades_path)
            .finish()
    }
}

/// Load a JSON array, tolerating a missing file (empty) and a corrupt file
/// (logged, empty).
fn load_json_array<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "journal file unparseable — starting empty");
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "journal file unreadable — starting empty");
            Vec::new()
        }
    }
}

/// Atomic write+rename, with one retry after 50 ms. A second failure is
/// swallowed with a loud log.
fn flush_json_array<T: Serialize>(path: &Path, records: &[T]) {
    let content = match serde_json::to_string_pretty(records) {
        Ok(c) => c,
        Err(e) => {
            error!(path = %path.display(), error = %e, "journal serialisation failed — records NOT persisted");
            return;
        }
    };

    for attempt in 1..=2 {
        match write_atomic(path, &content) {
            Ok(()) => return,
            Err(e) if attempt == 1 => {
                warn!(path = %path.display(), error = %e, "journal flush failed — retrying once");
                std::thread::sleep(std::time::Duration::from_millis(FLUSH_RETRY_DELAY_MS));
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "journal flush failed after retry — records NOT persisted"
                );
            }
        }
    }
}

fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}
