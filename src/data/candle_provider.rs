// =============================================================================
// Candle Provider — bulk loads and per-role close updates into the repository
// =============================================================================
//
// The provider is the only writer of candle series. `initialize` loads every
// timeframe concurrently (one in-flight load per role); candle-close events
// append; reads fall back to a synchronous reload when the repository is
// empty for a role.
//
// Exchange reads retry with backoff, then degrade to whatever is cached —
// a market-data hiccup must not take the engine down.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::data::timeframes::TimeframeProvider;
use crate::error::{LogHooks, RecoveryStrategy, RetryConfig, run_with_recovery};
use crate::exchange::Exchange;
use crate::repository::MarketDataRepository;
use crate::types::{Candle, TimeframeRole};

/// Retry shape for market-data reads: 3 attempts, 100 ms doubling, 10 s cap.
fn market_data_retry() -> RecoveryStrategy {
    RecoveryStrategy::Retry(RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 100,
        backoff_multiplier: 2.0,
        max_delay_ms: 10_000,
    })
}

/// Owns candle ingestion for one symbol across all timeframe roles.
pub struct CandleProvider {
    exchange: Arc<dyn Exchange>,
    repository: Arc<MarketDataRepository>,
    timeframes: TimeframeProvider,
    symbol: String,
    clock: SharedClock,
    /// Last update per role, milliseconds.
    last_update: RwLock<HashMap<TimeframeRole, i64>>,
    /// Roles with a load in flight; at most one per role.
    loading: Mutex<HashSet<TimeframeRole>>,
}

impl CandleProvider {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        repository: Arc<MarketDataRepository>,
        timeframes: TimeframeProvider,
        symbol: impl Into<String>,
        clock: SharedClock,
    ) -> Self {
        Self {
            exchange,
            repository,
            timeframes,
            symbol: symbol.into(),
            clock,
            last_update: RwLock::new(HashMap::new()),
            loading: Mutex::new(HashSet::new()),
        }
    }

    /// Bulk-load every timeframe role concurrently. Failures degrade to
    /// whatever the repository already holds.
    pub async fn initialize(&self) {
        let loads = TimeframeRole::ALL.map(|role| self.load_role(role));
        futures_util::future::join_all(loads).await;
        info!(symbol = %self.symbol, "candle provider initialised");
    }

    /// Load one role from the exchange into the repository, unless a load for
    /// that role is already in flight.
    async fn load_role(&self, role: TimeframeRole) {
        {
            let mut loading = self.loading.lock();
            if !loading.insert(role) {
                debug!(role = %role, "load already in flight — skipping");
                return;
            }
        }

        let interval = self.timeframes.interval(role).to_string();
        let limit = self.timeframes.candle_limit(role);

        let outcome = run_with_recovery(
            || self.exchange.get_candles(&self.symbol, &interval, limit),
            &market_data_retry(),
            &LogHooks,
        )
        .await;

        match outcome.value {
            Some(candles) if !candles.is_empty() => {
                let count = candles.len();
                self.repository.save_candles(&self.symbol, &interval, candles);
                self.stamp(role);
                info!(role = %role, interval = %interval, count, "timeframe loaded");
            }
            Some(_) => {
                warn!(role = %role, interval = %interval, "exchange returned no candles");
            }
            None => {
                let cached = self.repository.candle_count(&self.symbol, &interval);
                warn!(
                    role = %role,
                    interval = %interval,
                    error = ?outcome.error,
                    cached,
                    "timeframe load failed — degrading to cached data"
                );
            }
        }

        self.loading.lock().remove(&role);
    }

    /// Append a closed candle for a role and stamp its update time.
    pub fn on_candle_closed(&self, role: TimeframeRole, candle: Candle) {
        let interval = self.timeframes.interval(role);
        debug!(
            role = %role,
            interval,
            ts = candle.timestamp,
            close = candle.close,
            "candle closed"
        );
        self.repository.append_candle(&self.symbol, interval, candle);
        self.stamp(role);
    }

    /// Read candles for a role; on an empty repository, reload synchronously
    /// first.
    pub async fn get_candles(&self, role: TimeframeRole, limit: Option<usize>) -> Vec<Candle> {
        let interval = self.timeframes.interval(role).to_string();

        if self.repository.candle_count(&self.symbol, &interval) == 0 {
            debug!(role = %role, "repository empty — synchronous reload");
            self.load_role(role).await;
        }

        self.repository.get_candles(&self.symbol, &interval, limit)
    }

    /// Milliseconds since the role last received data, if it ever has.
    pub fn age_ms(&self, role: TimeframeRole) -> Option<i64> {
        self.last_update
            .read()
            .get(&role)
            .map(|&at| self.clock.now_ms() - at)
    }

    /// Reset the per-role update timer.
    pub fn clear_cache(&self, role: TimeframeRole) {
        self.last_update.write().remove(&role);
        debug!(role = %role, "per-role timer cleared");
    }

    /// Drop every candle series and all timers.
    pub fn clear_all_caches(&self) {
        self.repository.clear_candles();
        self.last_update.write().clear();
        info!(symbol = %self.symbol, "all candle caches cleared");
    }

    fn stamp(&self, role: TimeframeRole) {
        self.last_update.write().insert(role, self.clock.now_ms());
    }
}

impl std::fmt::Debug for CandleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleProvider")
            .field("symbol", &self.symbol)
            .field("roles_seen", &self.last_update.read().len())
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
    use crate::config::EngineConfig;
    use crate::exchange::paper::PaperExchange;

    fn setup() -> (Arc<PaperExchange>, CandleProvider, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let paper = Arc::new(PaperExchange::standalone(clock.clone(), 10_000.0));
        let repository = Arc::new(MarketDataRepository::new(clock.clone()));
        let timeframes = TimeframeProvider::from_config(&EngineConfig::default());
        let provider = CandleProvider::new(
            paper.clone(),
            repository,
            timeframes,
            "BTCUSDT",
            clock.clone(),
        );
        (paper, provider, clock)
    }

    fn candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let c = 100.0 + i as f64;
                Candle::new(i as i64 * 3_600_000, c, c + 1.0, c - 1.0, c, 10.0)
            })
            .collect()
    }

    #[tokio::test]
    async fn initialize_loads_every_role() {
        let (paper, provider, _clock) = setup();
        paper.seed_candles(candles(50));

        provider.initialize().await;

        for role in TimeframeRole::ALL {
            let loaded = provider.get_candles(role, None).await;
            assert!(!loaded.is_empty(), "role {role} should have candles");
            assert!(provider.age_ms(role).is_some());
        }
    }

    #[tokio::test]
    async fn candle_close_appends_and_stamps() {
        let (paper, provider, clock) = setup();
        paper.seed_candles(candles(10));
        provider.initialize().await;

        clock.advance(5_000);
        provider.on_candle_closed(
            TimeframeRole::Primary,
            Candle::new(999 * 3_600_000, 1.0, 2.0, 0.5, 1.5, 3.0),
        );

        let loaded = provider.get_candles(TimeframeRole::Primary, None).await;
        assert_eq!(loaded.last().unwrap().timestamp, 999 * 3_600_000);
        assert_eq!(provider.age_ms(TimeframeRole::Primary), Some(0));
    }

    #[tokio::test]
    async fn empty_repository_triggers_synchronous_reload() {
        let (paper, provider, _clock) = setup();
        paper.seed_candles(candles(20));

        // No initialize — the read itself must fall back to a reload.
        let loaded = provider.get_candles(TimeframeRole::Entry, Some(5)).await;
        assert_eq!(loaded.len(), 5);
    }

    #[tokio::test]
    async fn clear_all_caches_empties_repository() {
        let (paper, provider, _clock) = setup();
        paper.seed_candles(candles(20));
        provider.initialize().await;

        provider.clear_all_caches();
        assert!(provider.age_ms(TimeframeRole::Primary).is_none());

        // The next read reloads from the exchange.
        let reloaded = provider.get_candles(TimeframeRole::Primary, None).await;
        assert_eq!(reloaded.len(), 20);
    }

    #[tokio::test]
    async fn clear_cache_resets_only_the_role_timer() {
        let (paper, provider, _clock) = setup();
        paper.seed_candles(candles(20));
        provider.initialize().await;

        provider.clear_cache(TimeframeRole::Primary);
        assert!(provider.age_ms(TimeframeRole::Primary).is_none());
        assert!(provider.age_ms(TimeframeRole::Entry).is_some());
    }
}
