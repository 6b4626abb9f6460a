// =============================================================================
// Market Data Repository — candles per (symbol, interval) + indicator cache
// =============================================================================
//
// Candle series are capped at `max_candles_per_tf` via head-drop (oldest
// first). The indicator side holds typed values with TTL expiry and FIFO
// eviction by insertion timestamp once the cap is reached.
//
// Pure in-memory; the API cannot fail. Thread-safety via parking_lot::RwLock.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::SharedClock;
use crate::types::{Candle, OrderBook};

/// Default per-timeframe candle cap.
pub const MAX_CANDLES_PER_TF: usize = 500;
/// Default indicator cache capacity.
pub const MAX_INDICATORS: usize = 500;
/// Default indicator TTL.
pub const DEFAULT_INDICATOR_TTL_MS: i64 = 60_000;

/// Approximate bytes per stored candle, for the stats report.
const CANDLE_APPROX_BYTES: usize = 80;

/// Composite key identifying a candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SeriesKey {
    pub symbol: String,
    pub interval: String,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Typed indicator values so that cache readers never see untyped interiors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndicatorValue {
    Scalar(f64),
    Series(Vec<f64>),
    Bands { upper: f64, middle: f64, lower: f64 },
}

impl IndicatorValue {
    /// Approximate in-memory footprint, for the stats report.
    pub fn approx_bytes(&self) -> usize {
        match self {
            Self::Scalar(_) => 16,
            Self::Series(v) => 24 + v.len() * 8,
            Self::Bands { .. } => 32,
        }
    }

    /// Convenience accessor for scalar values.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

struct CachedIndicator {
    value: IndicatorValue,
    created_at: i64,
    ttl_ms: i64,
    /// Insertion order tiebreak when timestamps collide.
    seq: u64,
}

impl CachedIndicator {
    fn expired(&self, now_ms: i64) -> bool {
        now_ms - self.created_at > self.ttl_ms
    }
}

/// Aggregate repository statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryStats {
    pub candle_series: usize,
    pub candle_count: usize,
    pub indicator_count: usize,
    pub size_bytes: usize,
}

struct Inner {
    candles: HashMap<SeriesKey, Vec<Candle>>,
    indicators: HashMap<String, CachedIndicator>,
    orderbook: Option<OrderBook>,
    next_seq: u64,
}

/// In-memory store shared by every market-data consumer.
pub struct MarketDataRepository {
    inner: RwLock<Inner>,
    clock: SharedClock,
    max_candles_per_tf: usize,
    max_indicators: usize,
}

impl MarketDataRepository {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_capacity(clock, MAX_CANDLES_PER_TF, MAX_INDICATORS)
    }

    pub fn with_capacity(
        clock: SharedClock,
        max_candles_per_tf: usize,
        max_indicators: usize,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                candles: HashMap::new(),
                indicators: HashMap::new(),
                orderbook: None,
                next_seq: 0,
            }),
            clock,
            max_candles_per_tf,
            max_indicators,
        }
    }

    // -------------------------------------------------------------------------
    // Candles
    // -------------------------------------------------------------------------

    /// Replace the series for `(symbol, interval)`. When the incoming set
    /// exceeds the cap, only the last `max_candles_per_tf` are kept.
    pub fn save_candles(&self, symbol: &str, interval: &str, mut candles: Vec<Candle>) {
        if candles.len() > self.max_candles_per_tf {
            candles.drain(..candles.len() - self.max_candles_per_tf);
        }
        let mut inner = self.inner.write();
        inner
            .candles
            .insert(SeriesKey::new(symbol, interval), candles);
    }

    /// Append one closed candle. A candle with the same timestamp as the
    /// current tail replaces it; an older candle is ignored.
    pub fn append_candle(&self, symbol: &str, interval: &str, candle: Candle) {
        let mut inner = self.inner.write();
        let series = inner
            .candles
            .entry(SeriesKey::new(symbol, interval))
            .or_default();

        match series.last() {
            Some(last) if candle.timestamp < last.timestamp => {
                debug!(
                    symbol,
                    interval,
                    incoming = candle.timestamp,
                    tail = last.timestamp,
                    "dropping out-of-order candle"
                );
                return;
            }
            Some(last) if candle.timestamp == last.timestamp => {
                *series.last_mut().unwrap() = candle;
            }
            _ => series.push(candle),
        }

        if series.len() > self.max_candles_per_tf {
            let overflow = series.len() - self.max_candles_per_tf;
            series.drain(..overflow);
        }
    }

    /// The last `limit` candles (all when `limit` is `None`), oldest first.
    pub fn get_candles(&self, symbol: &str, interval: &str, limit: Option<usize>) -> Vec<Candle> {
        let inner = self.inner.read();
        match inner.candles.get(&SeriesKey::new(symbol, interval)) {
            Some(series) => {
                let start = match limit {
                    Some(n) => series.len().saturating_sub(n),
                    None => 0,
                };
                series[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Candles with `timestamp >= ts`.
    pub fn get_candles_since(&self, symbol: &str, interval: &str, ts: i64) -> Vec<Candle> {
        let inner = self.inner.read();
        inner
            .candles
            .get(&SeriesKey::new(symbol, interval))
            .map(|series| {
                series
                    .iter()
                    .filter(|c| c.timestamp >= ts)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The most recent candle, if any.
    pub fn latest_candle(&self, symbol: &str, interval: &str) -> Option<Candle> {
        let inner = self.inner.read();
        inner
            .candles
            .get(&SeriesKey::new(symbol, interval))
            .and_then(|series| series.last().cloned())
    }

    /// Number of candles stored for a series.
    pub fn candle_count(&self, symbol: &str, interval: &str) -> usize {
        let inner = self.inner.read();
        inner
            .candles
            .get(&SeriesKey::new(symbol, interval))
            .map_or(0, Vec::len)
    }

    /// Drop every candle series.
    pub fn clear_candles(&self) {
        self.inner.write().candles.clear();
    }

    // -------------------------------------------------------------------------
    // Order book
    // -------------------------------------------------------------------------

    /// Replace the latest order-book snapshot.
    pub fn save_orderbook(&self, book: OrderBook) {
        self.inner.write().orderbook = Some(book);
    }

    pub fn latest_orderbook(&self) -> Option<OrderBook> {
        self.inner.read().orderbook.clone()
    }

    // -------------------------------------------------------------------------
    // Indicator cache
    // -------------------------------------------------------------------------

    /// Insert a value under `key`. When the cache is full and `key` is new,
    /// the oldest entry by insertion timestamp is evicted first.
    pub fn cache_indicator(&self, key: &str, value: IndicatorValue, ttl_ms: Option<i64>) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write();

        if inner.indicators.len() >= self.max_indicators && !inner.indicators.contains_key(key) {
            if let Some(oldest) = inner
                .indicators
                .iter()
                .min_by_key(|(_, v)| (v.created_at, v.seq))
                .map(|(k, _)| k.clone())
            {
                inner.indicators.remove(&oldest);
                debug!(evicted = %oldest, "indicator cache full — evicted oldest entry");
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.indicators.insert(
            key.to_string(),
            CachedIndicator {
                value,
                created_at: now,
                ttl_ms: ttl_ms.unwrap_or(DEFAULT_INDICATOR_TTL_MS),
                seq,
            },
        );
    }

    /// Read a value. Expired entries are removed and read as `None`.
    pub fn get_indicator(&self, key: &str) -> Option<IndicatorValue> {
        let now = self.clock.now_ms();

        {
            let inner = self.inner.read();
            match inner.indicators.get(key) {
                Some(entry) if !entry.expired(now) => return Some(entry.value.clone()),
                None => return None,
                _ => {}
            }
        }

        // Entry exists but expired — drop it under the write lock.
        let mut inner = self.inner.write();
        if let Some(entry) = inner.indicators.get(key) {
            if entry.expired(now) {
                inner.indicators.remove(key);
            } else {
                return Some(inner.indicators[key].value.clone());
            }
        }
        None
    }

    pub fn has_indicator(&self, key: &str) -> bool {
        self.get_indicator(key).is_some()
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn clear_expired_indicators(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write();
        let before = inner.indicators.len();
        inner.indicators.retain(|_, v| !v.expired(now));
        before - inner.indicators.len()
    }

    pub fn indicator_count(&self) -> usize {
        self.inner.read().indicators.len()
    }

    pub fn indicator_capacity(&self) -> usize {
        self.max_indicators
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    /// Approximate memory footprint: ~80 bytes per candle plus the typed
    /// per-indicator estimate.
    pub fn size_bytes(&self) -> usize {
        let inner = self.inner.read();
        let candle_bytes: usize = inner
            .candles
            .values()
            .map(|s| s.len() * CANDLE_APPROX_BYTES)
            .sum();
        let indicator_bytes: usize = inner
            .indicators
            .values()
            .map(|v| v.value.approx_bytes())
            .sum();
        candle_bytes + indicator_bytes
    }

    pub fn stats(&self) -> RepositoryStats {
        let inner = self.inner.read();
        let candle_count: usize = inner.candles.values().map(Vec::len).sum();
        let indicator_bytes: usize = inner
            .indicators
            .values()
            .map(|v| v.value.approx_bytes())
            .sum();
        RepositoryStats {
            candle_series: inner.candles.len(),
            candle_count,
            indicator_count: inner.indicators.len(),
            size_bytes: candle_count * CANDLE_APPROX_BYTES + indicator_bytes,
        }
    }
}

impl std::fmt::Debug for MarketDataRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MarketDataRepository")
            .field("candle_series", &stats.candle_series)
            .field("candle_count", &stats.candle_count)
            .field("indicator_count", &stats.indicator_count)
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

    fn repo_with_clock(now_ms: i64) -> (MarketDataRepository, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now_ms));
        let repo = MarketDataRepository::new(clock.clone());
        (repo, clock)
    }

    fn candle(ts: i64, close: f64) -> Candle {
        Candle::new(ts, close, close + 1.0, close - 1.0, close, 10.0)
    }

    #[test]
    fn save_replaces_and_caps() {
        let (repo, _) = repo_with_clock(0);
        let candles: Vec<Candle> = (0..600).map(|i| candle(i * 60_000, 100.0 + i as f64)).collect();
        repo.save_candles("BTCUSDT", "1h", candles);

        let stored = repo.get_candles("BTCUSDT", "1h", None);
        assert_eq!(stored.len(), MAX_CANDLES_PER_TF);
        // Oldest 100 dropped.
        assert_eq!(stored[0].timestamp, 100 * 60_000);
        assert_eq!(stored.last().unwrap().timestamp, 599 * 60_000);
    }

    #[test]
    fn get_with_limit_returns_tail() {
        let (repo, _) = repo_with_clock(0);
        repo.save_candles(
            "BTCUSDT",
            "1h",
            (0..10).map(|i| candle(i, i as f64)).collect(),
        );
        let tail = repo.get_candles("BTCUSDT", "1h", Some(3));
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].timestamp, 7);

        let all = repo.get_candles("BTCUSDT", "1h", None);
        assert_eq!(&all[7..], &tail[..]);
    }

    #[test]
    fn get_since_filters_by_timestamp() {
        let (repo, _) = repo_with_clock(0);
        repo.save_candles(
            "BTCUSDT",
            "1h",
            (0..5).map(|i| candle(i * 100, i as f64)).collect(),
        );
        let since = repo.get_candles_since("BTCUSDT", "1h", 200);
        assert_eq!(since.len(), 3);
        assert!(since.iter().all(|c| c.timestamp >= 200));
    }

    #[test]
    fn latest_returns_last_or_none() {
        let (repo, _) = repo_with_clock(0);
        assert!(repo.latest_candle("BTCUSDT", "1h").is_none());

        repo.save_candles(
            "BTCUSDT",
            "1h",
            (0..3).map(|i| candle(i, i as f64)).collect(),
        );
        assert_eq!(repo.latest_candle("BTCUSDT", "1h").unwrap().timestamp, 2);
    }

    #[test]
    fn append_replaces_same_timestamp_and_drops_stale() {
        let (repo, _) = repo_with_clock(0);
        repo.append_candle("BTCUSDT", "1h", candle(100, 1.0));
        repo.append_candle("BTCUSDT", "1h", candle(100, 2.0));
        repo.append_candle("BTCUSDT", "1h", candle(50, 3.0)); // stale — ignored
        repo.append_candle("BTCUSDT", "1h", candle(200, 4.0));

        let stored = repo.get_candles("BTCUSDT", "1h", None);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].close, 2.0);
        assert_eq!(stored[1].close, 4.0);
    }

    #[test]
    fn indicator_ttl_expiry_is_a_single_step() {
        let (repo, clock) = repo_with_clock(1_000);
        repo.cache_indicator("RSI-14-1h@0", IndicatorValue::Scalar(42.0), Some(60_000));

        clock.set(61_000); // now - created_at == ttl — still readable
        assert_eq!(
            repo.get_indicator("RSI-14-1h@0"),
            Some(IndicatorValue::Scalar(42.0))
        );

        clock.set(61_001); // past the TTL — gone, and deleted on read
        assert!(repo.get_indicator("RSI-14-1h@0").is_none());
        assert_eq!(repo.indicator_count(), 0);
    }

    #[test]
    fn indicator_eviction_drops_oldest_insertion() {
        let clock = Arc::new(ManualClock::new(0));
        let repo = MarketDataRepository::with_capacity(clock.clone(), 500, 3);

        repo.cache_indicator("a", IndicatorValue::Scalar(1.0), Some(i64::MAX / 2));
        clock.advance(1);
        repo.cache_indicator("b", IndicatorValue::Scalar(2.0), Some(i64::MAX / 2));
        clock.advance(1);
        repo.cache_indicator("c", IndicatorValue::Scalar(3.0), Some(i64::MAX / 2));
        clock.advance(1);

        // Cache full; inserting a new key evicts "a".
        repo.cache_indicator("d", IndicatorValue::Scalar(4.0), Some(i64::MAX / 2));
        assert!(repo.get_indicator("a").is_none());
        assert!(repo.has_indicator("b"));
        assert!(repo.has_indicator("d"));

        // Re-inserting an existing key does not evict.
        repo.cache_indicator("b", IndicatorValue::Scalar(20.0), Some(i64::MAX / 2));
        assert_eq!(repo.indicator_count(), 3);
    }

    #[test]
    fn clear_expired_returns_count() {
        let (repo, clock) = repo_with_clock(0);
        repo.cache_indicator("short", IndicatorValue::Scalar(1.0), Some(10));
        repo.cache_indicator("long", IndicatorValue::Scalar(2.0), Some(1_000_000));

        clock.set(500);
        assert_eq!(repo.clear_expired_indicators(), 1);
        assert_eq!(repo.indicator_count(), 1);
        assert!(repo.has_indicator("long"));
    }

    #[test]
    fn stats_approximate_bytes() {
        let (repo, _) = repo_with_clock(0);
        repo.save_candles(
            "BTCUSDT",
            "1h",
            (0..10).map(|i| candle(i, i as f64)).collect(),
        );
        repo.cache_indicator("x", IndicatorValue::Scalar(1.0), None);
        repo.cache_indicator(
            "bands",
            IndicatorValue::Bands {
                upper: 1.0,
                middle: 0.5,
                lower: 0.0,
            },
            None,
        );

        let stats = repo.stats();
        assert_eq!(stats.candle_series, 1);
        assert_eq!(stats.candle_count, 10);
        assert_eq!(stats.indicator_count, 2);
        assert_eq!(stats.size_bytes, 10 * 80 + 16 + 32);
        assert_eq!(stats.size_bytes, repo.size_bytes());
    }

    #[test]
    fn orderbook_keeps_only_latest() {
        use crate::types::BookLevel;
        let (repo, _) = repo_with_clock(0);
        assert!(repo.latest_orderbook().is_none());

        for ts in [1, 2, 3] {
            repo.save_orderbook(OrderBook {
                timestamp: ts,
                bids: vec![BookLevel {
                    price: 99.0,
                    size: 1.0,
                }],
                asks: vec![BookLevel {
                    price: 101.0,
                    size: 1.0,
                }],
            });
        }
        assert_eq!(repo.latest_orderbook().unwrap().timestamp, 3);
    }

    #[test]
    fn typed_values_roundtrip() {
        let (repo, _) = repo_with_clock(0);
        repo.cache_indicator(
            "series",
            IndicatorValue::Series(vec![1.0, 2.0, 3.0]),
            None,
        );
        match repo.get_indicator("series") {
            Some(IndicatorValue::Series(v)) => assert_eq!(v, vec![1.0, 2.0, 3.0]),
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
