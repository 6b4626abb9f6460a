// =============================================================================
// Indicator Cache — hit/miss accounting over the repository store
// =============================================================================
//
// Storage (TTL, capacity, eviction) lives in the market-data repository; this
// layer adds lock-free hit/miss counters for the stats endpoint.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::repository::{IndicatorValue, MarketDataRepository};

/// Cache access statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate_percent: f64,
    pub size: usize,
    pub capacity: usize,
}

/// Typed indicator cache shared by the pre-calculator and the analyzers.
pub struct IndicatorCache {
    repository: Arc<MarketDataRepository>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl IndicatorCache {
    pub fn new(repository: Arc<MarketDataRepository>) -> Self {
        Self {
            repository,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Store a value; `ttl_ms = None` uses the repository default (60 s).
    pub fn set(&self, key: &str, value: IndicatorValue, ttl_ms: Option<i64>) {
        self.repository.cache_indicator(key, value, ttl_ms);
    }

    /// Read a value, counting the hit or miss.
    pub fn get(&self, key: &str) -> Option<IndicatorValue> {
        match self.repository.get_indicator(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate_percent = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            total_requests: total,
            hit_rate_percent,
            size: self.repository.indicator_count(),
            capacity: self.repository.indicator_capacity(),
        }
    }
}

impl std::fmt::Debug for IndicatorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("IndicatorCache")
            .field("hits", &stats.hits)
            .field("misses", &stats.misses)
            .field("size", &stats.size)
            .finish()
    }
}
