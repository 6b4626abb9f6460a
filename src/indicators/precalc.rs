// =============================================================================
// Pre-Calculator — warms indicator cache entries on candle close
// =============================================================================
//
// Each registered calculator declares the timeframe role it depends on. When a
// candle closes on that role, its value is recomputed from the repository and
// written through the cache under a deterministic key:
//
//   "<NAME>-<PERIOD>-<interval>@<candle_ts>"   e.g.  "RSI-14-1h@1700000000000"
//
// A failing calculator is logged and skipped; the close event never fails.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, warn};

use crate::indicators::cache::IndicatorCache;
use crate::repository::{IndicatorValue, MarketDataRepository};
use crate::types::{Candle, TimeframeRole};

/// Computation signature for one registered calculator.
pub type CalcFn = Box<dyn Fn(&[Candle]) -> Option<IndicatorValue> + Send + Sync>;

struct Registered {
    name: String,
    period: usize,
    role: TimeframeRole,
    interval: String,
    compute: CalcFn,
}

/// Warms indicator values for a role whenever one of its candles closes.
pub struct PreCalculator {
    repository: Arc<MarketDataRepository>,
    cache: Arc<IndicatorCache>,
    symbol: String,
    calculators: Vec<Registered>,
}

impl PreCalculator {
    pub fn new(
        repository: Arc<MarketDataRepository>,
        cache: Arc<IndicatorCache>,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            cache,
            symbol: symbol.into(),
            calculators: Vec::new(),
        }
    }

    /// Register a calculator bound to a timeframe role.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        period: usize,
        role: TimeframeRole,
        interval: impl Into<String>,
        compute: CalcFn,
    ) {
        self.calculators.push(Registered {
            name: name.into(),
            period,
            role,
            interval: interval.into(),
            compute,
        });
    }

    /// Deterministic cache key for a calculator at a candle close.
    pub fn cache_key(name: &str, period: usize, interval: &str, candle_ts: i64) -> String {
        format!("{name}-{period}-{interval}@{candle_ts}")
    }

    /// Recompute every calculator depending on `role` for the candle that
    /// closed at `candle_ts`. Per-calculator failures are logged and skipped.
    pub fn on_candle_closed(&self, role: TimeframeRole, candle_ts: i64) -> usize {
        let mut warmed = 0;

        for calc in self.calculators.iter().filter(|c| c.role == role) {
            let candles = self
                .repository
                .get_candles(&self.symbol, &calc.interval, None);

            if candles.is_empty() {
                debug!(
                    name = %calc.name,
                    role = %role,
                    "pre-calc skipped — no candles in repository"
                );
                continue;
            }

            match (calc.compute)(&candles) {
                Some(value) => {
                    let key = Self::cache_key(&calc.name, calc.period, &calc.interval, candle_ts);
                    self.cache.set(&key, value, None);
                    warmed += 1;
                }
                None => {
                    warn!(
                        name = %calc.name,
                        period = calc.period,
                        role = %role,
                        candles = candles.len(),
                        "pre-calc produced no value — skipped"
                    );
                }
            }
        }

        debug!(role = %role, warmed, "pre-calc pass complete");
        warmed
    }

    pub fn calculator_count(&self) -> usize {
        self.calculators.len()
    }
}

impl std::fmt::Debug for PreCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreCalculator")
            .field("symbol", &self.symbol)
            .field("calculators", &self.calculators.len())
            .finish()
    }
}
