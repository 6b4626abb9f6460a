// =============================================================================
// Filter Orchestrator — pre-entry veto chain
// =============================================================================
//
// A named chain of veto filters applied in declared order; the first veto
// short-circuits the rest. Filters answer pass/veto over the collected
// signals and ambient market context; they never mutate anything.
// =============================================================================

pub mod btc_correlation;
pub mod flat_market;
pub mod funding;
pub mod trend_alignment;

use tracing::{debug, info};

use crate::analyzers::Signal;
use crate::config::FiltersConfig;
use crate::trend::TrendAnalysis;
use crate::types::{Candle, TrendBias};

/// Ambient market context handed to every filter.
pub struct FilterContext<'a> {
    pub signals: &'a [Signal],
    pub trend: &'a TrendAnalysis,
    /// Latest funding rate as a decimal; `None` when unavailable (degraded).
    pub funding_rate: Option<f64>,
    /// PRIMARY-timeframe candles, oldest first.
    pub primary_candles: &'a [Candle],
    /// BTC trend bias for correlation gating; `None` when not tracked.
    pub btc_bias: Option<TrendBias>,
}

/// One filter's answer.
#[derive(Debug, Clone)]
pub struct FilterVerdict {
    pub pass: bool,
    pub reason: Option<String>,
}

impl FilterVerdict {
    pub fn pass() -> Self {
        Self {
            pass: true,
            reason: None,
        }
    }

    pub fn veto(reason: impl Into<String>) -> Self {
        Self {
            pass: false,
            reason: Some(reason.into()),
        }
    }
}

/// A pre-entry veto filter.
pub trait EntryFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &FilterContext<'_>) -> FilterVerdict;
}

/// The veto a chain run ended on.
#[derive(Debug, Clone, PartialEq)]
pub struct Veto {
    pub filter: &'static str,
    pub reason: String,
}

/// Ordered filter chain built from strategy config.
pub struct FilterChain {
    filters: Vec<Box<dyn EntryFilter>>,
}

impl FilterChain {
    /// Build the chain in declared order, honouring per-filter toggles.
    pub fn from_config(config: &FiltersConfig) -> Self {
        let mut filters: Vec<Box<dyn EntryFilter>> = Vec::new();

        if config.trend_alignment {
            filters.push(Box::new(trend_alignment::TrendAlignmentFilter));
        }
        if config.funding_rate {
            filters.push(Box::new(funding::FundingRateFilter::new(
                config.max_abs_funding_rate,
            )));
        }
        if config.flat_market {
            filters.push(Box::new(flat_market::FlatMarketFilter::new(
                config.min_atr_percent,
            )));
        }
        if config.btc_correlation {
            filters.push(Box::new(btc_correlation::BtcCorrelationFilter));
        }

        info!(count = filters.len(), "filter chain built");
        Self { filters }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Apply filters in order; the first veto wins. `None` means all passed.
    pub fn apply(&self, ctx: &FilterContext<'_>) -> Option<Veto> {
        for filter in &self.filters {
            let verdict = filter.check(ctx);
            if !verdict.pass {
                let reason = verdict.reason.unwrap_or_else(|| "vetoed".to_string());
                info!(filter = filter.name(), reason = %reason, "entry vetoed");
                return Some(Veto {
                    filter: filter.name(),
                    reason,
                });
            }
            debug!(filter = filter.name(), "filter passed");
        }
        None
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.filters.iter().map(|x| x.name()).collect();
        f.debug_struct("FilterChain").field("filters", &names).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Direction;

    pub(crate) fn long_signal() -> Signal {
        let mut signal = Signal::raw(Direction::Long, 80.0, "test");
        signal.price = 100.0;
        signal
    }

    pub(crate) fn volatile_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i % 7) as f64;
                Candle::new(i as i64 * 60_000, base, base + 2.0, base - 2.0, base + 0.5, 10.0)
            })
            .collect()
    }

    struct AlwaysVeto;
    impl EntryFilter for AlwaysVeto {
        fn name(&self) -> &'static str {
            "always_veto"
        }
        fn check(&self, _ctx: &FilterContext<'_>) -> FilterVerdict {
            FilterVerdict::veto("nope")
        }
    }

    struct Panicking;
    impl EntryFilter for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn check(&self, _ctx: &FilterContext<'_>) -> FilterVerdict {
            panic!("must never be reached after a veto")
        }
    }

    #[test]
    fn first_veto_short_circuits() {
        let chain = FilterChain {
            filters: vec![Box::new(AlwaysVeto), Box::new(Panicking)],
        };
        let signals = vec![long_signal()];
        let trend = TrendAnalysis::neutral("4h");
        let candles = volatile_candles(30);
        let ctx = FilterContext {
            signals: &signals,
            trend: &trend,
            funding_rate: None,
            primary_candles: &candles,
            btc_bias: None,
        };

        let veto = chain.apply(&ctx).unwrap();
        assert_eq!(veto.filter, "always_veto");
        assert_eq!(veto.reason, "nope");
    }

    #[test]
    fn default_chain_passes_healthy_context() {
        let chain = FilterChain::from_config(&FiltersConfig::default());
        assert_eq!(chain.len(), 3); // btc_correlation off by default

        let signals = vec![long_signal()];
        let trend = TrendAnalysis::neutral("4h");
        let candles = volatile_candles(30);
        let ctx = FilterContext {
            signals: &signals,
            trend: &trend,
            funding_rate: Some(0.0001),
            primary_candles: &candles,
            btc_bias: None,
        };
        assert!(chain.apply(&ctx).is_none());
    }

    #[test]
    fn toggles_shrink_the_chain() {
        let config = FiltersConfig {
            trend_alignment: false,
            funding_rate: false,
            flat_market: false,
            btc_correlation: false,
            ..Default::default()
        };
        let chain = FilterChain::from_config(&config);
        assert!(chain.is_empty());
    }
}
