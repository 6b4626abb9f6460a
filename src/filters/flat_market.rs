// =============================================================================
// Flat Market Filter — veto entries when volatility has dried up
// =============================================================================
//
// ATR as a percent of price below the threshold means stops and targets sit
// inside the noise floor. Insufficient candles pass (data problems are the
// candle provider's concern, not an entry veto).
// =============================================================================

use crate::filters::{EntryFilter, FilterContext, FilterVerdict};
use crate::indicators::atr::calculate_atr_percent;

const ATR_PERIOD: usize = 14;

pub struct FlatMarketFilter {
    min_atr_percent: f64,
}

impl FlatMarketFilter {
    pub fn new(min_atr_percent: f64) -> Self {
        Self { min_atr_percent }
    }
}

impl EntryFilter for FlatMarketFilter {
    fn name(&self) -> &'static str {
        "flat_market"
    }

    fn check(&self, ctx: &FilterContext<'_>) -> FilterVerdict {
        let Some(atr_percent) = calculate_atr_percent(ctx.primary_candles, ATR_PERIOD) else {
            return FilterVerdict::pass();
        };

        if atr_percent < self.min_atr_percent {
            FilterVerdict::veto(format!(
                "ATR {:.3}% below {:.3}% floor — flat market",
                atr_percent, self.min_atr_percent
            ))
        } else {
            FilterVerdict::pass()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::tests::{long_signal, volatile_candles};
    use crate::trend::TrendAnalysis;
    use crate::types::Candle;

    fn flat_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle::new(i as i64 * 60_000, 100.0, 100.01, 99.99, 100.0, 10.0))
            .collect()
    }

    #[test]
    fn dead_market_vetoes() {
        let signals = vec![long_signal()];
        let trend = TrendAnalysis::neutral("4h");
        let candles = flat_candles(30);
        let ctx = FilterContext {
            signals: &signals,
            trend: &trend,
            funding_rate: None,
            primary_candles: &candles,
            btc_bias: None,
        };
        let verdict = FlatMarketFilter::new(0.15).check(&ctx);
        assert!(!verdict.pass);
        assert!(verdict.reason.unwrap().contains("flat market"));
    }

    #[test]
    fn live_market_passes() {
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
        assert!(FlatMarketFilter::new(0.15).check(&ctx).pass);
    }

    #[test]
    fn too_few_candles_passes() {
        let signals = vec![long_signal()];
        let trend = TrendAnalysis::neutral("4h");
        let candles = flat_candles(5);
        let ctx = FilterContext {
            signals: &signals,
            trend: &trend,
            funding_rate: None,
            primary_candles: &candles,
            btc_bias: None,
        };
        assert!(FlatMarketFilter::new(0.15).check(&ctx).pass);
    }
}
