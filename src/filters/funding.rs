// =============================================================================
// Funding Rate Filter — veto entries into an overheated perp market
// =============================================================================
//
// Extreme funding in either direction means one side is overleveraged and
// liquidation cascades are likely. A missing rate (degraded market-data path)
// passes — funding is a refinement, not a prerequisite.
// =============================================================================

use crate::filters::{EntryFilter, FilterContext, FilterVerdict};

pub struct FundingRateFilter {
    /// Absolute decimal threshold (e.g. 0.0005 = 0.05%).
    max_abs_rate: f64,
}

impl FundingRateFilter {
    pub fn new(max_abs_rate: f64) -> Self {
        Self { max_abs_rate }
    }
}

impl EntryFilter for FundingRateFilter {
    fn name(&self) -> &'static str {
        "funding_rate"
    }

    fn check(&self, ctx: &FilterContext<'_>) -> FilterVerdict {
        let Some(rate) = ctx.funding_rate else {
            return FilterVerdict::pass();
        };

        if rate.abs() > self.max_abs_rate {
            FilterVerdict::veto(format!(
                "funding rate {:.4}% beyond ±{:.4}%",
                rate * 100.0,
                self.max_abs_rate * 100.0
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

    fn ctx_with_rate<'a>(
        signals: &'a [crate::analyzers::Signal],
        trend: &'a TrendAnalysis,
        candles: &'a [crate::types::Candle],
        rate: Option<f64>,
    ) -> FilterContext<'a> {
        FilterContext {
            signals,
            trend,
            funding_rate: rate,
            primary_candles: candles,
            btc_bias: None,
        }
    }

    #[test]
    fn extreme_positive_funding_vetoes() {
        let signals = vec![long_signal()];
        let trend = TrendAnalysis::neutral("4h");
        let candles = volatile_candles(10);
        let filter = FundingRateFilter::new(0.0005);

        let verdict = filter.check(&ctx_with_rate(&signals, &trend, &candles, Some(0.001)));
        assert!(!verdict.pass);
    }

    #[test]
    fn extreme_negative_funding_vetoes() {
        let signals = vec![long_signal()];
        let trend = TrendAnalysis::neutral("4h");
        let candles = volatile_candles(10);
        let filter = FundingRateFilter::new(0.0005);

        assert!(!filter
            .check(&ctx_with_rate(&signals, &trend, &candles, Some(-0.002)))
            .pass);
    }

    #[test]
    fn mild_or_missing_funding_passes() {
        let signals = vec![long_signal()];
        let trend = TrendAnalysis::neutral("4h");
        let candles = volatile_candles(10);
        let filter = FundingRateFilter::new(0.0005);

        assert!(filter
            .check(&ctx_with_rate(&signals, &trend, &candles, Some(0.0001)))
            .pass);
        assert!(filter
            .check(&ctx_with_rate(&signals, &trend, &candles, None))
            .pass);
    }
}
