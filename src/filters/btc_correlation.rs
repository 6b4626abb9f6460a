// =============================================================================
// BTC Correlation Filter — altcoins rarely swim against Bitcoin
// =============================================================================
//
// When a BTC bias is available, veto entries whose every signal opposes it.
// No BTC bias tracked (or trading BTC itself) passes.
// =============================================================================

use crate::filters::{EntryFilter, FilterContext, FilterVerdict};
use crate::types::{Direction, TrendBias};

pub struct BtcCorrelationFilter;

impl EntryFilter for BtcCorrelationFilter {
    fn name(&self) -> &'static str {
        "btc_correlation"
    }

    fn check(&self, ctx: &FilterContext<'_>) -> FilterVerdict {
        let Some(btc_bias) = ctx.btc_bias else {
            return FilterVerdict::pass();
        };
        if btc_bias == TrendBias::Neutral || ctx.signals.is_empty() {
            return FilterVerdict::pass();
        }

        let opposes = |direction: Direction| {
            matches!(
                (direction, btc_bias),
                (Direction::Long, TrendBias::Bearish) | (Direction::Short, TrendBias::Bullish)
            )
        };

        if ctx.signals.iter().all(|s| opposes(s.direction)) {
            FilterVerdict::veto(format!("all signals oppose the {btc_bias} BTC trend"))
        } else {
            FilterVerdict::pass()
        }
    }
}
