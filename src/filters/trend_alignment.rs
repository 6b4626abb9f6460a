// =============================================================================
// Trend Alignment Filter — veto when every signal fights the HTF trend
// =============================================================================

use crate::filters::{EntryFilter, FilterContext, FilterVerdict};

pub struct TrendAlignmentFilter;

impl EntryFilter for TrendAlignmentFilter {
    fn name(&self) -> &'static str {
        "trend_alignment"
    }

    fn check(&self, ctx: &FilterContext<'_>) -> FilterVerdict {
        if ctx.signals.is_empty() {
            return FilterVerdict::pass();
        }

        let any_aligned = ctx
            .signals
            .iter()
            .any(|s| !ctx.trend.restricts(s.direction));

        if any_aligned {
            FilterVerdict::pass()
        } else {
            FilterVerdict::veto(format!(
                "all {} signals oppose the {} HTF bias",
                ctx.signals.len(),
                ctx.trend.bias
            ))
        }
    }
}
