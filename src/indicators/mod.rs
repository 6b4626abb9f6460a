// =============================================================================
// Indicators Module
// =============================================================================
//
// Pure indicator math (each a pure function over candle/close slices) plus
// the typed cache layer and the candle-close pre-calculator.

pub mod atr;
pub mod bollinger;
pub mod cache;
pub mod ema;
pub mod precalc;
pub mod roc;
pub mod rsi;

pub use cache::{CacheStats, IndicatorCache};
pub use precalc::{CalcFn, PreCalculator};

use crate::repository::IndicatorValue;
use crate::types::Candle;

fn closes_of(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Pre-calculator entry: latest RSI as a scalar.
pub fn rsi_calculator(period: usize) -> CalcFn {
    Box::new(move |candles| {
        rsi::current_rsi(&closes_of(candles), period).map(IndicatorValue::Scalar)
    })
}

/// Pre-calculator entry: latest ATR as a scalar.
pub fn atr_calculator(period: usize) -> CalcFn {
    Box::new(move |candles| atr::calculate_atr(candles, period).map(IndicatorValue::Scalar))
}

/// Pre-calculator entry: latest EMA as a scalar.
pub fn ema_calculator(period: usize) -> CalcFn {
    Box::new(move |candles| {
        ema::current_ema(&closes_of(candles), period).map(IndicatorValue::Scalar)
    })
}
