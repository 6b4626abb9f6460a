// =============================================================================
// Higher-Timeframe Trend Analysis — the authoritative HTF bias
// =============================================================================
//
// Evaluates the EMA(9)/EMA(21) stack on the HTF1 timeframe. The resulting
// bias is the only input the snapshot gate and the trend-alignment filter
// trust; producer signals never feed it.
//
// A bullish bias restricts SHORT entries, a bearish bias restricts LONG
// entries, and a neutral bias restricts nothing.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::ema::calculate_ema;
use crate::types::{Candle, Direction, TrendBias};

/// Minimum candles needed for the EMA(21) stack.
const MIN_CANDLES: usize = 21;
/// EMA separation (percent of the slow EMA) below which the bias stays
/// neutral.
const NEUTRAL_SEPARATION_PCT: f64 = 0.05;

/// Snapshot of the higher-timeframe trend at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub bias: TrendBias,
    /// Normalised trend strength in [0, 1].
    pub strength: f64,
    /// Interval the analysis was computed on (e.g. "4h").
    pub timeframe: String,
    /// Entry directions incompatible with the bias.
    pub restricted_directions: Vec<Direction>,
}

impl TrendAnalysis {
    /// A neutral analysis for startup and degraded operation.
    pub fn neutral(timeframe: impl Into<String>) -> Self {
        Self {
            bias: TrendBias::Neutral,
            strength: 0.0,
            timeframe: timeframe.into(),
            restricted_directions: Vec::new(),
        }
    }

    pub fn restricts(&self, direction: Direction) -> bool {
        self.restricted_directions.contains(&direction)
    }
}

/// Analyse the HTF trend from candles (oldest first) on `timeframe`.
///
/// Falls back to a neutral analysis when there is not enough data or the EMA
/// separation is inside the neutral band.
pub fn analyze_trend(candles: &[Candle], timeframe: &str) -> TrendAnalysis {
    if candles.len() < MIN_CANDLES {
        debug!(
            timeframe,
            candles = candles.len(),
            needed = MIN_CANDLES,
            "trend analysis: insufficient data — neutral"
        );
        return TrendAnalysis::neutral(timeframe);
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let ema_fast = calculate_ema(&closes, 9);
    let ema_slow = calculate_ema(&closes, 21);

    let (Some(&fast), Some(&slow)) = (ema_fast.last(), ema_slow.last()) else {
        return TrendAnalysis::neutral(timeframe);
    };

    if slow.abs() <= f64::EPSILON {
        return TrendAnalysis::neutral(timeframe);
    }

    let separation_pct = ((fast - slow) / slow) * 100.0;
    if separation_pct.abs() < NEUTRAL_SEPARATION_PCT {
        debug!(
            timeframe,
            separation = format!("{separation_pct:.4}%"),
            "trend analysis: separation inside neutral band"
        );
        return TrendAnalysis::neutral(timeframe);
    }

    // Saturate strength at 2% separation.
    let strength = (separation_pct.abs() / 2.0).min(1.0);

    let (bias, restricted) = if separation_pct > 0.0 {
        (TrendBias::Bullish, vec![Direction::Short])
    } else {
        (TrendBias::Bearish, vec![Direction::Long])
    };

    debug!(
        timeframe,
        bias = %bias,
        strength = format!("{strength:.3}"),
        separation = format!("{separation_pct:.3}%"),
        "trend analysis complete"
    );

    TrendAnalysis {
        bias,
        strength,
        timeframe: timeframe.to_string(),
        restricted_directions: restricted,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new(i as i64, c, c + 0.5, c - 0.5, c, 10.0))
            .collect()
    }

    #[test]
    fn rising_series_is_bullish_and_restricts_shorts() {
        let closes: Vec<f64> = (1..=100).map(|x| 100.0 + x as f64).collect();
        let trend = analyze_trend(&candles_from_closes(&closes), "4h");
        assert_eq!(trend.bias, TrendBias::Bullish);
        assert!(trend.strength > 0.0);
        assert!(trend.restricts(Direction::Short));
        assert!(!trend.restricts(Direction::Long));
    }

    #[test]
    fn falling_series_is_bearish_and_restricts_longs() {
        let closes: Vec<f64> = (1..=100).rev().map(|x| 100.0 + x as f64).collect();
        let trend = analyze_trend(&candles_from_closes(&closes), "4h");
        assert_eq!(trend.bias, TrendBias::Bearish);
        assert!(trend.restricts(Direction::Long));
    }

    #[test]
    fn flat_series_is_neutral_with_no_restrictions() {
        let closes = vec![100.0; 100];
        let trend = analyze_trend(&candles_from_closes(&closes), "4h");
        assert_eq!(trend.bias, TrendBias::Neutral);
        assert!(trend.restricted_directions.is_empty());
    }

    #[test]
    fn insufficient_data_is_neutral() {
        let closes = vec![100.0, 101.0, 102.0];
        let trend = analyze_trend(&candles_from_closes(&closes), "4h");
        assert_eq!(trend.bias, TrendBias::Neutral);
        assert_eq!(trend.timeframe, "4h");
    }

    #[test]
    fn strength_saturates_at_one() {
        let closes: Vec<f64> = (1..=100).map(|x| (x * x) as f64).collect();
        let trend = analyze_trend(&candles_from_closes(&closes), "4h");
        assert!(trend.strength <= 1.0);
    }
}
