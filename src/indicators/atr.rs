// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR seeds with the SMA of the first `period` TR values, then applies
// Wilder's smoothing:
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::types::Candle;

/// Most recent ATR value over `candles` (oldest first).
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// candles, or any intermediate value is non-finite.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(candles.len() - 1);
    for window in candles.windows(2) {
        let prev_close = window[0].close;
        let high = window[1].high;
        let low = window[1].low;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();
        tr_values.push(hl.max(hc).max(lc));
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    Some(atr)
}

/// ATR as a percentage of the latest close. Used by the flat-market filter.
pub fn calculate_atr_percent(candles: &[Candle], period: usize) -> Option<f64> {
    let atr = calculate_atr(candles, period)?;
    let last_close = candles.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, open, high, low, close, 100.0)
    }

    #[test]
    fn atr_rejects_degenerate_input() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&candles, 0).is_none());
        assert!(calculate_atr(&candles, 14).is_none());
    }

    #[test]
    fn atr_constant_range_converges() {
        let mut candles = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            candles.push(candle(base, base + 5.0, base - 5.0, base));
        }
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn atr_true_range_uses_prev_close_on_gap() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 95.0),
            candle(110.0, 115.0, 108.0, 112.0), // gap up: |115-95| = 20 > 7
            candle(112.0, 118.0, 110.0, 115.0),
            candle(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&candles, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_percent_scales_by_close() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let pct = calculate_atr_percent(&candles, 14).unwrap();
        assert!(pct > 0.0 && pct.is_finite());
    }

    #[test]
    fn atr_nan_returns_none() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, f64::NAN, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(calculate_atr(&candles, 3).is_none());
    }
}
