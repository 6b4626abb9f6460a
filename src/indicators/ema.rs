// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// multiplier = 2 / (period + 1)
// EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first value is seeded with the SMA of the first `period` closes.
// =============================================================================

/// EMA series for `closes` and `period`, one element per close starting at
/// index `period - 1`. Empty when the input is too short or the period is
/// zero; a non-finite intermediate value truncates the series.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }

    result
}

/// Most recent EMA value.
pub fn current_ema(closes: &[f64], period: usize) -> Option<f64> {
    calculate_ema(closes, period).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_rejects_degenerate_input() {
        assert!(calculate_ema(&[], 5).is_empty());
        assert!(calculate_ema(&[1.0, 2.0, 3.0], 0).is_empty());
        assert!(calculate_ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn ema_seed_is_sma() {
        let ema = calculate_ema(&[2.0, 4.0, 6.0], 3);
        assert_eq!(ema.len(), 1);
        assert!((ema[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 5);
        assert_eq!(ema.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        for (i, &c) in closes[5..].iter().enumerate() {
            expected = c * mult + expected * (1.0 - mult);
            assert!((ema[i + 1] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn ema_truncates_on_nan() {
        let ema = calculate_ema(&[1.0, 2.0, 3.0, f64::NAN, 5.0], 3);
        assert_eq!(ema.len(), 1);
    }

    #[test]
    fn current_ema_tracks_rising_series() {
        let closes: Vec<f64> = (1..=50).map(|x| x as f64).collect();
        let last = current_ema(&closes, 9).unwrap();
        assert!(last > 40.0 && last < 50.0);
    }
}
