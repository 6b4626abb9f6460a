// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Seed average gain / loss with the SMA of the first `period` deltas, then:
//   avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   RSI      = 100 - 100 / (1 + avg_gain / avg_loss)
// =============================================================================

/// RSI series for `closes` and `period`, one value per close starting at
/// index `period`. Empty when the input is too short or the period is zero.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut result = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_from_averages(avg_gain, avg_loss) {
        Some(first) => result.push(first),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_from_averages(avg_gain, avg_loss) {
            Some(rsi) => result.push(rsi),
            None => break,
        }
    }

    result
}

/// Most recent RSI value.
pub fn current_rsi(closes: &[f64], period: usize) -> Option<f64> {
    calculate_rsi(closes, period).last().copied()
}

/// No movement is neutral (50); all gains clamp to 100; all losses to 0.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    rsi.is_finite().then_some(rsi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_rejects_degenerate_input() {
        assert!(calculate_rsi(&[], 14).is_empty());
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 0).is_empty());
        let exactly_period: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(calculate_rsi(&exactly_period, 14).is_empty());
    }

    #[test]
    fn rsi_extremes() {
        let rising: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for v in calculate_rsi(&rising, 14) {
            assert!((v - 100.0).abs() < 1e-10);
        }

        let falling: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for v in calculate_rsi(&falling, 14) {
            assert!(v.abs() < 1e-10);
        }
    }

    #[test]
    fn rsi_flat_is_neutral() {
        let flat = vec![100.0; 30];
        for v in calculate_rsi(&flat, 14) {
            assert!((v - 50.0).abs() < 1e-10);
        }
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for v in calculate_rsi(&closes, 14) {
            assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn current_rsi_none_on_bad_input() {
        assert!(current_rsi(&[], 14).is_none());
    }
}
