// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA; upper/lower = SMA ± k*σ; width = (upper - lower) /
// middle * 100.

/// Result of a Bollinger Band calculation over the trailing window.
#[derive(Debug, Clone)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

/// Bollinger Bands over the last `period` closes; `None` on insufficient or
/// degenerate input.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    width.is_finite().then_some(BollingerBands {
        upper,
        middle,
        lower,
        width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
    }

    #[test]
    fn bollinger_insufficient_data() {
        assert!(calculate_bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat_has_zero_width() {
        let bb = calculate_bollinger(&vec![100.0; 20], 20, 2.0).unwrap();
        assert!(bb.width.abs() < 1e-10);
    }
}
