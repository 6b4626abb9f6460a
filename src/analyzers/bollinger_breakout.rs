// =============================================================================
// Bollinger Breakout — band-penetration mean-reversion producer
// =============================================================================
//
// Close below the lower band argues for a long reversal, above the upper for
// a short. Confidence scales with penetration depth relative to band width.
// =============================================================================

use crate::analyzers::{Analyzer, AnalyzerError, AnalyzerParams, Signal};
use crate::indicators::bollinger::calculate_bollinger;
use crate::types::{Candle, Direction};

pub struct BollingerBreakout {
    period: usize,
    num_std: f64,
}

impl BollingerBreakout {
    pub fn new(params: &AnalyzerParams) -> Self {
        Self {
            period: params.get_usize("period", 20),
            num_std: params.get_f64("num_std", 2.0),
        }
    }
}

impl Analyzer for BollingerBreakout {
    fn name(&self) -> &'static str {
        "bollinger_breakout"
    }

    fn analyze(&self, candles: &[Candle]) -> Result<Signal, AnalyzerError> {
        if candles.len() < self.period {
            return Err(AnalyzerError::InsufficientData {
                needed: self.period,
                got: candles.len(),
            });
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let price = *closes.last().unwrap();

        let bands = calculate_bollinger(&closes, self.period, self.num_std)
            .ok_or_else(|| AnalyzerError::Computation("bands degenerate".into()))?;

        let band_span = bands.upper - bands.lower;
        if band_span <= f64::EPSILON {
            return Ok(Signal::hold("bands collapsed"));
        }

        let signal = if price < bands.lower {
            let depth = (bands.lower - price) / band_span;
            Signal::raw(
                Direction::Long,
                (50.0 + depth * 200.0).min(100.0),
                format!(
                    "close {:.2} under lower band {:.2} (width {:.2}%)",
                    price, bands.lower, bands.width
                ),
            )
        } else if price > bands.upper {
            let depth = (price - bands.upper) / band_span;
            Signal::raw(
                Direction::Short,
                (50.0 + depth * 200.0).min(100.0),
                format!(
                    "close {:.2} over upper band {:.2} (width {:.2}%)",
                    price, bands.upper, bands.width
                ),
            )
        } else {
            Signal::hold("close inside bands")
        };

        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new(i as i64 * 60_000, c, c + 0.5, c - 0.5, c, 10.0))
            .collect()
    }

    #[test]
    fn plunge_below_band_is_long() {
        let mut closes = vec![100.0; 25];
        // Mild noise so the bands have width, then a hard dump.
        for (i, c) in closes.iter_mut().enumerate() {
            *c += (i % 3) as f64 * 0.4;
        }
        *closes.last_mut().unwrap() = 90.0;

        let analyzer = BollingerBreakout::new(&AnalyzerParams::default());
        let signal = analyzer.analyze(&candles_from_closes(&closes)).unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.confidence >= 50.0);
    }

    #[test]
    fn spike_above_band_is_short() {
        let mut closes = vec![100.0; 25];
        for (i, c) in closes.iter_mut().enumerate() {
            *c += (i % 3) as f64 * 0.4;
        }
        *closes.last_mut().unwrap() = 110.0;

        let analyzer = BollingerBreakout::new(&AnalyzerParams::default());
        let signal = analyzer.analyze(&candles_from_closes(&closes)).unwrap();
        assert_eq!(signal.direction, Direction::Short);
    }

    #[test]
    fn inside_bands_holds() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + (i % 5) as f64 * 0.2).collect();
        let analyzer = BollingerBreakout::new(&AnalyzerParams::default());
        let signal = analyzer.analyze(&candles_from_closes(&closes)).unwrap();
        assert_eq!(signal.direction, Direction::Hold);
    }
}
