// =============================================================================
// Momentum — rate-of-change producer
// =============================================================================

use crate::analyzers::{Analyzer, AnalyzerError, AnalyzerParams, Signal};
use crate::indicators::roc::current_roc;
use crate::types::{Candle, Direction};

pub struct Momentum {
    period: usize,
    /// Minimum |ROC| (percent) before the producer takes a side.
    min_roc: f64,
    /// |ROC| at which confidence saturates at 100.
    saturation_roc: f64,
}

impl Momentum {
    pub fn new(params: &AnalyzerParams) -> Self {
        Self {
            period: params.get_usize("period", 14),
            min_roc: params.get_f64("min_roc", 0.5),
            saturation_roc: params.get_f64("saturation_roc", 5.0),
        }
    }
}

impl Analyzer for Momentum {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn analyze(&self, candles: &[Candle]) -> Result<Signal, AnalyzerError> {
        if candles.len() <= self.period {
            return Err(AnalyzerError::InsufficientData {
                needed: self.period + 1,
                got: candles.len(),
            });
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let roc = current_roc(&closes, self.period)
            .ok_or_else(|| AnalyzerError::Computation("ROC produced no value".into()))?;

        if roc.abs() < self.min_roc {
            return Ok(Signal::hold(format!(
                "ROC({}) {:.2}% below {:.2}% threshold",
                self.period, roc, self.min_roc
            )));
        }

        let confidence = (roc.abs() / self.saturation_roc * 100.0).min(100.0);
        let direction = if roc > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };

        Ok(Signal::raw(
            direction,
            confidence,
            format!("ROC({}) {:.2}% momentum", self.period, roc),
        ))
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
    fn strong_upward_momentum_is_long() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let analyzer = Momentum::new(&AnalyzerParams::default());
        let signal = analyzer.analyze(&candles_from_closes(&closes)).unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.confidence > 50.0);
    }

    #[test]
    fn weak_momentum_holds() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64) * 0.001).collect();
        let analyzer = Momentum::new(&AnalyzerParams::default());
        let signal = analyzer.analyze(&candles_from_closes(&closes)).unwrap();
        assert_eq!(signal.direction, Direction::Hold);
    }

    #[test]
    fn downward_momentum_is_short() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 * 0.99f64.powi(i)).collect();
        let analyzer = Momentum::new(&AnalyzerParams::default());
        let signal = analyzer.analyze(&candles_from_closes(&closes)).unwrap();
        assert_eq!(signal.direction, Direction::Short);
    }
}
