// =============================================================================
// RSI Reversal — oversold / overbought mean-reversion producer
// =============================================================================

use crate::analyzers::{Analyzer, AnalyzerError, AnalyzerParams, Signal};
use crate::indicators::rsi::current_rsi;
use crate::types::{Candle, Direction};

pub struct RsiReversal {
    period: usize,
    oversold: f64,
    overbought: f64,
}

impl RsiReversal {
    pub fn new(params: &AnalyzerParams) -> Self {
        Self {
            period: params.get_usize("period", 14),
            oversold: params.get_f64("oversold", 30.0),
            overbought: params.get_f64("overbought", 70.0),
        }
    }
}

impl Analyzer for RsiReversal {
    fn name(&self) -> &'static str {
        "rsi_reversal"
    }

    fn analyze(&self, candles: &[Candle]) -> Result<Signal, AnalyzerError> {
        if candles.len() < self.period + 1 {
            return Err(AnalyzerError::InsufficientData {
                needed: self.period + 1,
                got: candles.len(),
            });
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let rsi = current_rsi(&closes, self.period)
            .ok_or_else(|| AnalyzerError::Computation("RSI produced no value".into()))?;

        let signal = if rsi < self.oversold {
            // Deeper oversold — stronger long conviction.
            let confidence = ((self.oversold - rsi) / self.oversold * 100.0).min(100.0);
            Signal::raw(
                Direction::Long,
                confidence,
                format!("RSI({}) {:.1} oversold (< {:.0})", self.period, rsi, self.oversold),
            )
        } else if rsi > self.overbought {
            let span = 100.0 - self.overbought;
            let confidence = ((rsi - self.overbought) / span * 100.0).min(100.0);
            Signal::raw(
                Direction::Short,
                confidence,
                format!(
                    "RSI({}) {:.1} overbought (> {:.0})",
                    self.period, rsi, self.overbought
                ),
            )
        } else {
            Signal::hold(format!("RSI({}) {:.1} neutral", self.period, rsi))
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
    fn falling_market_goes_long() {
        let closes: Vec<f64> = (1..=40).rev().map(|x| x as f64).collect();
        let analyzer = RsiReversal::new(&AnalyzerParams::default());
        let signal = analyzer.analyze(&candles_from_closes(&closes)).unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.confidence > 50.0);
        assert!(signal.reason.contains("oversold"));
    }

    #[test]
    fn rising_market_goes_short() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        let analyzer = RsiReversal::new(&AnalyzerParams::default());
        let signal = analyzer.analyze(&candles_from_closes(&closes)).unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.confidence > 50.0);
    }

    #[test]
    fn flat_market_holds() {
        let closes = vec![100.0; 40];
        let analyzer = RsiReversal::new(&AnalyzerParams::default());
        let signal = analyzer.analyze(&candles_from_closes(&closes)).unwrap();
        assert_eq!(signal.direction, Direction::Hold);
    }

    #[test]
    fn insufficient_data_is_an_error() {
        let analyzer = RsiReversal::new(&AnalyzerParams::default());
        let err = analyzer
            .analyze(&candles_from_closes(&[1.0, 2.0, 3.0]))
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::InsufficientData { .. }));
    }
}
