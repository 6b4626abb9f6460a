// =============================================================================
// Volume Surge — breakout confirmation by abnormal volume
// =============================================================================
//
// A close with volume well above the trailing average confirms the candle's
// direction; anything else is a hold.
// =============================================================================

use crate::analyzers::{Analyzer, AnalyzerError, AnalyzerParams, Signal};
use crate::types::{Candle, Direction};

pub struct VolumeSurge {
    period: usize,
    /// Volume multiple over the trailing average that counts as a surge.
    surge_multiple: f64,
}

impl VolumeSurge {
    pub fn new(params: &AnalyzerParams) -> Self {
        Self {
            period: params.get_usize("period", 20),
            surge_multiple: params.get_f64("surge_multiple", 2.0),
        }
    }
}

impl Analyzer for VolumeSurge {
    fn name(&self) -> &'static str {
        "volume_surge"
    }

    fn analyze(&self, candles: &[Candle]) -> Result<Signal, AnalyzerError> {
        if candles.len() < self.period + 1 {
            return Err(AnalyzerError::InsufficientData {
                needed: self.period + 1,
                got: candles.len(),
            });
        }

        let last = candles.last().unwrap();
        let window = &candles[candles.len() - 1 - self.period..candles.len() - 1];
        let avg_volume = window.iter().map(|c| c.volume).sum::<f64>() / self.period as f64;

        if avg_volume <= 0.0 {
            return Ok(Signal::hold("no baseline volume"));
        }

        let ratio = last.volume / avg_volume;
        if ratio < self.surge_multiple {
            return Ok(Signal::hold(format!(
                "volume ratio {:.2} below {:.1}x",
                ratio, self.surge_multiple
            )));
        }

        // A surge on a doji confirms nothing.
        if last.body() < (last.high - last.low) * 0.3 {
            return Ok(Signal::hold("volume surge on indecisive candle"));
        }

        let direction = if last.is_bullish() {
            Direction::Long
        } else {
            Direction::Short
        };
        let confidence = (ratio / (self.surge_multiple * 2.0) * 100.0).min(100.0);

        Ok(Signal::raw(
            direction,
            confidence,
            format!("volume {:.1}x trailing average", ratio),
        ))
    }
}
