// =============================================================================
// EMA Trend — fast/mid/slow stack alignment producer
// =============================================================================
//
// Bullish when EMA(fast) > EMA(mid) > EMA(slow) and price rides above the
// fast EMA; bearish when fully inverted. Confidence grows with the
// fast/slow separation.
// =============================================================================

use crate::analyzers::{Analyzer, AnalyzerError, AnalyzerParams, Signal};
use crate::indicators::ema::current_ema;
use crate::types::{Candle, Direction};

pub struct EmaTrend {
    fast: usize,
    mid: usize,
    slow: usize,
}

impl EmaTrend {
    pub fn new(params: &AnalyzerParams) -> Self {
        Self {
            fast: params.get_usize("fast", 9),
            mid: params.get_usize("mid", 21),
            slow: params.get_usize("slow", 55),
        }
    }
}

impl Analyzer for EmaTrend {
    fn name(&self) -> &'static str {
        "ema_trend"
    }

    fn analyze(&self, candles: &[Candle]) -> Result<Signal, AnalyzerError> {
        if candles.len() < self.slow {
            return Err(AnalyzerError::InsufficientData {
                needed: self.slow,
                got: candles.len(),
            });
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let price = *closes.last().unwrap();

        let fast = current_ema(&closes, self.fast);
        let mid = current_ema(&closes, self.mid);
        let slow = current_ema(&closes, self.slow);

        let (Some(fast), Some(mid), Some(slow)) = (fast, mid, slow) else {
            return Err(AnalyzerError::Computation("EMA stack incomplete".into()));
        };

        let bullish = fast > mid && mid > slow && price > fast;
        let bearish = fast < mid && mid < slow && price < fast;

        let separation_pct = if slow.abs() > f64::EPSILON {
            ((fast - slow).abs() / slow) * 100.0
        } else {
            0.0
        };
        // 60 base for a clean stack, up to +40 for a wide separation.
        let confidence = (60.0 + separation_pct * 20.0).min(100.0);

        let signal = if bullish {
            Signal::raw(
                Direction::Long,
                confidence,
                format!(
                    "EMA stack bullish ({}/{}/{}), separation {:.2}%",
                    self.fast, self.mid, self.slow, separation_pct
                ),
            )
        } else if bearish {
            Signal::raw(
                Direction::Short,
                confidence,
                format!(
                    "EMA stack bearish ({}/{}/{}), separation {:.2}%",
                    self.fast, self.mid, self.slow, separation_pct
                ),
            )
        } else {
            Signal::hold("EMA stack mixed")
        };

        Ok(signal)
    }
}
