// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction proposed by a signal producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    Hold,
}

impl Direction {
    /// Convert to a position side. `Hold` carries no side.
    pub fn as_side(self) -> Option<Side> {
        match self {
            Self::Long => Some(Side::Long),
            Self::Short => Some(Side::Short),
            Self::Hold => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Side of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn is_long(self) -> bool {
        matches!(self, Self::Long)
    }

    /// +1.0 for longs, -1.0 for shorts. Used in PnL arithmetic.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Higher-timeframe trend bias, authoritative for entry gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendBias {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for TrendBias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Semantic timeframe roles. PRIMARY is the decision timeframe, ENTRY the
/// refinement timeframe; HTF1/HTF2 feed trend analysis, CONTEXT feeds
/// slow-moving context indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeframeRole {
    Primary,
    Entry,
    Htf1,
    Htf2,
    Context,
}

impl TimeframeRole {
    /// All roles, in the order the candle provider initialises them.
    pub const ALL: [TimeframeRole; 5] = [
        TimeframeRole::Primary,
        TimeframeRole::Entry,
        TimeframeRole::Htf1,
        TimeframeRole::Htf2,
        TimeframeRole::Context,
    ];
}

impl std::fmt::Display for TimeframeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "PRIMARY"),
            Self::Entry => write!(f, "ENTRY"),
            Self::Htf1 => write!(f, "HTF1"),
            Self::Htf2 => write!(f, "HTF2"),
            Self::Context => write!(f, "CONTEXT"),
        }
    }
}

/// A single OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in milliseconds since the UNIX epoch.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Absolute body size (|close - open|).
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    /// True when the candle closed above its open.
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// A single order book snapshot. Bids are ordered descending by price, asks
/// ascending; only the latest snapshot is retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub timestamp: i64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Depth imbalance in [-1, +1]; positive means bid-heavy.
    pub fn imbalance(&self) -> f64 {
        let bid_depth: f64 = self.bids.iter().map(|l| l.size).sum();
        let ask_depth: f64 = self.asks.iter().map(|l| l.size).sum();
        let total = bid_depth + ask_depth;
        if total > 0.0 {
            (bid_depth - ask_depth) / total
        } else {
            0.0
        }
    }

    /// Mid-price spread in basis points.
    pub fn spread_bps(&self) -> Option<f64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let mid = (bid + ask) / 2.0;
        if mid > 0.0 {
            Some(((ask - bid) / mid) * 10_000.0)
        } else {
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_to_side() {
        assert_eq!(Direction::Long.as_side(), Some(Side::Long));
        assert_eq!(Direction::Short.as_side(), Some(Side::Short));
        assert_eq!(Direction::Hold.as_side(), None);
    }

    #[test]
    fn side_sign() {
        assert_eq!(Side::Long.sign(), 1.0);
        assert_eq!(Side::Short.sign(), -1.0);
    }

    #[test]
    fn orderbook_imbalance_bid_heavy() {
        let ob = OrderBook {
            timestamp: 0,
            bids: vec![BookLevel {
                price: 99.0,
                size: 30.0,
            }],
            asks: vec![BookLevel {
                price: 101.0,
                size: 10.0,
            }],
        };
        assert!((ob.imbalance() - 0.5).abs() < f64::EPSILON);
        assert_eq!(ob.best_bid(), Some(99.0));
        assert_eq!(ob.best_ask(), Some(101.0));
    }

    #[test]
    fn orderbook_spread_bps() {
        let ob = OrderBook {
            timestamp: 0,
            bids: vec![BookLevel {
                price: 99.5,
                size: 1.0,
            }],
            asks: vec![BookLevel {
                price: 100.5,
                size: 1.0,
            }],
        };
        let bps = ob.spread_bps().unwrap();
        assert!((bps - 100.0).abs() < 1e-9);
    }

    #[test]
    fn candle_body() {
        let c = Candle::new(0, 100.0, 103.0, 99.0, 102.0, 10.0);
        assert!((c.body() - 2.0).abs() < f64::EPSILON);
        assert!(c.is_bullish());
    }
}
