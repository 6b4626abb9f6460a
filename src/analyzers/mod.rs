// =============================================================================
// Signal Producers — analyzer trait, static registry, signal collection
// =============================================================================
//
// Each producer is a synchronous, CPU-bound capability over a candle slice.
// The registry is a static factory table keyed by name (no runtime code
// loading); instances are built once per session from strategy config, with
// parameters merged as: analyzer defaults < per-producer params.
//
// `collect_signals` never fails: a failing producer is logged as a warning
// and excluded. HOLD signals are dropped. Output order is unspecified.
// =============================================================================

pub mod bollinger_breakout;
pub mod ema_trend;
pub mod momentum;
pub mod rsi_reversal;
pub mod volume_surge;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{AnalyzerConfig, RiskManagementConfig};
use crate::indicators::atr::calculate_atr;
use crate::types::{Candle, Direction};

/// A directional signal from one producer. Confidence is 0–100 at producer
/// output; only the entry aggregator ever rescales it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    /// 0–100.
    pub confidence: f64,
    /// Producer tag (the analyzer's registry name).
    pub signal_type: String,
    /// Last close at collection time.
    pub price: f64,
    /// Proposed protective stop.
    pub stop_loss: f64,
    /// Proposed ladder take-profit prices, nearest first.
    pub take_profits: Vec<f64>,
    pub reason: String,
    /// Candle-close timestamp the signal was derived from, milliseconds.
    pub timestamp: i64,
    /// Aggregation weight in [0, 1].
    pub weight: f64,
    /// Tie-break priority; higher wins.
    pub priority: u8,
}

impl Signal {
    /// A producer-level signal before the registry attaches market context.
    pub fn raw(direction: Direction, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            direction,
            confidence: confidence.clamp(0.0, 100.0),
            signal_type: String::new(),
            price: 0.0,
            stop_loss: 0.0,
            take_profits: Vec::new(),
            reason: reason.into(),
            timestamp: 0,
            weight: 1.0,
            priority: 0,
        }
    }

    pub fn hold(reason: impl Into<String>) -> Self {
        Self::raw(Direction::Hold, 0.0, reason)
    }
}

/// Producer failure. Never escapes the registry.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("insufficient data: need {needed} candles, have {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("computation failed: {0}")]
    Computation(String),
}

/// A signal producer.
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce a signal from candles (oldest first). `Direction::Hold` means
    /// "nothing to say"; errors are treated the same after a warning.
    fn analyze(&self, candles: &[Candle]) -> Result<Signal, AnalyzerError>;
}

/// Merged parameter view handed to producer constructors.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerParams {
    values: HashMap<String, serde_json::Value>,
}

impl AnalyzerParams {
    /// Merge defaults with per-producer overrides (later wins).
    pub fn merged(
        defaults: &HashMap<String, serde_json::Value>,
        overrides: &HashMap<String, serde_json::Value>,
    ) -> Self {
        let mut values = defaults.clone();
        for (k, v) in overrides {
            values.insert(k.clone(), v.clone());
        }
        Self { values }
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.values
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.values.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
    }
}

/// Factory table entry: builds one producer from merged params.
type Factory = fn(&AnalyzerParams) -> Box<dyn Analyzer>;

/// The static factory table. Adding a producer means adding a row here.
const FACTORIES: &[(&str, Factory)] = &[
    ("rsi_reversal", |p| Box::new(rsi_reversal::RsiReversal::new(p))),
    ("ema_trend", |p| Box::new(ema_trend::EmaTrend::new(p))),
    ("momentum", |p| Box::new(momentum::Momentum::new(p))),
    ("bollinger_breakout", |p| {
        Box::new(bollinger_breakout::BollingerBreakout::new(p))
    }),
    ("volume_surge", |p| Box::new(volume_surge::VolumeSurge::new(p))),
];

struct Loaded {
    analyzer: Box<dyn Analyzer>,
    weight: f64,
    priority: u8,
    min_confidence: f64,
}

/// The set of producers loaded for this session.
pub struct AnalyzerRegistry {
    loaded: Vec<Loaded>,
    risk_management: RiskManagementConfig,
}

impl AnalyzerRegistry {
    /// Build producers from strategy config. Unknown names are logged and
    /// skipped; disabled entries are not constructed.
    pub fn from_config(
        analyzers: &[AnalyzerConfig],
        defaults: &HashMap<String, serde_json::Value>,
        risk_management: RiskManagementConfig,
    ) -> Self {
        let mut loaded = Vec::new();

        for entry in analyzers.iter().filter(|a| a.enabled) {
            let factory = FACTORIES
                .iter()
                .find(|(name, _)| *name == entry.name)
                .map(|(_, f)| f);

            match factory {
                Some(factory) => {
                    let params = AnalyzerParams::merged(defaults, &entry.params);
                    loaded.push(Loaded {
                        analyzer: factory(&params),
                        weight: entry.weight.clamp(0.0, 1.0),
                        priority: entry.priority,
                        min_confidence: entry.min_confidence,
                    });
                }
                None => {
                    warn!(name = %entry.name, "unknown analyzer in config — skipped");
                }
            }
        }

        info!(count = loaded.len(), "analyzer registry loaded");
        Self {
            loaded,
            risk_management,
        }
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    /// Run every producer over `candles` and return the enriched directional
    /// signals. Never fails; consumers must not depend on output order.
    pub fn collect_signals(&self, candles: &[Candle]) -> Vec<Signal> {
        let Some(last) = candles.last() else {
            return Vec::new();
        };
        let price = last.close;
        let timestamp = last.timestamp;

        let atr = calculate_atr(candles, 14);
        let mut signals = Vec::new();

        for entry in &self.loaded {
            let mut signal = match entry.analyzer.analyze(candles) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(
                        analyzer = entry.analyzer.name(),
                        error = %e,
                        "analyzer failed — excluded from this pass"
                    );
                    continue;
                }
            };

            if signal.direction == Direction::Hold {
                continue;
            }
            if signal.confidence < entry.min_confidence {
                debug!(
                    analyzer = entry.analyzer.name(),
                    confidence = signal.confidence,
                    floor = entry.min_confidence,
                    "signal below producer floor — dropped"
                );
                continue;
            }

            signal.signal_type = entry.analyzer.name().to_string();
            signal.price = price;
            signal.timestamp = timestamp;
            signal.weight = entry.weight;
            signal.priority = entry.priority;

            let (stop_loss, take_profits) =
                propose_protection(signal.direction, price, atr, &self.risk_management);
            signal.stop_loss = stop_loss;
            signal.take_profits = take_profits;

            signals.push(signal);
        }

        debug!(produced = signals.len(), "signal collection complete");
        signals
    }
}

impl std::fmt::Debug for AnalyzerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerRegistry")
            .field("loaded", &self.loaded.len())
            .finish()
    }
}

/// Propose a stop and the TP ladder for a direction: stop distance is
/// ATR-scaled with a percent floor, TP legs come from the configured ladder.
fn propose_protection(
    direction: Direction,
    price: f64,
    atr: Option<f64>,
    config: &RiskManagementConfig,
) -> (f64, Vec<f64>) {
    let min_distance = price * config.stop_loss.min_distance_percent / 100.0;
    let atr_distance = atr.map(|a| a * config.stop_loss.atr_multiplier).unwrap_or(0.0);
    let sl_distance = atr_distance.max(min_distance);

    let sign = match direction {
        Direction::Long => 1.0,
        Direction::Short => -1.0,
        Direction::Hold => return (0.0, Vec::new()),
    };

    let stop_loss = price - sign * sl_distance;
    let take_profits = config
        .take_profits
        .iter()
        .map(|tp| price + sign * price * tp.percent / 100.0)
        .collect();

    (stop_loss, take_profits)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AnalyzerConfig;

    pub(crate) fn rising_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let c = 100.0 + i as f64 * 0.5;
                Candle::new(i as i64 * 60_000, c - 0.2, c + 0.5, c - 0.5, c, 50.0)
            })
            .collect()
    }

    fn analyzer_config(name: &str) -> AnalyzerConfig {
        AnalyzerConfig {
            name: name.to_string(),
            enabled: true,
            weight: 0.8,
            priority: 2,
            min_confidence: 0.0,
            params: HashMap::new(),
        }
    }

    #[test]
    fn registry_skips_unknown_and_disabled() {
        let mut disabled = analyzer_config("ema_trend");
        disabled.enabled = false;
        let configs = vec![
            analyzer_config("rsi_reversal"),
            analyzer_config("no_such_producer"),
            disabled,
        ];
        let registry = AnalyzerRegistry::from_config(
            &configs,
            &HashMap::new(),
            RiskManagementConfig::default(),
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn collect_attaches_context_and_protection() {
        let configs = vec![analyzer_config("ema_trend")];
        let registry = AnalyzerRegistry::from_config(
            &configs,
            &HashMap::new(),
            RiskManagementConfig::default(),
        );

        let candles = rising_candles(120);
        let signals = registry.collect_signals(&candles);
        assert_eq!(signals.len(), 1);

        let signal = &signals[0];
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.signal_type, "ema_trend");
        assert_eq!(signal.price, candles.last().unwrap().close);
        assert_eq!(signal.timestamp, candles.last().unwrap().timestamp);
        assert!((signal.weight - 0.8).abs() < f64::EPSILON);
        assert_eq!(signal.priority, 2);

        // Long protection: stop below, ladder above in ascending order.
        assert!(signal.stop_loss < signal.price);
        assert_eq!(signal.take_profits.len(), 3);
        assert!(signal.take_profits[0] > signal.price);
        assert!(signal.take_profits[0] < signal.take_profits[1]);
        assert!(signal.take_profits[1] < signal.take_profits[2]);
    }

    #[test]
    fn collect_is_empty_without_candles() {
        let registry = AnalyzerRegistry::from_config(
            &[analyzer_config("ema_trend")],
            &HashMap::new(),
            RiskManagementConfig::default(),
        );
        assert!(registry.collect_signals(&[]).is_empty());
    }

    #[test]
    fn producer_floor_drops_weak_signals() {
        let mut config = analyzer_config("ema_trend");
        config.min_confidence = 101.0; // nothing can pass
        let registry = AnalyzerRegistry::from_config(
            &[config],
            &HashMap::new(),
            RiskManagementConfig::default(),
        );
        assert!(registry.collect_signals(&rising_candles(120)).is_empty());
    }

    #[test]
    fn params_merge_later_overrides_earlier() {
        let mut defaults = HashMap::new();
        defaults.insert("period".to_string(), serde_json::json!(14));
        defaults.insert("threshold".to_string(), serde_json::json!(1.5));

        let mut overrides = HashMap::new();
        overrides.insert("period".to_string(), serde_json::json!(21));

        let params = AnalyzerParams::merged(&defaults, &overrides);
        assert_eq!(params.get_usize("period", 0), 21);
        assert!((params.get_f64("threshold", 0.0) - 1.5).abs() < f64::EPSILON);
        assert_eq!(params.get_usize("missing", 7), 7);
    }

    #[test]
    fn short_protection_is_mirrored() {
        let config = RiskManagementConfig::default();
        let (sl, tps) = propose_protection(Direction::Short, 100.0, Some(1.0), &config);
        assert!(sl > 100.0);
        assert!(tps.iter().all(|&tp| tp < 100.0));
        assert!(tps[0] > tps[1] && tps[1] > tps[2]);
    }
}
