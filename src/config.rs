// =============================================================================
// Engine Configuration — JSON-backed settings with atomic save
// =============================================================================
//
// Every tunable parameter lives here. Persistence uses a tmp + rename pattern
// to prevent corruption on crash. All fields carry serde defaults so that
// adding new fields never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TimeframeRole;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_exchange_name() -> ExchangeName {
    ExchangeName::Bybit
}

fn default_timeframes() -> HashMap<TimeframeRole, TimeframeSpec> {
    let mut map = HashMap::new();
    map.insert(TimeframeRole::Primary, TimeframeSpec::new("1h", 200));
    map.insert(TimeframeRole::Entry, TimeframeSpec::new("15m", 200));
    map.insert(TimeframeRole::Htf1, TimeframeSpec::new("4h", 200));
    map.insert(TimeframeRole::Htf2, TimeframeSpec::new("1d", 100));
    map.insert(TimeframeRole::Context, TimeframeSpec::new("1d", 100));
    map
}

fn default_candle_limit() -> usize {
    200
}

fn default_max_daily_loss_percent() -> f64 {
    5.0
}

fn default_stop_after_losses() -> u32 {
    5
}

fn default_reduction_after_2() -> f64 {
    0.75
}

fn default_reduction_after_3() -> f64 {
    0.50
}

fn default_reduction_after_4() -> f64 {
    0.25
}

fn default_max_positions() -> u32 {
    1
}

fn default_max_risk_per_position() -> f64 {
    2.0
}

fn default_max_total_exposure_percent() -> f64 {
    10.0
}

fn default_risk_per_trade_percent() -> f64 {
    1.0
}

fn default_min_usdt() -> f64 {
    10.0
}

fn default_max_usdt() -> f64 {
    10_000.0
}

fn default_max_leverage_multiplier() -> f64 {
    10.0
}

fn default_sl_atr_multiplier() -> f64 {
    1.5
}

fn default_min_sl_distance_percent() -> f64 {
    0.4
}

fn default_take_profits() -> Vec<TakeProfitSpec> {
    vec![
        TakeProfitSpec {
            level: 1,
            percent: 1.0,
            size_percent: 60.0,
        },
        TakeProfitSpec {
            level: 2,
            percent: 2.0,
            size_percent: 30.0,
        },
        TakeProfitSpec {
            level: 3,
            percent: 3.0,
            size_percent: 10.0,
        },
    ]
}

fn default_trailing_stop_percent() -> f64 {
    0.5
}

fn default_min_confidence_to_enter() -> f64 {
    55.0
}

fn default_snapshot_ttl_ms() -> i64 {
    120_000
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

fn default_leverage() -> u32 {
    3
}

fn default_analyzer_weight() -> f64 {
    1.0
}

fn default_request_timeout_seconds() -> u64 {
    10
}

// =============================================================================
// Exchange
// =============================================================================

/// Supported exchange backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeName {
    Bybit,
    Binance,
}

impl std::fmt::Display for ExchangeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bybit => write!(f, "bybit"),
            Self::Binance => write!(f, "binance"),
        }
    }
}

/// Exchange connection settings. API credentials come from the environment
/// (`MERIDIAN_API_KEY` / `MERIDIAN_API_SECRET`), never from this file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_name")]
    pub name: ExchangeName,

    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Demo mode: orders are simulated, nothing reaches the exchange.
    #[serde(default = "default_true")]
    pub demo: bool,

    /// Use the exchange's testnet endpoints.
    #[serde(default)]
    pub testnet: bool,

    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Per-request timeout for REST calls.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: ExchangeName::Bybit,
            symbol: default_symbol(),
            demo: true,
            testnet: false,
            leverage: default_leverage(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

// =============================================================================
// Timeframes
// =============================================================================

/// Interval + history depth for one timeframe role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeSpec {
    pub interval: String,
    #[serde(default = "default_candle_limit")]
    pub candle_limit: usize,
}

impl TimeframeSpec {
    pub fn new(interval: impl Into<String>, candle_limit: usize) -> Self {
        Self {
            interval: interval.into(),
            candle_limit,
        }
    }
}

// =============================================================================
// Risk manager
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyLimitsConfig {
    #[serde(default = "default_max_daily_loss_percent")]
    pub max_daily_loss_percent: f64,

    #[serde(default = "default_true")]
    pub emergency_stop_on_limit: bool,
}

impl Default for DailyLimitsConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_percent: default_max_daily_loss_percent(),
            emergency_stop_on_limit: true,
        }
    }
}

/// Position-size multipliers applied after N consecutive losses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossStreakConfig {
    #[serde(default = "default_stop_after_losses")]
    pub stop_after_losses: u32,

    #[serde(default = "default_reduction_after_2")]
    pub after2: f64,

    #[serde(default = "default_reduction_after_3")]
    pub after3: f64,

    #[serde(default = "default_reduction_after_4")]
    pub after4: f64,
}

impl LossStreakConfig {
    /// Multiplier for the given streak length.
    pub fn multiplier(&self, streak: u32) -> f64 {
        match streak {
            0 | 1 => 1.0,
            2 => self.after2,
            3 => self.after3,
            _ => self.after4,
        }
    }
}

impl Default for LossStreakConfig {
    fn default() -> Self {
        Self {
            stop_after_losses: default_stop_after_losses(),
            after2: default_reduction_after_2(),
            after3: default_reduction_after_3(),
            after4: default_reduction_after_4(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrentRiskConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    #[serde(default = "default_max_risk_per_position")]
    pub max_risk_per_position: f64,

    #[serde(default = "default_max_total_exposure_percent")]
    pub max_total_exposure_percent: f64,
}

impl Default for ConcurrentRiskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_positions: default_max_positions(),
            max_risk_per_position: default_max_risk_per_position(),
            max_total_exposure_percent: default_max_total_exposure_percent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizingConfig {
    #[serde(default = "default_risk_per_trade_percent")]
    pub risk_per_trade_percent: f64,

    #[serde(default = "default_min_usdt")]
    pub min_usdt: f64,

    #[serde(default = "default_max_usdt")]
    pub max_usdt: f64,

    #[serde(default = "default_max_leverage_multiplier")]
    pub max_leverage_multiplier: f64,
}

impl Default for PositionSizingConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_percent: default_risk_per_trade_percent(),
            min_usdt: default_min_usdt(),
            max_usdt: default_max_usdt(),
            max_leverage_multiplier: default_max_leverage_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskManagerConfig {
    #[serde(default)]
    pub daily_limits: DailyLimitsConfig,

    #[serde(default)]
    pub loss_streak: LossStreakConfig,

    #[serde(default)]
    pub concurrent_risk: ConcurrentRiskConfig,

    #[serde(default)]
    pub position_sizing: PositionSizingConfig,
}

// =============================================================================
// Risk management (SL / TP shape)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossConfig {
    #[serde(default = "default_sl_atr_multiplier")]
    pub atr_multiplier: f64,

    #[serde(default = "default_min_sl_distance_percent")]
    pub min_distance_percent: f64,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            atr_multiplier: default_sl_atr_multiplier(),
            min_distance_percent: default_min_sl_distance_percent(),
        }
    }
}

/// One take-profit ladder leg: distance from entry and fraction of the
/// position to close when it hits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitSpec {
    pub level: u8,
    /// Distance from entry as a percentage of entry price.
    pub percent: f64,
    /// Fraction of the position closed at this leg, in percent.
    pub size_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskManagementConfig {
    #[serde(default)]
    pub stop_loss: StopLossConfig,

    #[serde(default = "default_take_profits")]
    pub take_profits: Vec<TakeProfitSpec>,

    #[serde(default = "default_trailing_stop_percent")]
    pub trailing_stop_percent: f64,

    #[serde(default)]
    pub breakeven_offset_percent: f64,
}

impl Default for RiskManagementConfig {
    fn default() -> Self {
        Self {
            stop_loss: StopLossConfig::default(),
            take_profits: default_take_profits(),
            trailing_stop_percent: default_trailing_stop_percent(),
            breakeven_offset_percent: 0.0,
        }
    }
}

// =============================================================================
// Analyzers & filters
// =============================================================================

/// One signal producer entry in the strategy config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Aggregation weight in [0, 1].
    #[serde(default = "default_analyzer_weight")]
    pub weight: f64,

    /// Tie-break priority; higher wins.
    #[serde(default)]
    pub priority: u8,

    /// Producer-local confidence floor (0–100); signals below it are dropped
    /// by the producer itself.
    #[serde(default)]
    pub min_confidence: f64,

    /// Free-form per-producer parameters, merged over analyzer defaults.
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    #[serde(default = "default_true")]
    pub trend_alignment: bool,

    #[serde(default = "default_true")]
    pub funding_rate: bool,

    #[serde(default = "default_true")]
    pub flat_market: bool,

    #[serde(default)]
    pub btc_correlation: bool,

    /// Veto entries when |funding rate| exceeds this (decimal, e.g. 0.0005).
    #[serde(default = "default_funding_threshold")]
    pub max_abs_funding_rate: f64,

    /// Flat market: veto when ATR% of price falls below this.
    #[serde(default = "default_flat_market_atr_percent")]
    pub min_atr_percent: f64,
}

fn default_funding_threshold() -> f64 {
    0.0005
}

fn default_flat_market_atr_percent() -> f64 {
    0.15
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            trend_alignment: true,
            funding_rate: true,
            flat_market: true,
            btc_correlation: false,
            max_abs_funding_rate: default_funding_threshold(),
            min_atr_percent: default_flat_market_atr_percent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightMatrixConfig {
    /// Minimum normalized score (0–100) the winning direction must reach.
    #[serde(default = "default_min_confidence_to_enter")]
    pub min_confidence_to_enter: f64,
}

impl Default for WeightMatrixConfig {
    fn default() -> Self {
        Self {
            min_confidence_to_enter: default_min_confidence_to_enter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtfSnapshotConfig {
    /// Constant in this version.
    #[serde(default = "default_snapshot_ttl_ms")]
    pub ttl_ms: i64,
}

impl Default for MtfSnapshotConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_snapshot_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GracefulShutdownConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,

    #[serde(default = "default_true")]
    pub cancel_orders_on_shutdown: bool,

    #[serde(default)]
    pub close_positions_on_shutdown: bool,
}

impl Default for GracefulShutdownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            cancel_orders_on_shutdown: true,
            close_positions_on_shutdown: false,
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

fn default_analyzers() -> Vec<AnalyzerConfig> {
    ["rsi_reversal", "ema_trend", "momentum"]
        .iter()
        .map(|name| AnalyzerConfig {
            name: name.to_string(),
            enabled: true,
            weight: default_analyzer_weight(),
            priority: 0,
            min_confidence: 0.0,
            params: HashMap::new(),
        })
        .collect()
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default = "default_timeframes")]
    pub timeframes: HashMap<TimeframeRole, TimeframeSpec>,

    #[serde(default)]
    pub risk_manager: RiskManagerConfig,

    #[serde(default)]
    pub risk_management: RiskManagementConfig,

    #[serde(default = "default_analyzers")]
    pub analyzers: Vec<AnalyzerConfig>,

    #[serde(default)]
    pub filters: FiltersConfig,

    #[serde(default)]
    pub weight_matrix: WeightMatrixConfig,

    #[serde(default)]
    pub mtf_snapshot: MtfSnapshotConfig,

    #[serde(default)]
    pub graceful_shutdown: GracefulShutdownConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            timeframes: default_timeframes(),
            risk_manager: RiskManagerConfig::default(),
            risk_management: RiskManagementConfig::default(),
            analyzers: default_analyzers(),
            filters: FiltersConfig::default(),
            weight_matrix: WeightMatrixConfig::default(),
            mtf_snapshot: MtfSnapshotConfig::default(),
            graceful_shutdown: GracefulShutdownConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            exchange = %config.exchange.name,
            symbol = %config.exchange.symbol,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// The spec for a timeframe role, falling back to built-in defaults when
    /// the config omits the role.
    pub fn timeframe(&self, role: TimeframeRole) -> TimeframeSpec {
        self.timeframes
            .get(&role)
            .cloned()
            .unwrap_or_else(|| default_timeframes().remove(&role).unwrap())
    }
}
