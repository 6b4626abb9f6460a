// =============================================================================
// Data Providers — timeframe resolution and candle ingestion
// =============================================================================

pub mod candle_provider;
pub mod timeframes;

pub use candle_provider::CandleProvider;
pub use timeframes::TimeframeProvider;
