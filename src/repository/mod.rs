// =============================================================================
// Repositories — the only shared state in the engine
// =============================================================================
//
// Readable from any task; writes come from the worker (candle provider), the
// action-queue handlers (positions, journal), and the pre-calculator
// (indicator cache).

pub mod journal;
pub mod market_data;
pub mod position;

pub use journal::{JournalRepository, SessionRecord, TradeQuery, TradeRecord};
pub use market_data::{IndicatorValue, MarketDataRepository, RepositoryStats};
pub use position::{
    ExitState, Position, PositionRepository, PositionStatus, StopLossState, TakeProfitLeg,
};
