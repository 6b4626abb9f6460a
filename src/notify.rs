// =============================================================================
// Notifier — user-facing event summaries behind a pluggable sink
// =============================================================================
//
// The concrete transport (Telegram, webhook, ...) lives outside the core;
// the engine only ever talks to this trait. Failures carry the error kind and
// code with a short message — diagnostic detail stays in the logs.
// =============================================================================

use tracing::{info, warn};

use crate::error::Severity;
use crate::types::Side;

/// User-visible engine events.
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    EngineStarted {
        symbol: String,
        exchange: String,
        demo: bool,
    },
    EngineStopped {
        reason: String,
    },
    PositionOpened {
        symbol: String,
        side: Side,
        quantity: f64,
        entry_price: f64,
        stop_loss: f64,
    },
    PositionPartiallyClosed {
        symbol: String,
        percentage: f64,
        reason: String,
    },
    PositionClosed {
        symbol: String,
        realized_pnl: f64,
        reason: String,
    },
    StopLossMoved {
        symbol: String,
        new_price: f64,
        breakeven: bool,
    },
    TrailingActivated {
        symbol: String,
        trailing_percent: f64,
    },
    Failure {
        code: &'static str,
        severity: Severity,
        message: String,
    },
}

/// Delivery sink for notification events.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &NotificationEvent);
}

/// Default sink: structured log lines only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &NotificationEvent) {
        match event {
            NotificationEvent::EngineStarted {
                symbol,
                exchange,
                demo,
            } => {
                info!(symbol = %symbol, exchange = %exchange, demo, "notify: engine started");
            }
            NotificationEvent::EngineStopped { reason } => {
                info!(reason = %reason, "notify: engine stopped");
            }
            NotificationEvent::PositionOpened {
                symbol,
                side,
                quantity,
                entry_price,
                stop_loss,
            } => {
                info!(
                    symbol = %symbol,
                    side = %side,
                    quantity,
                    entry_price,
                    stop_loss,
                    "notify: position opened"
                );
            }
            NotificationEvent::PositionPartiallyClosed {
                symbol,
                percentage,
                reason,
            } => {
                info!(symbol = %symbol, percentage, reason = %reason, "notify: partial close");
            }
            NotificationEvent::PositionClosed {
                symbol,
                realized_pnl,
                reason,
            } => {
                info!(
                    symbol = %symbol,
                    realized_pnl,
                    reason = %reason,
                    "notify: position closed"
                );
            }
            NotificationEvent::StopLossMoved {
                symbol,
                new_price,
                breakeven,
            } => {
                info!(symbol = %symbol, new_price, breakeven, "notify: stop-loss moved");
            }
            NotificationEvent::TrailingActivated {
                symbol,
                trailing_percent,
            } => {
                info!(symbol = %symbol, trailing_percent, "notify: trailing activated");
            }
            NotificationEvent::Failure {
                code,
                severity,
                message,
            } => {
                warn!(code, severity = ?severity, message = %message, "notify: failure");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Test notifier that records event discriminants.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub events: Arc<Mutex<Vec<String>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, event: &NotificationEvent) {
            let tag = match event {
                NotificationEvent::EngineStarted { .. } => "started",
                NotificationEvent::EngineStopped { .. } => "stopped",
                NotificationEvent::PositionOpened { .. } => "opened",
                NotificationEvent::PositionPartiallyClosed { .. } => "partial",
                NotificationEvent::PositionClosed { .. } => "closed",
                NotificationEvent::StopLossMoved { .. } => "sl-moved",
                NotificationEvent::TrailingActivated { .. } => "trailing",
                NotificationEvent::Failure { .. } => "failure",
            };
            self.events.lock().push(tag.to_string());
        }
    }

    #[test]
    fn log_notifier_accepts_every_event() {
        let notifier = LogNotifier;
        notifier.notify(&NotificationEvent::EngineStarted {
            symbol: "BTCUSDT".into(),
            exchange: "bybit".into(),
            demo: true,
        });
        notifier.notify(&NotificationEvent::Failure {
            code: "NETWORK",
            severity: Severity::Error,
            message: "timeout".into(),
        });
    }
}
