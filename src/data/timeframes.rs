// =============================================================================
// Timeframe Provider — role to interval/limit resolution
// =============================================================================

use std::collections::HashMap;

use crate::config::{EngineConfig, TimeframeSpec};
use crate::types::TimeframeRole;

/// Resolves semantic timeframe roles to concrete intervals and history depth.
#[derive(Debug, Clone)]
pub struct TimeframeProvider {
    specs: HashMap<TimeframeRole, TimeframeSpec>,
}

impl TimeframeProvider {
    pub fn from_config(config: &EngineConfig) -> Self {
        let specs = TimeframeRole::ALL
            .iter()
            .map(|&role| (role, config.timeframe(role)))
            .collect();
        Self { specs }
    }

    pub fn interval(&self, role: TimeframeRole) -> &str {
        &self.specs[&role].interval
    }

    pub fn candle_limit(&self, role: TimeframeRole) -> usize {
        self.specs[&role].candle_limit
    }

    /// The role subscribed to `interval`, if any. Multiple roles may share an
    /// interval; the first in role order wins.
    pub fn role_for_interval(&self, interval: &str) -> Option<TimeframeRole> {
        TimeframeRole::ALL
            .iter()
            .copied()
            .find(|role| self.specs[role].interval == interval)
    }

    /// All `(role, interval)` pairs, in initialization order.
    pub fn subscriptions(&self) -> Vec<(TimeframeRole, String)> {
        TimeframeRole::ALL
            .iter()
            .map(|&role| (role, self.specs[&role].interval.clone()))
            .collect()
    }
}
