//! Engine tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::updater::UpdaterConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet period a key must see before its change is acted on.
    pub debounce_ms: u64,
    pub backoff: BackoffPolicy,
    pub updater: UpdaterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            backoff: BackoffPolicy::default(),
            updater: UpdaterConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
