//! Lock manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default pause between deadlock detection passes.
pub const DEFAULT_CYCLE_DETECTION_INTERVAL_MS: u64 = 50;

/// Configuration for a [`crate::LockManager`].
///
/// Deserializes from a partial document: missing fields take their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Run the background waits-for cycle detector.
    pub enable_cycle_detection: bool,
    /// Milliseconds between detection passes. Zero is treated as one.
    pub cycle_detection_interval_ms: u64,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            enable_cycle_detection: false,
            cycle_detection_interval_ms: DEFAULT_CYCLE_DETECTION_INTERVAL_MS,
        }
    }
}

impl LockManagerConfig {
    /// Config with cycle detection enabled at the given interval.
    #[must_use]
    pub const fn with_cycle_detection(interval_ms: u64) -> Self {
        Self {
            enable_cycle_detection: true,
            cycle_detection_interval_ms: interval_ms,
        }
    }

    /// The detection interval, never shorter than one millisecond.
    #[must_use]
    pub fn cycle_detection_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_detection_interval_ms.max(1))
    }
}
