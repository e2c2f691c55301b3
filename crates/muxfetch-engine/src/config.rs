use std::time::Duration;

use crate::progress::DEFAULT_MERGE_WEIGHT;

/// Minimum spacing between transfer progress events.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(50);

/// Tunables shared by every session.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Fraction of perceived work attributed to the merge stage, in [0, 1]
    pub merge_weight: f64,
    pub progress_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            merge_weight: DEFAULT_MERGE_WEIGHT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}
