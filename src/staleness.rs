use std::time::Duration;

use crate::clock::Timestamp;
use crate::store::StateStore;

pub const DEFAULT_STALENESS: Duration = Duration::from_secs(10);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Expires distance readings that have not been refreshed within `timeout`.
#[derive(Debug, Clone)]
pub struct StalenessMonitor {
    timeout_ms: Timestamp,
}

impl StalenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        StalenessMonitor {
            timeout_ms: timeout.as_millis() as Timestamp,
        }
    }

    /// Clears every distance older than the timeout and returns the affected
    /// ids. Sweeping again without new readings changes nothing.
    pub fn sweep(&self, store: &mut StateStore, now: Timestamp) -> Vec<String> {
        let stale: Vec<String> = store
            .distance_stamps()
            .filter(|(_, at)| now.saturating_sub(*at) > self.timeout_ms)
            .map(|(id, _)| id.to_string())
            .collect();
        for id in &stale {
            store.invalidate_distance(id);
        }
        stale
    }
}

impl Default for StalenessMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_STALENESS)
    }
}
