use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Wall-clock anchored to tokio's monotonic `Instant`.
///
/// The epoch offset is captured once; everything after that is measured on the
/// runtime clock, so a paused test runtime advances it deterministically.
pub struct RuntimeClock {
    origin: tokio::time::Instant,
    epoch_ms: Timestamp,
}

impl RuntimeClock {
    pub fn new() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0);
        RuntimeClock {
            origin: tokio::time::Instant::now(),
            epoch_ms,
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> Timestamp {
        self.epoch_ms + self.origin.elapsed().as_millis() as Timestamp
    }
}
