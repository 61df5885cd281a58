use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Source of wall-clock timestamps for task records.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall clock anchored to tokio's monotonic clock, so paused test runtimes
/// advance timestamps together with timers. Readings are truncated to whole
/// milliseconds, the precision task records are persisted with.
#[derive(Clone, Debug)]
pub struct TokioClock {
    origin_wall: SystemTime,
    origin_instant: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin_wall: SystemTime::now(),
            origin_instant: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> SystemTime {
        truncate_to_millis(self.origin_wall + self.origin_instant.elapsed())
    }
}

pub fn truncate_to_millis(value: SystemTime) -> SystemTime {
    match value.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => UNIX_EPOCH + Duration::from_millis(elapsed.as_millis() as u64),
        Err(_) => value,
    }
}

/// Whole milliseconds from `earlier` to `later`, zero if the clock went
/// backwards.
pub fn millis_between(earlier: SystemTime, later: SystemTime) -> u64 {
    later
        .duration_since(earlier)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
