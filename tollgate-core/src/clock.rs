//! Clock service: wall clock plus a test-adjustable offset.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tollgate_common::types::Timestamp;

/// Wall-clock source for the whole node. The offset exists so tests can
/// move time without sleeping.
#[derive(Default)]
pub struct Clock {
    offset_secs: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds since epoch, adjusted by the offset.
    pub fn now(&self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs() as i64;
        (wall + self.offset_secs.load(Ordering::Relaxed)).max(0) as Timestamp
    }

    /// Shift the clock; negative values move it backwards.
    pub fn advance(&self, secs: i64) {
        self.offset_secs.fetch_add(secs, Ordering::Relaxed);
    }
}
