//! Cross-reader transaction statistics and outlier detection.
//!
//! Counts are recorded on the hot path; snapshots are recomputed
//! periodically by the sweeper into an immutable `Arc` that the detector
//! reads without locking.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tollgate_common::types::{ReaderId, Timestamp};

/// Immutable cross-reader statistics snapshot.
#[derive(Debug, Default)]
pub struct CrossStats {
    /// Accepted-event counts per reader inside the window
    pub counts: HashMap<ReaderId, u64>,
    /// Mean count over the active peer set
    pub mean_active: f64,
    /// When the snapshot was computed
    pub computed_at: Timestamp,
}

impl CrossStats {
    /// Count for one reader (zero when unseen).
    pub fn count_for(&self, reader_id: &str) -> u64 {
        self.counts.get(reader_id).copied().unwrap_or(0)
    }

    /// Whether the reader's volume exceeds `multiplier x` the peer mean.
    pub fn is_outlier(&self, reader_id: &str, multiplier: f64) -> bool {
        if self.mean_active <= 0.0 {
            return false;
        }
        self.count_for(reader_id) as f64 > multiplier * self.mean_active
    }
}

/// Records accepted events and produces periodic snapshots.
pub struct StatsTracker {
    events: Mutex<HashMap<ReaderId, VecDeque<Timestamp>>>,
    snapshot: RwLock<Arc<CrossStats>>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(CrossStats::default())),
        }
    }

    /// Record one accepted event for a reader.
    pub fn record(&self, reader_id: &str, now: Timestamp) {
        let mut events = self.events.lock().expect("stats lock is never poisoned");
        events
            .entry(reader_id.to_string())
            .or_default()
            .push_back(now);
    }

    /// Current snapshot; lock-free for the reader after the Arc clone.
    pub fn snapshot(&self) -> Arc<CrossStats> {
        self.snapshot
            .read()
            .expect("stats lock is never poisoned")
            .clone()
    }

    /// Recompute the snapshot over the trailing window and prune old
    /// entries. `active_readers` is the peer set whose mean is compared
    /// against.
    pub fn recompute(&self, now: Timestamp, window: u64, active_readers: &[ReaderId]) {
        let cutoff = now.saturating_sub(window);
        let mut events = self.events.lock().expect("stats lock is never poisoned");

        let mut counts: HashMap<ReaderId, u64> = HashMap::new();
        events.retain(|reader_id, timestamps| {
            while timestamps.front().is_some_and(|t| *t < cutoff) {
                timestamps.pop_front();
            }
            if timestamps.is_empty() {
                return false;
            }
            counts.insert(reader_id.clone(), timestamps.len() as u64);
            true
        });
        drop(events);

        let mean_active = if active_readers.is_empty() {
            0.0
        } else {
            let total: u64 = active_readers
                .iter()
                .map(|id| counts.get(id).copied().unwrap_or(0))
                .sum();
            total as f64 / active_readers.len() as f64
        };

        let fresh = Arc::new(CrossStats {
            counts,
            mean_active,
            computed_at: now,
        });

        let mut guard = self.snapshot.write().expect("stats lock is never poisoned");
        *guard = fresh;
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ReaderId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_outlier_against_peer_mean() {
        let tracker = StatsTracker::new();
        let now = 1_700_000_000;

        // Peers average 2 events; r-hot does 10
        for _ in 0..2 {
            tracker.record("r1", now);
            tracker.record("r2", now);
        }
        for _ in 0..10 {
            tracker.record("r-hot", now);
        }

        tracker.recompute(now, 3600, &ids(&["r1", "r2", "r-hot"]));
        let stats = tracker.snapshot();

        // mean = (2 + 2 + 10) / 3 ≈ 4.67; 10 > 3 x 4.67 is false
        assert!(!stats.is_outlier("r-hot", 3.0));
        // but it is with a 2x multiplier
        assert!(stats.is_outlier("r-hot", 2.0));
        assert!(!stats.is_outlier("r1", 2.0));
    }

    #[test]
    fn test_window_pruning() {
        let tracker = StatsTracker::new();
        let now = 1_700_000_000;

        tracker.record("r1", now - 4000); // outside the 3600s window
        tracker.record("r1", now - 10);

        tracker.recompute(now, 3600, &ids(&["r1"]));
        assert_eq!(tracker.snapshot().count_for("r1"), 1);
    }

    #[test]
    fn test_empty_peer_set_never_flags() {
        let tracker = StatsTracker::new();
        let now = 1_700_000_000;
        for _ in 0..100 {
            tracker.record("r1", now);
        }
        tracker.recompute(now, 3600, &[]);
        assert!(!tracker.snapshot().is_outlier("r1", 3.0));
    }
}
