use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window access counts per cache key.
///
/// Each key's window is pruned whenever the key is touched, so popularity
/// decays without a timer. Keys that stop being touched are dropped by
/// [`AccessTracker::prune_idle`].
#[derive(Debug)]
pub struct AccessTracker {
    window: Duration,
    records: DashMap<String, VecDeque<Instant>>,
}

impl AccessTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            records: DashMap::new(),
        }
    }

    /// Records one access and returns the count within the window,
    /// including this one.
    pub fn record(&self, key: &str) -> usize {
        let now = Instant::now();
        let mut record = self.records.entry(key.to_string()).or_default();
        prune(&mut record, now, self.window);
        record.push_back(now);
        record.len()
    }

    pub fn count(&self, key: &str) -> usize {
        match self.records.get_mut(key) {
            Some(mut record) => {
                prune(&mut record, Instant::now(), self.window);
                record.len()
            }
            None => 0,
        }
    }

    /// Drops keys with no accesses left in the window. Returns how many
    /// were dropped.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| {
            prune(record, now, self.window);
            !record.is_empty()
        });
        before.saturating_sub(self.records.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }
}

fn prune(record: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = record.front() {
        if now.saturating_duration_since(*oldest) >= window {
            record.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_within_window() {
        let tracker = AccessTracker::new(Duration::from_secs(60));
        assert_eq!(tracker.record("a"), 1);
        assert_eq!(tracker.record("a"), 2);
        assert_eq!(tracker.record("b"), 1);
        assert_eq!(tracker.count("a"), 2);
        assert_eq!(tracker.count("missing"), 0);
    }

    #[tokio::test]
    async fn test_window_decays_old_accesses() {
        let tracker = AccessTracker::new(Duration::from_millis(30));
        tracker.record("a");
        tracker.record("a");

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(tracker.record("a"), 1);
    }

    #[tokio::test]
    async fn test_prune_idle_drops_abandoned_keys() {
        let tracker = AccessTracker::new(Duration::from_millis(20));
        tracker.record("old");

        tokio::time::sleep(Duration::from_millis(30)).await;
        tracker.record("fresh");

        assert_eq!(tracker.prune_idle(), 1);
        assert_eq!(tracker.tracked_keys(), 1);
    }
}
