use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

const FREQUENCY_WEIGHT: f64 = 0.6;
const RECENCY_WEIGHT: f64 = 0.4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Evict least recently accessed entries until back at capacity.
    #[default]
    Lru,
    /// Score entries by windowed hit count and recency; drop cold entries
    /// first, then the lowest-scoring fraction.
    Aggressive,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
    last_accessed_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalLookup {
    Hit(Vec<u8>),
    /// Entry existed but its TTL had passed; it has been removed.
    Expired,
    Absent,
}

#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    pub strategy: EvictionStrategy,
    /// Share of capacity freed by one aggressive pass, in (0, 1].
    pub fraction: f64,
    pub popularity_threshold: usize,
}

/// Bounded in-process tier. One short mutex guards the map; values are
/// copied out on read.
#[derive(Debug)]
pub struct LocalTier {
    capacity: usize,
    policy: EvictionPolicy,
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl LocalTier {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            capacity,
            policy,
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn get(&self, key: &str) -> LocalLookup {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_accessed_at = now;
                return LocalLookup::Hit(entry.value.clone());
            }
            Some(_) => {}
            None => return LocalLookup::Absent,
        }

        entries.pop(key);
        LocalLookup::Expired
    }

    /// Inserts or overwrites `key` and evicts down to capacity. `hits`
    /// reports the windowed access count of a key for scored eviction.
    /// Returns the number of entries evicted.
    pub fn insert<H>(&self, key: &str, value: Vec<u8>, ttl: Duration, hits: H) -> usize
    where
        H: Fn(&str) -> usize,
    {
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            expires_at: crate::deadline_after(now, ttl),
            last_accessed_at: now,
        };

        let mut entries = self.entries.lock();
        entries.put(key.to_string(), entry);

        if entries.len() <= self.capacity {
            return 0;
        }

        let evicted = match self.policy.strategy {
            EvictionStrategy::Lru => self.evict_lru(&mut entries),
            EvictionStrategy::Aggressive => self.evict_scored(&mut entries, key, now, hits),
        };

        debug!(
            "Local tier evicted {} entries ({:?}), {} remain",
            evicted,
            self.policy.strategy,
            entries.len()
        );
        evicted
    }

    fn evict_lru(&self, entries: &mut LruCache<String, CacheEntry>) -> usize {
        let mut evicted = 0;
        while entries.len() > self.capacity {
            if entries.pop_lru().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    fn evict_scored<H>(
        &self,
        entries: &mut LruCache<String, CacheEntry>,
        protected: &str,
        now: Instant,
        hits: H,
    ) -> usize
    where
        H: Fn(&str) -> usize,
    {
        let threshold = self.policy.popularity_threshold.max(1) as f64;

        let mut candidates: Vec<(String, usize, f64)> = entries
            .iter()
            .filter(|(key, _)| key.as_str() != protected)
            .map(|(key, entry)| {
                let count = hits(key);
                let frequency = (count as f64 / (2.0 * threshold)).min(1.0);
                let age = now.saturating_duration_since(entry.last_accessed_at).as_secs_f64();
                let recency = 1.0 / (1.0 + age);
                let score = FREQUENCY_WEIGHT * frequency + RECENCY_WEIGHT * recency;
                (key.clone(), count, score)
            })
            .collect();

        let mut evicted = 0;

        // Single-touch entries go first whenever something is genuinely hot.
        if candidates.iter().any(|(_, count, _)| *count > 1) {
            candidates.retain(|(key, count, _)| {
                if *count <= 1 {
                    entries.pop(key.as_str());
                    evicted += 1;
                    false
                } else {
                    true
                }
            });
        }

        let target = ((self.capacity as f64) * (1.0 - self.policy.fraction)).floor() as usize;
        let target = target.min(self.capacity);

        if entries.len() > target {
            candidates.sort_by(|a, b| a.2.total_cmp(&b.2));
            for (key, _, _) in candidates {
                if entries.len() <= target {
                    break;
                }
                entries.pop(key.as_str());
                evicted += 1;
            }
        }

        evicted
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Removes every key containing `pattern`, returning the removed keys.
    pub fn remove_matching(&self, pattern: &str) -> Vec<String> {
        let mut entries = self.entries.lock();
        let matching: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.contains(pattern))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &matching {
            entries.pop(key.as_str());
        }
        matching
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key.as_str());
        }
        expired.len()
    }

    /// Presence check that does not touch recency.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(key)
            .map_or(false, |entry| !entry.is_expired(now))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
