use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    AccessTracker, DistributedStore, Envelope, EvictionPolicy, EvictionStrategy, LocalLookup,
    LocalTier,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_local_entries: usize,
    pub default_ttl: Duration,
    pub popularity_threshold: usize,
    pub access_window: Duration,
    pub eviction_strategy: EvictionStrategy,
    pub eviction_fraction: f64,
    pub cleanup_interval: Duration,
    pub enable_compression: bool,
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_local_entries: 10_000,
            default_ttl: Duration::from_secs(3600),
            popularity_threshold: 3,
            access_window: Duration::from_secs(3600),
            eviction_strategy: EvictionStrategy::Lru,
            eviction_fraction: 0.1,
            cleanup_interval: Duration::from_secs(60),
            enable_compression: true,
            compression_threshold: 1024,
        }
    }
}

/// Where a `set` placed a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierPlacement {
    Both,
    LocalOnly,
    DistributedOnly,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub local_hits: u64,
    pub distributed_hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub distributed_errors: u64,
    pub local_entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total_hits = self.local_hits + self.distributed_hits;
        let total_requests = total_hits + self.misses;

        if total_requests > 0 {
            total_hits as f64 / total_requests as f64
        } else {
            0.0
        }
    }

    pub fn local_hit_rate(&self) -> f64 {
        let total_requests = self.local_hits + self.distributed_hits + self.misses;
        if total_requests > 0 {
            self.local_hits as f64 / total_requests as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    local_hits: AtomicU64,
    distributed_hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    distributed_errors: AtomicU64,
}

impl CacheCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Two-tier cache with popularity-driven placement.
///
/// Reads check the local tier, then the distributed tier, promoting popular
/// keys on a distributed hit. Writes place a key in one or both tiers based
/// on its access count within `access_window`:
///
/// | accesses                     | placement          |
/// |------------------------------|--------------------|
/// | `>= 2 * popularity_threshold`| both tiers         |
/// | `>= popularity_threshold`    | local only         |
/// | below                        | distributed only   |
///
/// Without a distributed store every write lands locally. No internal lock
/// is held while the distributed store is awaited.
#[derive(Debug)]
pub struct IntelligentCache {
    config: CacheConfig,
    local: LocalTier,
    distributed: Option<Arc<dyn DistributedStore>>,
    access: AccessTracker,
    envelope: Envelope,
    counters: CacheCounters,
}

impl IntelligentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_distributed_store(config: CacheConfig, store: Arc<dyn DistributedStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: CacheConfig, distributed: Option<Arc<dyn DistributedStore>>) -> Self {
        let local = LocalTier::new(
            config.max_local_entries,
            EvictionPolicy {
                strategy: config.eviction_strategy,
                fraction: config.eviction_fraction,
                popularity_threshold: config.popularity_threshold,
            },
        );

        info!(
            "Initialized intelligent cache: local capacity {}, distributed tier {}",
            config.max_local_entries,
            if distributed.is_some() { "enabled" } else { "disabled" }
        );

        Self {
            access: AccessTracker::new(config.access_window),
            envelope: Envelope::new(config.enable_compression, config.compression_threshold),
            local,
            distributed,
            counters: CacheCounters::default(),
            config,
        }
    }

    /// Looks `key` up in both tiers. Counts as one access for popularity.
    ///
    /// A distributed-tier failure is logged and reported as a miss.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let accesses = self.access.record(key);

        match self.local.get(key) {
            LocalLookup::Hit(value) => {
                CacheCounters::bump(&self.counters.local_hits);
                return Some(value);
            }
            LocalLookup::Expired => {
                CacheCounters::bump(&self.counters.expirations);
                debug!("Local cache entry expired: {}", key);
            }
            LocalLookup::Absent => {}
        }

        let Some(store) = &self.distributed else {
            CacheCounters::bump(&self.counters.misses);
            return None;
        };

        let raw = match store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                CacheCounters::bump(&self.counters.misses);
                return None;
            }
            Err(e) => {
                warn!("Distributed cache read failed for {}: {}", key, e);
                CacheCounters::bump(&self.counters.distributed_errors);
                CacheCounters::bump(&self.counters.misses);
                return None;
            }
        };

        let opened = match self.envelope.open(&raw) {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Discarding unreadable distributed entry {}: {}", key, e);
                CacheCounters::bump(&self.counters.misses);
                return None;
            }
        };

        let remaining = match (opened.expires_at - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => {
                CacheCounters::bump(&self.counters.expirations);
                CacheCounters::bump(&self.counters.misses);
                return None;
            }
        };

        CacheCounters::bump(&self.counters.distributed_hits);

        if accesses >= self.config.popularity_threshold {
            self.store_local(key, opened.value.clone(), remaining);
            CacheCounters::bump(&self.counters.promotions);
            debug!("Promoted {} to local tier after {} accesses", key, accesses);
        }

        Some(opened.value)
    }

    /// Returns the cached value, or runs `fetch`, caches its result and
    /// returns it. Fetch errors are passed through untouched.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<Vec<u8>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = fetch().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Writes `value` with `ttl` (or the default TTL). Same-key writers race
    /// with last-writer-wins.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> TierPlacement {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let placement = self.placement_for(key);

        match placement {
            TierPlacement::Both => {
                self.store_local(key, value.clone(), ttl);
                self.store_distributed(key, &value, ttl).await;
            }
            TierPlacement::LocalOnly => {
                self.store_local(key, value, ttl);
                if let Some(store) = &self.distributed {
                    if let Err(e) = store.delete(key).await {
                        debug!("Could not clear distributed copy of {}: {}", key, e);
                    }
                }
            }
            TierPlacement::DistributedOnly => {
                self.local.remove(key);
                if !self.store_distributed(key, &value, ttl).await {
                    warn!("Falling back to local tier for {}", key);
                    self.store_local(key, value, ttl);
                    return TierPlacement::LocalOnly;
                }
            }
        }

        placement
    }

    fn placement_for(&self, key: &str) -> TierPlacement {
        if self.distributed.is_none() {
            return TierPlacement::LocalOnly;
        }

        let accesses = self.access.count(key);
        let threshold = self.config.popularity_threshold;

        if accesses >= threshold * 2 {
            TierPlacement::Both
        } else if accesses >= threshold {
            TierPlacement::LocalOnly
        } else {
            TierPlacement::DistributedOnly
        }
    }

    fn store_local(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let evicted = self
            .local
            .insert(key, value, ttl, |candidate| self.access.count(candidate));
        if evicted > 0 {
            self.counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }

    async fn store_distributed(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        let Some(store) = &self.distributed else {
            return false;
        };

        let expires_at = chrono::Duration::from_std(ttl.min(crate::MAX_DEADLINE))
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or_else(|| Utc::now() + chrono::Duration::days(36_500));
        let sealed = self.envelope.seal(value, expires_at);

        match store.set_with_ttl(key, sealed, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Distributed cache write failed for {}: {}", key, e);
                CacheCounters::bump(&self.counters.distributed_errors);
                false
            }
        }
    }

    /// Removes `key` from both tiers. Returns whether any tier held it.
    pub async fn remove(&self, key: &str) -> bool {
        let mut removed = self.local.remove(key);

        if let Some(store) = &self.distributed {
            match store.delete(key).await {
                Ok(deleted) => removed |= deleted,
                Err(e) => {
                    warn!("Distributed cache delete failed for {}: {}", key, e);
                    CacheCounters::bump(&self.counters.distributed_errors);
                }
            }
        }

        removed
    }

    /// Removes every key containing `pattern` from both tiers and returns
    /// the number of distinct keys removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let mut removed: HashSet<String> = self.local.remove_matching(pattern).into_iter().collect();

        if let Some(store) = &self.distributed {
            match store.delete_matching(pattern).await {
                Ok(keys) => removed.extend(keys),
                Err(e) => {
                    warn!("Distributed invalidation of '{}' failed: {}", pattern, e);
                    CacheCounters::bump(&self.counters.distributed_errors);
                }
            }
        }

        info!("Invalidated {} cache keys matching '{}'", removed.len(), pattern);
        removed.len()
    }

    /// Pre-populates keys in every available tier.
    pub async fn warm<I>(&self, entries: I, ttl: Option<Duration>) -> usize
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut warmed = 0;

        for (key, value) in entries {
            if self.distributed.is_some() {
                self.store_distributed(&key, &value, ttl).await;
            }
            self.store_local(&key, value, ttl);
            warmed += 1;
        }

        info!("Warmed cache with {} entries", warmed);
        warmed
    }

    /// Drops expired local entries and idle access records. Returns the
    /// number of expired entries removed.
    pub fn cleanup_expired(&self) -> usize {
        let expired = self.local.purge_expired();
        let idle = self.access.prune_idle();

        if expired > 0 {
            self.counters
                .expirations
                .fetch_add(expired as u64, Ordering::Relaxed);
        }
        if expired > 0 || idle > 0 {
            debug!(
                "Cache cleanup removed {} expired entries and {} idle access records",
                expired, idle
            );
        }
        expired
    }

    /// Spawns the periodic sweep. The task ends once the cache is dropped.
    pub fn start_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let interval = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            interval_timer.tick().await;
            loop {
                interval_timer.tick().await;
                match cache.upgrade() {
                    Some(cache_ref) => {
                        cache_ref.cleanup_expired();
                    }
                    None => break,
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        CacheStats {
            local_hits: load(&self.counters.local_hits),
            distributed_hits: load(&self.counters.distributed_hits),
            misses: load(&self.counters.misses),
            promotions: load(&self.counters.promotions),
            evictions: load(&self.counters.evictions),
            expirations: load(&self.counters.expirations),
            distributed_errors: load(&self.counters.distributed_errors),
            local_entries: self.local.len(),
        }
    }

    pub fn contains_local(&self, key: &str) -> bool {
        self.local.contains(key)
    }

    pub fn has_distributed_tier(&self) -> bool {
        self.distributed.is_some()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::InMemoryDistributedStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct UnreachableStore;

    #[async_trait]
    impl DistributedStore for UnreachableStore {
        async fn get(&self, _key: &str) -> eyre::Result<Option<Vec<u8>>> {
            Err(eyre::eyre!("connection refused"))
        }

        async fn set_with_ttl(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> eyre::Result<()> {
            Err(eyre::eyre!("connection refused"))
        }

        async fn delete(&self, _key: &str) -> eyre::Result<bool> {
            Err(eyre::eyre!("connection refused"))
        }

        async fn delete_matching(&self, _pattern: &str) -> eyre::Result<Vec<String>> {
            Err(eyre::eyre!("connection refused"))
        }
    }

    fn two_tier() -> (IntelligentCache, Arc<InMemoryDistributedStore>) {
        let store = Arc::new(InMemoryDistributedStore::new());
        let cache = IntelligentCache::with_distributed_store(CacheConfig::default(), store.clone());
        (cache, store)
    }

    #[tokio::test]
    async fn test_local_only_basic_operations() {
        let cache = IntelligentCache::new(CacheConfig::default());

        let placement = cache.set("key1", b"value1".to_vec(), None).await;
        assert_eq!(placement, TierPlacement::LocalOnly);
        assert_eq!(cache.get("key1").await, Some(b"value1".to_vec()));
        assert_eq!(cache.get("key2").await, None);

        let stats = cache.stats();
        assert_eq!(stats.local_hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.local_entries, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_cache_expiration() {
        let cache = IntelligentCache::new(CacheConfig {
            default_ttl: Duration::from_millis(10),
            ..Default::default()
        });

        cache.set("key1", b"value1".to_vec(), None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.get("key1").await, None);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_unbounded_ttl_in_both_tiers() {
        let (cache, store) = two_tier();

        cache.set("cold", b"c".to_vec(), Some(Duration::MAX)).await;
        cache.set("hot", b"h".to_vec(), Some(Duration::MAX)).await;
        for _ in 0..3 {
            cache.get("hot").await;
        }
        cache.set("hot", b"h".to_vec(), Some(Duration::MAX)).await;

        assert_eq!(cache.get("cold").await, Some(b"c".to_vec()));
        assert_eq!(cache.get("hot").await, Some(b"h".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_placement_follows_popularity() {
        let (cache, store) = two_tier();

        assert_eq!(
            cache.set("k", vec![1], None).await,
            TierPlacement::DistributedOnly
        );
        assert!(store.contains_key("k"));
        assert!(!cache.contains_local("k"));

        for _ in 0..3 {
            cache.get("k").await;
        }
        assert_eq!(cache.set("k", vec![2], None).await, TierPlacement::LocalOnly);
        assert!(cache.contains_local("k"));
        assert!(!store.contains_key("k"));

        for _ in 0..3 {
            cache.get("k").await;
        }
        assert_eq!(cache.set("k", vec![3], None).await, TierPlacement::Both);
        assert!(cache.contains_local("k"));
        assert!(store.contains_key("k"));
    }

    #[tokio::test]
    async fn test_distributed_hit_promotes_popular_key() {
        let (cache, _store) = two_tier();
        cache.set("k", b"v".to_vec(), None).await;

        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));
        assert!(!cache.contains_local("k"));

        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));
        assert!(cache.contains_local("k"));

        let stats = cache.stats();
        assert_eq!(stats.distributed_hits, 3);
        assert_eq!(stats.promotions, 1);
    }

    #[tokio::test]
    async fn test_large_values_survive_compression() {
        let (cache, _store) = two_tier();
        let payload = vec![7u8; 8192];

        cache.set("blob", payload.clone(), None).await;
        assert_eq!(cache.get("blob").await, Some(payload));
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_to_local() {
        let cache = IntelligentCache::with_distributed_store(
            CacheConfig::default(),
            Arc::new(UnreachableStore),
        );

        assert_eq!(cache.set("k", vec![1], None).await, TierPlacement::LocalOnly);
        assert_eq!(cache.get("k").await, Some(vec![1]));
        assert_eq!(cache.get("other").await, None);

        let stats = cache.stats();
        assert!(stats.distributed_errors >= 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_invalidate_counts_distinct_keys() {
        let (cache, _store) = two_tier();
        cache.warm(
            vec![
                ("lead:42:profile".to_string(), vec![1]),
                ("lead:42:score".to_string(), vec![2]),
                ("lead:7:profile".to_string(), vec![3]),
            ],
            None,
        )
        .await;

        assert_eq!(cache.invalidate("lead:42").await, 2);
        assert_eq!(cache.get("lead:42:profile").await, None);
        assert_eq!(cache.get("lead:7:profile").await, Some(vec![3]));
    }

    #[tokio::test]
    async fn test_get_or_fetch_calls_fetch_once() {
        let cache = IntelligentCache::new(CacheConfig::default());
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_fetch("k", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(b"fetched".to_vec())
                })
                .await
                .unwrap();
            assert_eq!(value, b"fetched".to_vec());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_task_purges_expired_entries() {
        let cache = Arc::new(IntelligentCache::new(CacheConfig {
            cleanup_interval: Duration::from_millis(10),
            ..Default::default()
        }));
        cache
            .set("short", vec![1], Some(Duration::from_millis(5)))
            .await;

        let handle = cache.start_cleanup_task();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.stats().local_entries, 0);
        handle.abort();
    }
}
