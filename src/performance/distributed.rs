use async_trait::async_trait;
use dashmap::DashMap;
use eyre::Result;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Shared key/value store backing the distributed cache tier.
///
/// Values are opaque bytes; expiry is the store's responsibility.
#[async_trait]
pub trait DistributedStore: fmt::Debug + Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Deletes every key containing `pattern` and returns the deleted keys.
    async fn delete_matching(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Process-local stand-in for a shared store, used in tests and
/// single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryDistributedStore {
    entries: DashMap<String, (Vec<u8>, Instant)>,
}

impl InMemoryDistributedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map_or(false, |entry| entry.value().1 > Instant::now())
    }
}

#[async_trait]
impl DistributedStore for InMemoryDistributedStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.value().1 > now => return Ok(Some(entry.value().0.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
            debug!("Distributed entry expired: {}", key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let expires_at = crate::deadline_after(Instant::now(), ttl);
        self.entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().contains(pattern))
            .map(|entry| entry.key().clone())
            .collect();

        Ok(matching
            .into_iter()
            .filter(|key| self.entries.remove(key).is_some())
            .collect())
    }
}
