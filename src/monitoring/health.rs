use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> bool;
}

#[async_trait]
impl<F, Fut> HealthCheck for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn check(&self) -> bool {
        (self)().await
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Unhealthy when more than half the checks failed, degraded when any
    /// did. No checks at all counts as healthy.
    pub fn aggregate(total: usize, failed: usize) -> Self {
        if failed == 0 {
            Self::Healthy
        } else if failed * 2 > total {
            Self::Unhealthy
        } else {
            Self::Degraded
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCheckResult {
    pub name: String,
    pub healthy: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Named health checks polled on demand.
pub struct ServiceRegistry {
    checks: DashMap<String, Arc<dyn HealthCheck>>,
    timeout: Duration,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.checks.iter().map(|c| c.key().clone()).collect();
        names.sort();
        f.debug_struct("ServiceRegistry")
            .field("services", &names)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            checks: DashMap::new(),
            timeout,
        }
    }

    /// Registers or replaces the check for `name`.
    pub fn register<H>(&self, name: impl Into<String>, check: H)
    where
        H: HealthCheck + 'static,
    {
        let name = name.into();
        info!("Registered health check for service: {}", name);
        self.checks.insert(name, Arc::new(check));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.checks.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Runs every check concurrently. A check that times out or panics is
    /// reported unhealthy.
    pub async fn check_all(&self) -> Vec<ServiceCheckResult> {
        let checks: Vec<(String, Arc<dyn HealthCheck>)> = self
            .checks
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let timeout = self.timeout;
        let runs = checks.into_iter().map(|(name, check)| async move {
            let started = Instant::now();
            let task = tokio::spawn(async move { tokio::time::timeout(timeout, check.check()).await });

            let (healthy, error) = match task.await {
                Ok(Ok(healthy)) => (healthy, None),
                Ok(Err(_)) => (false, Some(format!("timed out after {:?}", timeout))),
                Err(e) => (false, Some(format!("check failed: {}", e))),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            if healthy {
                debug!("Health check '{}' passed in {}ms", name, duration_ms);
            } else {
                warn!("Health check '{}' failed: {:?}", name, error);
            }

            ServiceCheckResult {
                name,
                healthy,
                duration_ms,
                error,
            }
        });

        let mut results = join_all(runs).await;
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_aggregation() {
        assert_eq!(HealthStatus::aggregate(0, 0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::aggregate(4, 0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::aggregate(4, 1), HealthStatus::Degraded);
        assert_eq!(HealthStatus::aggregate(4, 2), HealthStatus::Degraded);
        assert_eq!(HealthStatus::aggregate(4, 3), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::aggregate(1, 1), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_check_all_reports_each_service() {
        let registry = ServiceRegistry::new(Duration::from_millis(50));
        registry.register("db", || async { true });
        registry.register("crm", || async { false });
        registry.register("slow", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            true
        });

        let results = registry.check_all().await;
        let summary: Vec<(&str, bool)> = results
            .iter()
            .map(|result| (result.name.as_str(), result.healthy))
            .collect();

        assert_eq!(summary, vec![("crm", false), ("db", true), ("slow", false)]);
        assert!(results[2].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_register_replaces_existing_check() {
        let registry = ServiceRegistry::new(Duration::from_secs(1));
        registry.register("db", || async { false });
        registry.register("db", || async { true });

        assert_eq!(registry.len(), 1);
        assert!(registry.check_all().await[0].healthy);
        assert!(registry.unregister("db"));
        assert!(registry.is_empty());
    }
}
