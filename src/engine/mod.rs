pub mod report;
pub mod ttl;

pub use report::*;
pub use ttl::*;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error_handling::{CircuitBreakerError, CircuitBreakerRegistry, OptimizationError};
use crate::events::{EventBus, EventHandler, EventPayload, EventPriority, EventType, SystemEvent};
use crate::monitoring::{
    spawn_sampler, Alert, AlertSeverity, HealthCheck, HealthStatus, MetricUnit, PerformanceMonitor,
    PerformanceReport, ServiceRegistry, CACHE_HIT_RATIO_METRIC, REQUEST_ERROR_RATE_METRIC,
    REQUEST_LATENCY_METRIC,
};
use crate::performance::{derive_cache_key, CacheCodec, DistributedStore, IntelligentCache, JsonCodec};

const ENGINE_SOURCE: &str = "optimization_engine";
const MONITOR_SOURCE: &str = "performance_monitor";
const HEALTH_SUMMARY_WINDOW: Duration = Duration::from_secs(300);

/// Façade over the cache, circuit breakers, event bus and monitor.
///
/// Construct one per process and share it (usually behind an `Arc`).
/// `optimize_request` wraps a fetch with cache lookup, circuit breaker
/// protection, cache write-back and metric emission.
#[derive(Debug)]
pub struct OptimizationEngine<C: CacheCodec = JsonCodec> {
    config: EngineConfig,
    codec: C,
    cache: Arc<IntelligentCache>,
    breakers: CircuitBreakerRegistry,
    bus: Arc<EventBus>,
    monitor: Arc<PerformanceMonitor>,
    services: ServiceRegistry,
    last_service_health: DashMap<String, bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl OptimizationEngine<JsonCodec> {
    /// Local-only engine with JSON-encoded cache values.
    pub fn new(config: EngineConfig) -> Result<Self, OptimizationError> {
        Self::with_components(config, None, JsonCodec)
    }

    pub fn with_distributed_store(
        config: EngineConfig,
        store: Arc<dyn DistributedStore>,
    ) -> Result<Self, OptimizationError> {
        Self::with_components(config, Some(store), JsonCodec)
    }
}

impl<C: CacheCodec> OptimizationEngine<C> {
    /// Validates `config` and wires the components together. Monitor alerts
    /// are republished on the bus as [`EventType::AlertRaised`].
    pub fn with_components(
        config: EngineConfig,
        store: Option<Arc<dyn DistributedStore>>,
        codec: C,
    ) -> Result<Self, OptimizationError> {
        config.validate()?;

        let cache = Arc::new(match store {
            Some(store) => IntelligentCache::with_distributed_store(config.cache.clone(), store),
            None => IntelligentCache::new(config.cache.clone()),
        });
        let bus = Arc::new(EventBus::new(config.event_bus.clone()));
        let monitor = Arc::new(PerformanceMonitor::new(&config.monitoring));

        let alert_bus = Arc::clone(&bus);
        monitor.on_alert(move |alert: &Alert| {
            alert_bus.publish(alert_event(alert));
        });

        info!(
            "Optimization engine initialized with {} codec",
            codec.name()
        );

        Ok(Self {
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
            services: ServiceRegistry::new(config.monitoring.health_check_timeout),
            last_service_health: DashMap::new(),
            background: Mutex::new(Vec::new()),
            cache,
            bus,
            monitor,
            codec,
            config,
        })
    }

    /// Starts the event loop, the cache sweep and, if enabled, the resource
    /// sampler.
    pub fn start(&self) {
        let mut background = self.background.lock();
        if !background.is_empty() {
            warn!("Optimization engine already started");
            return;
        }

        self.bus.start();
        background.push(self.cache.start_cleanup_task());
        if self.config.monitoring.enable_resource_sampling {
            background.push(spawn_sampler(
                &self.monitor,
                self.config.monitoring.sampling_interval,
            ));
        }

        info!("Optimization engine started {} background tasks", background.len() + 1);
    }

    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.bus.shutdown().await;

        info!("Optimization engine shut down");
    }

    /// Serves `service`/`operation` from cache, or runs `fetch` under the
    /// service's circuit breaker and caches the result.
    ///
    /// Fetch errors come back as [`CircuitBreakerError::OperationFailed`]
    /// carrying the original error; a denied call as
    /// [`CircuitBreakerError::CircuitOpen`].
    pub async fn optimize_request<P, T, E, F, Fut>(
        &self,
        service: &str,
        operation: &str,
        params: &P,
        fetch: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        P: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();

        let key = match derive_cache_key(service, operation, params) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(
                    "Bypassing cache for {}.{}: cannot derive key: {}",
                    service, operation, e
                );
                None
            }
        };

        if let Some(key) = &key {
            if let Some(bytes) = self.cache.get(key).await {
                match self.codec.decode::<T>(&bytes) {
                    Ok(value) => {
                        self.record_hit_ratio(service, operation, 1.0);
                        self.record_latency(service, operation, "cache", started);
                        return Ok(value);
                    }
                    Err(e) => {
                        warn!("Dropping undecodable cache entry {}: {}", key, e);
                        self.cache.remove(key).await;
                    }
                }
            }
        }
        self.record_hit_ratio(service, operation, 0.0);

        match self.breakers.protect(service, fetch).await {
            Ok(value) => {
                if let Some(key) = &key {
                    self.write_back(key, operation, &value).await;
                }
                self.record_latency(service, operation, "service", started);
                self.record_error_rate(service, operation, 0.0, None);
                Ok(value)
            }
            Err(error) => {
                let reason = if error.is_circuit_open() {
                    "circuit_open"
                } else {
                    "fetch_failed"
                };
                debug!("Request {}.{} failed: {}", service, operation, reason);
                self.record_error_rate(service, operation, 1.0, Some(reason));
                Err(error)
            }
        }
    }

    async fn write_back<T: Serialize>(&self, key: &str, operation: &str, value: &T) {
        match self.codec.encode(value) {
            Ok(bytes) => {
                let ttl = self.ttl_for(operation);
                self.cache.set(key, bytes, Some(ttl)).await;
            }
            Err(e) => warn!("Not caching {}: {}", key, e),
        }
    }

    /// Cache lifetime for results of `operation`.
    pub fn ttl_for(&self, operation: &str) -> Duration {
        self.config
            .ttl_policy
            .ttl_for(operation)
            .unwrap_or(self.config.cache.default_ttl)
    }

    fn record_latency(&self, service: &str, operation: &str, source: &str, started: Instant) {
        let mut context = request_context(service, operation);
        context.insert("source".to_string(), source.to_string());
        self.monitor.record_metric(
            REQUEST_LATENCY_METRIC,
            started.elapsed().as_secs_f64() * 1000.0,
            MetricUnit::Milliseconds,
            Some(context),
        );
    }

    fn record_hit_ratio(&self, service: &str, operation: &str, value: f64) {
        self.monitor.record_metric(
            CACHE_HIT_RATIO_METRIC,
            value,
            MetricUnit::Ratio,
            Some(request_context(service, operation)),
        );
    }

    fn record_error_rate(&self, service: &str, operation: &str, value: f64, reason: Option<&str>) {
        let mut context = request_context(service, operation);
        if let Some(reason) = reason {
            context.insert("reason".to_string(), reason.to_string());
        }
        self.monitor.record_metric(
            REQUEST_ERROR_RATE_METRIC,
            value,
            MetricUnit::Ratio,
            Some(context),
        );
    }

    /// Builds and enqueues an event. Returns `false` if the bus dropped it.
    pub fn publish_event(
        &self,
        event_type: EventType,
        source_service: &str,
        payload: EventPayload,
        priority: impl Into<EventPriority>,
    ) -> bool {
        self.bus
            .publish(SystemEvent::new(event_type, source_service, payload).with_priority(priority))
    }

    pub fn publish(&self, event: SystemEvent) -> bool {
        self.bus.publish(event)
    }

    pub fn subscribe<H>(&self, event_type: EventType, handler: H) -> Uuid
    where
        H: EventHandler + 'static,
    {
        self.bus.subscribe(event_type, handler)
    }

    pub fn register_service<H>(&self, name: impl Into<String>, check: H)
    where
        H: HealthCheck + 'static,
    {
        self.services.register(name, check);
    }

    /// Runs every registered health check and bundles component reports.
    /// Services whose health flipped since the previous call are announced
    /// as [`EventType::ServiceHealthChanged`].
    pub async fn get_system_health(&self) -> SystemHealth {
        let services = self.services.check_all().await;
        let failed = services.iter().filter(|service| !service.healthy).count();

        for service in &services {
            let previous = self
                .last_service_health
                .insert(service.name.clone(), service.healthy);
            if previous.is_some_and(|was_healthy| was_healthy != service.healthy) {
                self.bus.publish(
                    SystemEvent::new(
                        EventType::ServiceHealthChanged,
                        ENGINE_SOURCE,
                        EventPayload::ServiceHealth {
                            service_name: service.name.clone(),
                            healthy: service.healthy,
                        },
                    )
                    .with_priority(2),
                );
            }
        }

        let status = HealthStatus::aggregate(services.len(), failed);
        if status != HealthStatus::Healthy {
            warn!(
                "System health is {:?}: {}/{} service checks failing",
                status,
                failed,
                services.len()
            );
        }

        SystemHealth {
            status,
            checked_at: Utc::now(),
            services,
            cache: self.cache.stats(),
            circuit_breakers: self.breakers.all_service_health(),
            event_bus: self.bus.stats(),
            monitoring: self.monitor.summary(HEALTH_SUMMARY_WINDOW),
        }
    }

    /// Removes cached entries whose key contains `pattern` and announces the
    /// invalidation on the bus.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let removed = self.cache.invalidate(pattern).await;

        self.bus.publish(SystemEvent::new(
            EventType::CacheInvalidated,
            ENGINE_SOURCE,
            EventPayload::CacheInvalidation {
                pattern: pattern.to_string(),
                removed,
            },
        ));
        removed
    }

    pub fn performance_report(&self, window_minutes: u64) -> PerformanceReport {
        self.monitor.performance_report(window_minutes)
    }

    pub fn cache(&self) -> &Arc<IntelligentCache> {
        &self.cache
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }
}

fn request_context(service: &str, operation: &str) -> HashMap<String, String> {
    HashMap::from([
        ("service".to_string(), service.to_string()),
        ("operation".to_string(), operation.to_string()),
    ])
}

fn alert_event(alert: &Alert) -> SystemEvent {
    let priority = match alert.severity {
        AlertSeverity::Critical => 1,
        AlertSeverity::Warning => 3,
    };

    let mut event = SystemEvent::new(
        EventType::AlertRaised,
        MONITOR_SOURCE,
        EventPayload::Alert {
            metric_name: alert.metric_name.clone(),
            value: alert.value,
            threshold: alert.threshold,
            severity: alert.severity.to_string(),
        },
    )
    .with_priority(priority);
    event.correlation_id = Some(alert.id.to_string());
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::{BincodeCodec, InMemoryDistributedStore};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    fn quiet_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.monitoring.enable_resource_sampling = false;
        config
    }

    #[tokio::test]
    async fn test_optimize_request_caches_result() {
        let engine = OptimizationEngine::new(quiet_config()).unwrap();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let user: User = engine
                .optimize_request("db", "getUser", &json!({"id": 7}), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(User {
                        id: 7,
                        name: "Ada".to_string(),
                    })
                })
                .await
                .unwrap();
            assert_eq!(user.id, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.monitor().latest(CACHE_HIT_RATIO_METRIC), Some(1.0));
    }

    #[tokio::test]
    async fn test_fetch_error_propagates_unchanged() {
        let engine = OptimizationEngine::new(quiet_config()).unwrap();

        let result: Result<User, _> = engine
            .optimize_request("crm", "getLead", &json!({"id": 1}), || async {
                Err::<User, _>("crm timeout".to_string())
            })
            .await;

        assert_eq!(
            result.unwrap_err().into_operation_error(),
            Some("crm timeout".to_string())
        );
        assert_eq!(engine.monitor().latest(REQUEST_ERROR_RATE_METRIC), Some(1.0));
        assert_eq!(engine.cache().stats().local_entries, 0);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_fetch() {
        let mut config = quiet_config();
        config.circuit_breaker.failure_threshold = 2;
        let engine = OptimizationEngine::new(config).unwrap();

        for id in 0..2 {
            let _: Result<User, _> = engine
                .optimize_request("crm", "getLead", &json!({ "id": id }), || async {
                    Err::<User, _>("down")
                })
                .await;
        }

        let calls = AtomicUsize::new(0);
        let result: Result<User, CircuitBreakerError<&str>> = engine
            .optimize_request("crm", "getLead", &json!({"id": 99}), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<User, &str>(User {
                    id: 99,
                    name: "never".to_string(),
                })
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ttl_policy_applies_to_operations() {
        let engine = OptimizationEngine::new(quiet_config()).unwrap();

        assert_eq!(engine.ttl_for("get_market_data"), Duration::from_secs(7200));
        assert_eq!(engine.ttl_for("getUser"), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_alerts_are_republished_on_bus() {
        let engine = OptimizationEngine::new(quiet_config()).unwrap();
        engine.monitor().record_metric(
            REQUEST_LATENCY_METRIC,
            5000.0,
            MetricUnit::Milliseconds,
            None,
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.subscribe(EventType::AlertRaised, move |event: Arc<SystemEvent>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(event.priority.value());
                Ok::<(), eyre::Report>(())
            }
        });

        assert!(engine.event_bus().process_next().await);
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_system_health_aggregation() {
        let engine = OptimizationEngine::new(quiet_config()).unwrap();
        engine.register_service("db", || async { true });
        engine.register_service("crm", || async { false });
        engine.register_service("search", || async { false });

        let health = engine.get_system_health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.failed_services(), vec!["crm", "search"]);

        engine.register_service("search", || async { true });
        let health = engine.get_system_health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.event_bus.queue_depth, 1);
    }

    #[tokio::test]
    async fn test_invalidate_publishes_event() {
        let engine = OptimizationEngine::new(quiet_config()).unwrap();
        engine
            .cache()
            .set("lead:42:profile", b"{}".to_vec(), None)
            .await;

        assert_eq!(engine.invalidate("lead:42").await, 1);
        assert_eq!(engine.event_bus().stats().queue_depth, 1);
    }

    #[tokio::test]
    async fn test_bincode_engine_with_distributed_store() {
        let store = Arc::new(InMemoryDistributedStore::new());
        let shared: Arc<dyn DistributedStore> = store.clone();
        let engine =
            OptimizationEngine::with_components(quiet_config(), Some(shared), BincodeCodec).unwrap();

        let user: User = engine
            .optimize_request("db", "getUser", &json!({"id": 3}), || async {
                Ok::<_, String>(User {
                    id: 3,
                    name: "Grace".to_string(),
                })
            })
            .await
            .unwrap();

        assert_eq!(user.name, "Grace");
        assert_eq!(store.len(), 1);
        assert_eq!(engine.codec().name(), "bincode");
    }

    #[tokio::test]
    async fn test_invalid_config_fails_construction() {
        let mut config = quiet_config();
        config.cache.max_local_entries = 0;

        let err = OptimizationEngine::new(config).unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let engine = OptimizationEngine::new(quiet_config()).unwrap();
        engine.start();
        engine.start();

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        engine.subscribe(EventType::TaskCreated, move |_event: Arc<SystemEvent>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), eyre::Report>(())
            }
        });
        engine.publish_event(
            EventType::TaskCreated,
            "tests",
            EventPayload::Task {
                task_id: "t-1".to_string(),
                status: "open".to_string(),
            },
            4,
        );

        for _ in 0..50 {
            if delivered.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        engine.shutdown().await;
    }
}
