use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::eyre;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

use request_optimizer::{
    config::EngineConfig,
    engine::OptimizationEngine,
    error_handling::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState},
    events::{EventBus, EventBusConfig, EventPayload, EventType, SystemEvent},
    performance::{
        derive_cache_key, CacheConfig, EvictionStrategy, InMemoryDistributedStore,
        IntelligentCache,
    },
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u64,
    name: String,
}

fn test_engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.monitoring.enable_resource_sampling = false;
    config
}

fn breaker_config(failure_threshold: u32, recovery: Duration, half_open_max_calls: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        recovery_timeout: recovery,
        half_open_max_calls,
        ..Default::default()
    }
}

fn recording_handler(
    seen: Arc<Mutex<Vec<u8>>>,
) -> impl Fn(Arc<SystemEvent>) -> futures::future::Ready<eyre::Result<()>> + Send + Sync {
    move |event: Arc<SystemEvent>| {
        seen.lock().push(event.priority.value());
        futures::future::ready(Ok(()))
    }
}

fn task_event(priority: u8) -> SystemEvent {
    SystemEvent::new(
        EventType::TaskCreated,
        "integration",
        EventPayload::Task {
            task_id: format!("task-{}", priority),
            status: "open".to_string(),
        },
    )
    .with_priority(priority)
}

#[test]
fn test_cache_key_ignores_insertion_order() {
    let first = json!({ "id": 7, "filters": { "region": "eu", "active": true } });
    let second = json!({ "filters": { "active": true, "region": "eu" }, "id": 7 });

    let a = derive_cache_key("db", "getUser", &first).unwrap();
    let b = derive_cache_key("db", "getUser", &second).unwrap();

    assert_eq!(a, b);
    assert!(a.starts_with("db:getUser:"));
    assert_ne!(a, derive_cache_key("db", "getLead", &first).unwrap());
}

proptest! {
    #[test]
    fn prop_cache_key_is_order_independent(
        entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12)
    ) {
        let forward: serde_json::Map<String, serde_json::Value> = entries
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();
        let reversed: serde_json::Map<String, serde_json::Value> = entries
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();

        let a = derive_cache_key("svc", "op", &forward).unwrap();
        let b = derive_cache_key("svc", "op", &reversed).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_events_dequeue_by_priority(priorities in proptest::collection::vec(1u8..=10, 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let dequeued = runtime.block_on(async {
            let bus = EventBus::new(EventBusConfig::default());
            let seen = Arc::new(Mutex::new(Vec::new()));
            bus.subscribe(EventType::TaskCreated, recording_handler(Arc::clone(&seen)));

            for priority in &priorities {
                assert!(bus.publish(task_event(*priority)));
            }
            while bus.process_next().await {}

            let seen = seen.lock().clone();
            seen
        });

        let mut expected = priorities.clone();
        expected.sort_unstable();
        prop_assert_eq!(dequeued, expected);
    }
}

#[tokio::test]
async fn test_ttl_expiry_is_a_miss() {
    let cache = IntelligentCache::new(CacheConfig::default());
    cache
        .set("session:1", b"token".to_vec(), Some(Duration::from_secs(1)))
        .await;
    assert_eq!(cache.get("session:1").await, Some(b"token".to_vec()));

    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(cache.get("session:1").await, None);
    assert_eq!(cache.stats().expirations, 1);
}

#[tokio::test]
async fn test_aggressive_eviction_keeps_hot_entries() {
    const CAPACITY: usize = 100;
    const HOT: usize = 10;

    let cache = IntelligentCache::new(CacheConfig {
        max_local_entries: CAPACITY,
        eviction_strategy: EvictionStrategy::Aggressive,
        ..Default::default()
    });

    for i in 0..CAPACITY {
        cache.set(&format!("entry:{}", i), vec![i as u8], None).await;
    }
    for i in 0..CAPACITY {
        let reads = if i >= CAPACITY - HOT { 5 } else { 1 };
        for _ in 0..reads {
            assert!(cache.get(&format!("entry:{}", i)).await.is_some());
        }
    }

    cache.set("entry:overflow", vec![0], None).await;

    let hot_kept = (CAPACITY - HOT..CAPACITY)
        .filter(|i| cache.contains_local(&format!("entry:{}", i)))
        .count();
    let cold_kept = (0..CAPACITY - HOT)
        .filter(|i| cache.contains_local(&format!("entry:{}", i)))
        .count();

    assert!(hot_kept * 10 >= HOT * 9, "hot entries kept: {}", hot_kept);
    assert!(cold_kept * 5 < CAPACITY - HOT, "cold entries kept: {}", cold_kept);
    assert!(cache.contains_local("entry:overflow"));
    assert!(cache.stats().local_entries <= CAPACITY);
}

#[tokio::test]
async fn test_invalidation_removes_matching_keys() {
    let store = Arc::new(InMemoryDistributedStore::new());
    let cache = IntelligentCache::with_distributed_store(CacheConfig::default(), store.clone());

    cache.set("lead:42:profile", b"{}".to_vec(), None).await;
    cache.set("lead:420:profile", b"{}".to_vec(), None).await;
    cache.set("lead:7:profile", b"{}".to_vec(), None).await;

    assert_eq!(cache.invalidate("lead:42").await, 2);
    assert_eq!(cache.get("lead:42:profile").await, None);
    assert!(cache.get("lead:7:profile").await.is_some());
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_breaker_opens_after_threshold() {
    let registry = CircuitBreakerRegistry::new(breaker_config(3, Duration::from_secs(60), 1));

    for _ in 0..3 {
        let result = registry
            .protect("payments", || async { Err::<(), _>("unavailable") })
            .await;
        assert!(!result.unwrap_err().is_circuit_open());
    }

    let invoked = AtomicUsize::new(0);
    let result = registry
        .protect("payments", || async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<(), &str>(())
        })
        .await;

    assert!(result.unwrap_err().is_circuit_open());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    // Other services are unaffected.
    assert!(registry
        .protect("search", || async { Ok::<u32, &str>(1) })
        .await
        .is_ok());
}

#[tokio::test]
async fn test_breaker_recovers_and_reopens() {
    let registry = CircuitBreakerRegistry::new(breaker_config(1, Duration::from_millis(50), 2));

    let _ = registry
        .protect("crm", || async { Err::<(), _>("boom") })
        .await;
    let breaker = registry.get("crm").unwrap();
    assert_eq!(breaker.state(), CircuitBreakerState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;

    registry
        .protect("crm", || async { Ok::<(), &str>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
    registry
        .protect("crm", || async { Ok::<(), &str>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitBreakerState::Closed);

    let _ = registry
        .protect("crm", || async { Err::<(), _>("boom") })
        .await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    registry
        .protect("crm", || async { Ok::<(), &str>(()) })
        .await
        .unwrap();
    let _ = registry
        .protect("crm", || async { Err::<(), _>("still broken") })
        .await;
    assert_eq!(breaker.state(), CircuitBreakerState::Open);
}

#[tokio::test]
async fn test_priority_dequeue_order() {
    let bus = EventBus::new(EventBusConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(EventType::TaskCreated, recording_handler(Arc::clone(&seen)));

    for priority in [5, 1, 3] {
        bus.publish(task_event(priority));
    }
    while bus.process_next().await {}

    assert_eq!(*seen.lock(), vec![1, 3, 5]);
}

#[tokio::test]
async fn test_failing_handler_is_isolated() {
    let bus = EventBus::new(EventBusConfig::default());
    let delivered = Arc::new(AtomicUsize::new(0));

    bus.subscribe(EventType::LeadUpdated, |_event: Arc<SystemEvent>| async {
        Err::<(), _>(eyre!("scoring service rejected lead"))
    });
    let counter = Arc::clone(&delivered);
    bus.subscribe(EventType::LeadUpdated, move |_event: Arc<SystemEvent>| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), eyre::Report>(())
        }
    });

    assert!(bus.publish(SystemEvent::new(
        EventType::LeadUpdated,
        "crm",
        EventPayload::Lead {
            lead_id: "42".to_string(),
            changed_fields: vec!["score".to_string()],
        },
    )));
    assert!(bus.process_next().await);

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    let stats = bus.stats();
    assert_eq!(stats.total_processed, 1);
    assert_eq!(stats.total_errors, 1);
    assert_eq!(bus.failed_events(10).len(), 1);
}

#[tokio::test]
async fn test_optimize_request_end_to_end() {
    let engine = OptimizationEngine::new(test_engine_config()).unwrap();
    let fetches = AtomicUsize::new(0);

    let fetch = || async {
        fetches.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(User {
            id: 7,
            name: "Ada".to_string(),
        })
    };

    let first: User = engine
        .optimize_request("db", "getUser", &json!({ "id": 7 }), fetch)
        .await
        .unwrap();
    let second: User = engine
        .optimize_request("db", "getUser", &json!({ "id": 7 }), fetch)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let report = engine.performance_report(5);
    assert!(report.metrics.contains_key("request_latency_ms"));
    assert!(report.metrics.contains_key("cache_hit_ratio"));
}

#[tokio::test]
async fn test_overlong_durations_fail_at_construction() {
    let mut config = test_engine_config();
    config.cache.default_ttl = Duration::MAX;
    assert!(OptimizationEngine::new(config).unwrap_err().is_configuration());

    let mut config = test_engine_config();
    config.circuit_breaker.recovery_timeout = Duration::from_secs(u64::MAX);
    assert!(OptimizationEngine::new(config).unwrap_err().is_configuration());

    let mut config = test_engine_config();
    config.cache.default_ttl = request_optimizer::MAX_DEADLINE;
    config.circuit_breaker.recovery_timeout = request_optimizer::MAX_DEADLINE;
    config.circuit_breaker.failure_threshold = 1;
    let engine = OptimizationEngine::new(config).unwrap();

    let user: User = engine
        .optimize_request("db", "getUser", &json!({ "id": 1 }), || async {
            Ok::<_, String>(User {
                id: 1,
                name: "Grace".to_string(),
            })
        })
        .await
        .unwrap();
    assert_eq!(user.id, 1);

    let failed: Result<User, _> = engine
        .optimize_request("db", "getUser", &json!({ "id": 2 }), || async {
            Err::<User, _>("down".to_string())
        })
        .await;
    assert!(!failed.unwrap_err().is_circuit_open());
}

#[tokio::test]
async fn test_engine_invalidation_forces_refetch() {
    let store = Arc::new(InMemoryDistributedStore::new());
    let engine = OptimizationEngine::with_distributed_store(test_engine_config(), store).unwrap();
    let fetches = AtomicUsize::new(0);

    let fetch = || async {
        fetches.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(User {
            id: 42,
            name: "Lin".to_string(),
        })
    };

    for _ in 0..2 {
        let _: User = engine
            .optimize_request("crm", "getLead", &json!({ "id": 42 }), fetch)
            .await
            .unwrap();
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    assert_eq!(engine.invalidate("crm:getLead").await, 1);

    let _: User = engine
        .optimize_request("crm", "getLead", &json!({ "id": 42 }), fetch)
        .await
        .unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}
