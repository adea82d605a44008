use eyre::Result;
use request_optimizer::{
    init_tracing, EngineConfig, EventPayload, EventType, OptimizationEngine, SystemEvent,
};
use request_optimizer::performance::InMemoryDistributedStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lead {
    id: u64,
    company: String,
    score: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,request_optimizer=debug");

    info!("Starting request optimizer demo");

    let mut config = EngineConfig::default();
    config.apply_env_overrides()?;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.recovery_timeout = Duration::from_secs(1);
    config.monitoring.sampling_interval = Duration::from_secs(1);

    let engine = Arc::new(OptimizationEngine::with_distributed_store(
        config,
        Arc::new(InMemoryDistributedStore::new()),
    )?);
    engine.start();

    engine.subscribe(EventType::LeadUpdated, |event: Arc<SystemEvent>| async move {
        info!("Lead update received: {:?}", event.payload);
        Ok::<(), eyre::Report>(())
    });
    engine.subscribe(EventType::AlertRaised, |event: Arc<SystemEvent>| async move {
        warn!("Alert event (priority {}): {:?}", event.priority.value(), event.payload);
        Ok::<(), eyre::Report>(())
    });
    engine.subscribe(EventType::CacheInvalidated, |event: Arc<SystemEvent>| async move {
        info!("Cache invalidated: {:?}", event.payload);
        Ok::<(), eyre::Report>(())
    });

    engine.register_service("crm", || async { true });

    run_cached_reads(&engine).await?;
    run_failing_service(&engine).await;
    run_invalidation(&engine).await;

    sleep(Duration::from_millis(1500)).await;

    let health = engine.get_system_health().await;
    info!(
        "System health: {:?}, cache hit rate {:.2}, open circuits {:?}",
        health.status,
        health.cache.hit_rate(),
        health.open_circuits()
    );

    let report = engine.performance_report(5);
    for recommendation in &report.recommendations {
        info!("Recommendation: {}", recommendation);
    }
    info!("Prometheus export:\n{}", engine.monitor().export_prometheus()?);

    engine.shutdown().await;
    Ok(())
}

async fn run_cached_reads(engine: &OptimizationEngine) -> Result<()> {
    let fetches = AtomicU32::new(0);

    for _ in 0..5 {
        let lead: Lead = engine
            .optimize_request("crm", "getLead", &json!({ "id": 42 }), || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                Ok::<_, String>(Lead {
                    id: 42,
                    company: "Acme".to_string(),
                    score: 87,
                })
            })
            .await
            .map_err(|e| eyre::eyre!("lead lookup failed: {}", e))?;
        info!("Lead {} ({}) scored {}", lead.id, lead.company, lead.score);
    }

    info!(
        "Served 5 reads with {} downstream fetches",
        fetches.load(Ordering::SeqCst)
    );
    Ok(())
}

async fn run_failing_service(engine: &OptimizationEngine) {
    for attempt in 1..=4 {
        let result: Result<Lead, _> = engine
            .optimize_request("scoring", "scoreLead", &json!({ "attempt": attempt }), || async {
                Err::<Lead, _>("scoring backend unavailable".to_string())
            })
            .await;

        match result {
            Ok(_) => info!("Attempt {} succeeded", attempt),
            Err(e) if e.is_circuit_open() => warn!("Attempt {} short-circuited: {}", attempt, e),
            Err(e) => warn!("Attempt {} failed: {}", attempt, e),
        }
    }
}

async fn run_invalidation(engine: &OptimizationEngine) {
    engine.publish_event(
        EventType::LeadUpdated,
        "crm",
        EventPayload::Lead {
            lead_id: "42".to_string(),
            changed_fields: vec!["score".to_string()],
        },
        2,
    );

    let removed = engine.invalidate("crm:getLead").await;
    info!("Invalidated {} cached lead entries", removed);
}
