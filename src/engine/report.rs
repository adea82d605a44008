use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error_handling::ServiceHealth;
use crate::events::EventBusStats;
use crate::monitoring::{HealthStatus, MonitoringSummary, ServiceCheckResult};
use crate::performance::CacheStats;

/// Point-in-time health of the engine and its registered services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub services: Vec<ServiceCheckResult>,
    pub cache: CacheStats,
    pub circuit_breakers: Vec<ServiceHealth>,
    pub event_bus: EventBusStats,
    pub monitoring: MonitoringSummary,
}

impl SystemHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn failed_services(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|service| !service.healthy)
            .map(|service| service.name.as_str())
            .collect()
    }

    pub fn open_circuits(&self) -> Vec<&str> {
        self.circuit_breakers
            .iter()
            .filter(|breaker| breaker.status == crate::error_handling::CircuitStatus::Open)
            .map(|breaker| breaker.service_name.as_str())
            .collect()
    }
}
