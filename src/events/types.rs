//! Event types carried by the event bus

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Kinds of domain events routed through the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskUpdated,
    TaskCompleted,
    LeadCreated,
    LeadUpdated,
    LeadScored,
    /// Threshold breach republished from the performance monitor
    AlertRaised,
    /// Pattern invalidation performed through the engine
    CacheInvalidated,
    ServiceHealthChanged,
    /// Application-defined event type
    Custom(String),
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskCreated => write!(f, "task_created"),
            Self::TaskUpdated => write!(f, "task_updated"),
            Self::TaskCompleted => write!(f, "task_completed"),
            Self::LeadCreated => write!(f, "lead_created"),
            Self::LeadUpdated => write!(f, "lead_updated"),
            Self::LeadScored => write!(f, "lead_scored"),
            Self::AlertRaised => write!(f, "alert_raised"),
            Self::CacheInvalidated => write!(f, "cache_invalidated"),
            Self::ServiceHealthChanged => write!(f, "service_health_changed"),
            Self::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// Dispatch priority, 1 (highest) to 10 (lowest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u8")]
pub struct EventPriority(u8);

impl EventPriority {
    pub const HIGHEST: Self = Self(1);
    pub const NORMAL: Self = Self(5);
    pub const LOWEST: Self = Self(10);

    /// Clamps `value` into 1..=10
    pub fn new(value: u8) -> Self {
        Self(value.clamp(Self::HIGHEST.0, Self::LOWEST.0))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for EventPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<u8> for EventPriority {
    fn from(value: u8) -> Self {
        Self::new(value)
    }
}

/// Typed event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Task {
        task_id: String,
        status: String,
    },
    Lead {
        lead_id: String,
        changed_fields: Vec<String>,
    },
    Alert {
        metric_name: String,
        value: f64,
        threshold: f64,
        severity: String,
    },
    CacheInvalidation {
        pattern: String,
        removed: usize,
    },
    ServiceHealth {
        service_name: String,
        healthy: bool,
    },
    /// Free-form payload for events without a fixed shape
    Generic {
        data: HashMap<String, Value>,
    },
    Empty,
}

/// A published domain event.
///
/// Immutable once published: the bus hands every handler the same
/// `Arc<SystemEvent>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// Routing key for subscribers
    pub event_type: EventType,
    /// Service that produced the event
    pub source_service: String,
    /// Event data
    pub payload: EventPayload,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Optional identifier tying related events together
    pub correlation_id: Option<String>,
    /// Dispatch priority
    pub priority: EventPriority,
}

impl SystemEvent {
    /// Create a new event with normal priority
    pub fn new(event_type: EventType, source_service: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source_service: source_service.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
            priority: EventPriority::default(),
        }
    }

    pub fn with_priority(mut self, priority: impl Into<EventPriority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Subscriber callback for bus events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<SystemEvent>) -> eyre::Result<()>;

    /// Name used in logs and failure records
    fn name(&self) -> &str {
        "anonymous"
    }
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<SystemEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<SystemEvent>) -> eyre::Result<()> {
        (self)(event).await
    }
}

/// Record of an event whose handler failed, timed out or panicked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEvent {
    pub event: SystemEvent,
    pub handler: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
