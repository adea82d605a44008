//! Engine configuration
//!
//! Defaults, validation, JSON loading and `OPTIMIZER_*` environment overrides.
//! Durations serialize in serde's `{ "secs": .., "nanos": .. }` form.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::engine::TtlPolicy;
use crate::error_handling::{CircuitBreakerConfig, OptimizationError};
use crate::events::EventBusConfig;
use crate::monitoring::MonitoringConfig;
use crate::performance::CacheConfig;
use crate::MAX_DEADLINE;

pub const ENV_LOCAL_CACHE_MAX_SIZE: &str = "OPTIMIZER_LOCAL_CACHE_MAX_SIZE";
pub const ENV_DEFAULT_TTL_SECONDS: &str = "OPTIMIZER_DEFAULT_TTL_SECONDS";
pub const ENV_CIRCUIT_FAILURE_THRESHOLD: &str = "OPTIMIZER_CIRCUIT_FAILURE_THRESHOLD";
pub const ENV_CIRCUIT_RECOVERY_TIMEOUT_SECONDS: &str = "OPTIMIZER_CIRCUIT_RECOVERY_TIMEOUT_SECONDS";
pub const ENV_CIRCUIT_HALF_OPEN_MAX_CALLS: &str = "OPTIMIZER_CIRCUIT_HALF_OPEN_MAX_CALLS";
pub const ENV_EVENT_QUEUE_MAX_SIZE: &str = "OPTIMIZER_EVENT_QUEUE_MAX_SIZE";
pub const ENV_METRIC_RETENTION_SAMPLES: &str = "OPTIMIZER_METRIC_RETENTION_SAMPLES";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Two-tier cache settings
    pub cache: CacheConfig,
    /// Defaults for every per-service circuit breaker
    pub circuit_breaker: CircuitBreakerConfig,
    /// Event queue and handler limits
    pub event_bus: EventBusConfig,
    /// Metric retention, alert thresholds and sampling
    pub monitoring: MonitoringConfig,
    /// Per-operation cache lifetimes
    pub ttl_policy: TtlPolicy,
}

impl EngineConfig {
    /// Rejects settings the components cannot run with.
    pub fn validate(&self) -> Result<(), OptimizationError> {
        let cache = &self.cache;
        if cache.max_local_entries == 0 {
            return Err(OptimizationError::configuration(
                "cache.max_local_entries must be greater than zero",
            ));
        }
        if cache.popularity_threshold == 0 {
            return Err(OptimizationError::configuration(
                "cache.popularity_threshold must be greater than zero",
            ));
        }
        if !(cache.eviction_fraction > 0.0 && cache.eviction_fraction <= 1.0) {
            return Err(OptimizationError::configuration(format!(
                "cache.eviction_fraction must be in (0, 1], got {}",
                cache.eviction_fraction
            )));
        }
        if cache.default_ttl.is_zero() {
            return Err(OptimizationError::configuration(
                "cache.default_ttl must be greater than zero",
            ));
        }
        if cache.access_window.is_zero() || cache.cleanup_interval.is_zero() {
            return Err(OptimizationError::configuration(
                "cache.access_window and cache.cleanup_interval must be greater than zero",
            ));
        }

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return Err(OptimizationError::configuration(
                "circuit_breaker.failure_threshold must be greater than zero",
            ));
        }
        if breaker.half_open_max_calls == 0 {
            return Err(OptimizationError::configuration(
                "circuit_breaker.half_open_max_calls must be greater than zero",
            ));
        }
        if breaker.success_rate_window == 0 {
            return Err(OptimizationError::configuration(
                "circuit_breaker.success_rate_window must be greater than zero",
            ));
        }

        if self.event_bus.max_queue_size == 0 {
            return Err(OptimizationError::configuration(
                "event_bus.max_queue_size must be greater than zero",
            ));
        }
        if self.event_bus.handler_timeout.is_zero() {
            return Err(OptimizationError::configuration(
                "event_bus.handler_timeout must be greater than zero",
            ));
        }

        let monitoring = &self.monitoring;
        if monitoring.metric_retention_samples == 0 {
            return Err(OptimizationError::configuration(
                "monitoring.metric_retention_samples must be greater than zero",
            ));
        }
        if monitoring.sampling_interval.is_zero() {
            return Err(OptimizationError::configuration(
                "monitoring.sampling_interval must be greater than zero",
            ));
        }
        for (metric, threshold) in &monitoring.alert_thresholds {
            if !threshold.is_finite() || *threshold < 0.0 {
                return Err(OptimizationError::configuration(format!(
                    "alert threshold for {} must be a non-negative number, got {}",
                    metric, threshold
                )));
            }
        }

        let durations = [
            ("cache.default_ttl", cache.default_ttl),
            ("cache.access_window", cache.access_window),
            ("cache.cleanup_interval", cache.cleanup_interval),
            ("circuit_breaker.recovery_timeout", breaker.recovery_timeout),
            ("event_bus.handler_timeout", self.event_bus.handler_timeout),
            ("monitoring.sampling_interval", monitoring.sampling_interval),
        ];
        for (name, duration) in durations {
            check_max_duration(name, duration)?;
        }
        for rule in &self.ttl_policy.rules {
            check_max_duration(&format!("ttl_policy rule '{}'", rule.pattern), rule.ttl)?;
        }

        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, OptimizationError> {
        Self::parse(json, "<inline>")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OptimizationError> {
        let path = path.as_ref();
        let source_name = path.display().to_string();

        let contents = std::fs::read_to_string(path).map_err(|e| OptimizationError::ConfigLoad {
            source_name: source_name.clone(),
            message: e.to_string(),
        })?;

        info!("Loading engine configuration from {}", source_name);
        Self::parse(&contents, &source_name)
    }

    fn parse(json: &str, source_name: &str) -> Result<Self, OptimizationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| OptimizationError::ConfigLoad {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `OPTIMIZER_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), OptimizationError> {
        self.apply_env_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, then re-validates.
    pub fn apply_env_overrides_from<L>(&mut self, lookup: L) -> Result<(), OptimizationError>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(size) = parse_var::<usize, _>(&lookup, ENV_LOCAL_CACHE_MAX_SIZE)? {
            self.cache.max_local_entries = size;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_DEFAULT_TTL_SECONDS)? {
            self.cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(threshold) = parse_var::<u32, _>(&lookup, ENV_CIRCUIT_FAILURE_THRESHOLD)? {
            self.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_CIRCUIT_RECOVERY_TIMEOUT_SECONDS)? {
            self.circuit_breaker.recovery_timeout = Duration::from_secs(secs);
        }
        if let Some(calls) = parse_var::<u32, _>(&lookup, ENV_CIRCUIT_HALF_OPEN_MAX_CALLS)? {
            self.circuit_breaker.half_open_max_calls = calls;
        }
        if let Some(size) = parse_var::<usize, _>(&lookup, ENV_EVENT_QUEUE_MAX_SIZE)? {
            self.event_bus.max_queue_size = size;
        }
        if let Some(samples) = parse_var::<usize, _>(&lookup, ENV_METRIC_RETENTION_SAMPLES)? {
            self.monitoring.metric_retention_samples = samples;
        }

        self.validate()
    }
}

fn check_max_duration(name: &str, duration: Duration) -> Result<(), OptimizationError> {
    if duration > MAX_DEADLINE {
        return Err(OptimizationError::configuration(format!(
            "{} must not exceed {}s, got {}s",
            name,
            MAX_DEADLINE.as_secs(),
            duration.as_secs()
        )));
    }
    Ok(())
}

fn parse_var<T, L>(lookup: &L, name: &str) -> Result<Option<T>, OptimizationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    L: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };

    let value = raw
        .trim()
        .parse::<T>()
        .map_err(|e| OptimizationError::ConfigLoad {
            source_name: name.to_string(),
            message: format!("invalid value '{}': {}", raw, e),
        })?;
    debug!("Configuration override {}={}", name, raw.trim());
    Ok(Some(value))
}
