use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const RESPONSE_TIME_SAMPLES: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    /// Number of most recent calls used for `success_rate`.
    pub success_rate_window: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            success_rate_window: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Coarse status reported by [`ServiceHealth`]; half-open reports as open
/// with `is_half_open` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_name: String,
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub success_count: u32,
    pub success_rate: f64,
    pub is_half_open: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Milliseconds until an open circuit admits its first probe.
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitBreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub state_transitions: u64,
    pub average_response_time_ms: f64,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker for service '{service}' is open")]
    CircuitOpen { service: String },
    #[error("operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// The caller's original error, if the operation ran and failed.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::OperationFailed(error) => Some(error),
            Self::CircuitOpen { .. } => None,
        }
    }
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitBreakerState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_at: Option<Instant>,
    recent_outcomes: VecDeque<bool>,
    response_times: VecDeque<Duration>,
    total_requests: u64,
    rejected_requests: u64,
    state_transitions: u64,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            last_failure_at: None,
            half_open_at: None,
            recent_outcomes: VecDeque::new(),
            response_times: VecDeque::new(),
            total_requests: 0,
            rejected_requests: 0,
            state_transitions: 0,
        }
    }

    fn record_outcome(&mut self, success: bool, elapsed: Duration, window: usize) {
        self.total_requests += 1;

        self.recent_outcomes.push_back(success);
        while self.recent_outcomes.len() > window {
            self.recent_outcomes.pop_front();
        }

        self.response_times.push_back(elapsed);
        if self.response_times.len() > RESPONSE_TIME_SAMPLES {
            self.response_times.pop_front();
        }
    }

    fn success_rate(&self) -> f64 {
        if self.recent_outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.recent_outcomes.iter().filter(|ok| **ok).count();
        successes as f64 / self.recent_outcomes.len() as f64
    }
}

/// Failure-isolation state machine for one downstream service.
///
/// All bookkeeping happens under a single mutex that is never held while the
/// protected operation runs, so concurrent failures cannot both apply the
/// Closed -> Open transition.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
}

/// Releases a half-open trial slot if the protected future is dropped before
/// it settles.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut core = self.breaker.core.lock();
            core.half_open_in_flight = core.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            core: Mutex::new(BreakerCore::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `operation` if the breaker admits the call. The operation is not
    /// invoked at all when the circuit is open.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let trial = match self.try_acquire() {
            Some(trial) => trial,
            None => {
                debug!("Circuit breaker '{}' rejected call", self.name);
                return Err(CircuitBreakerError::CircuitOpen {
                    service: self.name.clone(),
                });
            }
        };

        let mut guard = TrialGuard {
            breaker: self,
            trial,
            settled: false,
        };

        let started = Instant::now();
        let result = operation().await;
        let elapsed = started.elapsed();
        guard.settled = true;

        match result {
            Ok(value) => {
                self.record_success(trial, elapsed);
                Ok(value)
            }
            Err(error) => {
                self.record_failure(trial, elapsed);
                Err(CircuitBreakerError::OperationFailed(error))
            }
        }
    }

    /// Admission decision. `Some(true)` marks a half-open trial call.
    fn try_acquire(&self) -> Option<bool> {
        let mut core = self.core.lock();

        match core.state {
            CircuitBreakerState::Closed => Some(false),
            CircuitBreakerState::Open => {
                let probe_due = core
                    .half_open_at
                    .map_or(true, |half_open_at| Instant::now() >= half_open_at);

                if probe_due {
                    core.state = CircuitBreakerState::HalfOpen;
                    core.success_count = 0;
                    core.half_open_in_flight = 1;
                    core.state_transitions += 1;
                    info!("Circuit breaker '{}' transitioned to HALF-OPEN state", self.name);
                    Some(true)
                } else {
                    core.rejected_requests += 1;
                    None
                }
            }
            CircuitBreakerState::HalfOpen => {
                if core.half_open_in_flight + core.success_count < self.config.half_open_max_calls {
                    core.half_open_in_flight += 1;
                    Some(true)
                } else {
                    core.rejected_requests += 1;
                    None
                }
            }
        }
    }

    fn record_success(&self, trial: bool, elapsed: Duration) {
        let mut core = self.core.lock();
        core.record_outcome(true, elapsed, self.config.success_rate_window);

        if trial {
            core.half_open_in_flight = core.half_open_in_flight.saturating_sub(1);
        }

        match core.state {
            CircuitBreakerState::Closed => {
                core.failure_count = 0;
                core.success_count += 1;
            }
            CircuitBreakerState::HalfOpen if trial => {
                core.success_count += 1;
                if core.success_count >= self.config.half_open_max_calls {
                    self.close(&mut core);
                }
            }
            // Late completion of a call admitted before the circuit tripped.
            _ => {}
        }
    }

    fn record_failure(&self, trial: bool, elapsed: Duration) {
        let mut core = self.core.lock();
        core.record_outcome(false, elapsed, self.config.success_rate_window);
        core.last_failure_at = Some(Utc::now());

        if trial {
            core.half_open_in_flight = core.half_open_in_flight.saturating_sub(1);
        }

        match core.state {
            CircuitBreakerState::Closed => {
                core.failure_count += 1;
                if core.failure_count >= self.config.failure_threshold {
                    self.open(&mut core);
                } else {
                    debug!(
                        "Circuit breaker '{}' recorded failure ({}/{})",
                        self.name, core.failure_count, self.config.failure_threshold
                    );
                }
            }
            CircuitBreakerState::HalfOpen => {
                core.failure_count += 1;
                self.open(&mut core);
            }
            CircuitBreakerState::Open => {
                core.failure_count += 1;
            }
        }
    }

    fn open(&self, core: &mut BreakerCore) {
        core.state = CircuitBreakerState::Open;
        core.success_count = 0;
        core.half_open_in_flight = 0;
        core.half_open_at = Some(crate::deadline_after(
            Instant::now(),
            self.config.recovery_timeout,
        ));
        core.state_transitions += 1;

        warn!(
            "Circuit breaker '{}' transitioned to OPEN state after {} failures, probing again in {:?}",
            self.name, core.failure_count, self.config.recovery_timeout
        );
    }

    fn close(&self, core: &mut BreakerCore) {
        core.state = CircuitBreakerState::Closed;
        core.failure_count = 0;
        core.success_count = 0;
        core.half_open_in_flight = 0;
        core.half_open_at = None;
        core.state_transitions += 1;

        info!("Circuit breaker '{}' transitioned to CLOSED state", self.name);
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.core.lock().state
    }

    pub fn health(&self) -> ServiceHealth {
        let core = self.core.lock();
        let now = Instant::now();

        let retry_in_ms = match (core.state, core.half_open_at) {
            (CircuitBreakerState::Open, Some(half_open_at)) => {
                Some(half_open_at.saturating_duration_since(now).as_millis() as u64)
            }
            _ => None,
        };

        ServiceHealth {
            service_name: self.name.clone(),
            status: match core.state {
                CircuitBreakerState::Closed => CircuitStatus::Closed,
                CircuitBreakerState::Open | CircuitBreakerState::HalfOpen => CircuitStatus::Open,
            },
            failure_count: core.failure_count,
            success_count: core.success_count,
            success_rate: core.success_rate(),
            is_half_open: core.state == CircuitBreakerState::HalfOpen,
            last_failure_at: core.last_failure_at,
            retry_in_ms,
        }
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let core = self.core.lock();

        let average_response_time_ms = if core.response_times.is_empty() {
            0.0
        } else {
            let total: Duration = core.response_times.iter().sum();
            total.as_secs_f64() * 1000.0 / core.response_times.len() as f64
        };

        CircuitBreakerMetrics {
            state: core.state,
            failure_count: core.failure_count,
            success_count: core.success_count,
            total_requests: core.total_requests,
            rejected_requests: core.rejected_requests,
            state_transitions: core.state_transitions,
            average_response_time_ms,
            last_failure_time: core.last_failure_at,
        }
    }

    pub fn force_open(&self) {
        let mut core = self.core.lock();
        self.open(&mut core);
        info!("Circuit breaker '{}' manually forced to OPEN state", self.name);
    }

    pub fn reset(&self) {
        *self.core.lock() = BreakerCore::new();
        info!("Circuit breaker '{}' reset to initial state", self.name);
    }
}

/// Per-service breakers, created lazily on the first protected call.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(breaker.value());
        }

        let breaker = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                info!("Created new circuit breaker: {}", name);
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .value()
            .clone();
        breaker
    }

    /// Runs `operation` under the breaker for `service`.
    pub async fn protect<F, Fut, T, E>(
        &self,
        service: &str,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.get_or_create(service);
        breaker.call(operation).await
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|breaker| Arc::clone(breaker.value()))
    }

    pub fn service_health(&self, name: &str) -> Option<ServiceHealth> {
        self.get(name).map(|breaker| breaker.health())
    }

    pub fn all_service_health(&self) -> Vec<ServiceHealth> {
        let mut health: Vec<ServiceHealth> = self
            .breakers
            .iter()
            .map(|breaker| breaker.value().health())
            .collect();
        health.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        health
    }

    pub fn force_open(&self, name: &str) {
        self.get_or_create(name).force_open();
    }

    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
        info!("Reset all circuit breakers");
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
