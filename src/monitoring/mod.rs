pub mod alerts;
pub mod health;
pub mod performance;
pub mod sampler;

pub use alerts::*;
pub use health::*;
pub use performance::*;
pub use sampler::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const REQUEST_LATENCY_METRIC: &str = "request_latency_ms";
pub const CACHE_HIT_RATIO_METRIC: &str = "cache_hit_ratio";
pub const REQUEST_ERROR_RATE_METRIC: &str = "request_error_rate";
pub const CPU_PERCENT_METRIC: &str = "system.cpu_percent";
pub const MEMORY_PERCENT_METRIC: &str = "system.memory_percent";
pub const NETWORK_RECEIVED_METRIC: &str = "system.network_bytes_received";
pub const NETWORK_SENT_METRIC: &str = "system.network_bytes_sent";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub metric_retention_samples: usize,
    /// Metric name to the value above which an alert fires
    pub alert_thresholds: HashMap<String, f64>,
    pub max_alerts: usize,
    pub sampling_interval: Duration,
    pub enable_resource_sampling: bool,
    pub health_check_timeout: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        let alert_thresholds = HashMap::from([
            (REQUEST_LATENCY_METRIC.to_string(), 1000.0),
            (CPU_PERCENT_METRIC.to_string(), 90.0),
            (MEMORY_PERCENT_METRIC.to_string(), 85.0),
        ]);

        Self {
            metric_retention_samples: 1000,
            alert_thresholds,
            max_alerts: 1000,
            sampling_interval: Duration::from_secs(30),
            enable_resource_sampling: true,
            health_check_timeout: Duration::from_secs(5),
        }
    }
}
