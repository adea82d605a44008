use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Networks, System};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{
    MetricUnit, PerformanceMonitor, CPU_PERCENT_METRIC, MEMORY_PERCENT_METRIC,
    NETWORK_RECEIVED_METRIC, NETWORK_SENT_METRIC,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Bytes received on all interfaces since the previous sample
    pub network_bytes_received: u64,
    /// Bytes sent on all interfaces since the previous sample
    pub network_bytes_sent: u64,
}

/// Host resource sampler.
pub struct SystemSampler {
    system: System,
    networks: Networks,
}

impl std::fmt::Debug for SystemSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemSampler").finish_non_exhaustive()
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
        }
    }

    pub fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.networks.refresh();

        let total_memory = self.system.total_memory();
        let memory_percent = if total_memory > 0 {
            self.system.used_memory() as f64 / total_memory as f64 * 100.0
        } else {
            0.0
        };

        let (network_bytes_received, network_bytes_sent) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.received(), tx + data.transmitted())
            });

        ResourceSample {
            cpu_percent: self.system.global_cpu_info().cpu_usage() as f64,
            memory_percent,
            network_bytes_received,
            network_bytes_sent,
        }
    }

    /// Takes a sample and records it through the monitor's normal path.
    pub fn record_into(&mut self, monitor: &PerformanceMonitor) -> ResourceSample {
        let sample = self.sample();

        monitor.record_metric(CPU_PERCENT_METRIC, sample.cpu_percent, MetricUnit::Percent, None);
        monitor.record_metric(
            MEMORY_PERCENT_METRIC,
            sample.memory_percent,
            MetricUnit::Percent,
            None,
        );
        monitor.record_metric(
            NETWORK_RECEIVED_METRIC,
            sample.network_bytes_received as f64,
            MetricUnit::Bytes,
            None,
        );
        monitor.record_metric(
            NETWORK_SENT_METRIC,
            sample.network_bytes_sent as f64,
            MetricUnit::Bytes,
            None,
        );

        debug!(
            "Resource sample: cpu {:.1}%, memory {:.1}%",
            sample.cpu_percent, sample.memory_percent
        );
        sample
    }
}

/// Samples host resources every `interval` until the monitor is dropped or
/// the handle is aborted.
pub fn spawn_sampler(monitor: &Arc<PerformanceMonitor>, interval: Duration) -> JoinHandle<()> {
    let monitor = Arc::downgrade(monitor);

    tokio::spawn(async move {
        info!("Resource sampler started with interval {:?}", interval);
        let mut sampler = SystemSampler::new();
        let mut interval_timer = tokio::time::interval(interval);
        interval_timer.tick().await;

        loop {
            interval_timer.tick().await;
            match monitor.upgrade() {
                Some(monitor) => {
                    sampler.record_into(&monitor);
                }
                None => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::MonitoringConfig;

    #[test]
    fn test_sample_records_all_resource_metrics() {
        let monitor = PerformanceMonitor::new(&MonitoringConfig::default());
        let mut sampler = SystemSampler::new();

        let sample = sampler.record_into(&monitor);

        assert!((0.0..=100.0).contains(&sample.memory_percent));
        for name in [
            CPU_PERCENT_METRIC,
            MEMORY_PERCENT_METRIC,
            NETWORK_RECEIVED_METRIC,
            NETWORK_SENT_METRIC,
        ] {
            assert!(monitor.latest(name).is_some(), "missing {}", name);
        }
    }
}
