use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    Alert, AlertLog, AlertSeverity, AlertSink, LogAlertSink, MonitoringConfig, CPU_PERCENT_METRIC,
    MEMORY_PERCENT_METRIC,
};
use crate::error_handling::OptimizationError;

const PROMETHEUS_PREFIX: &str = "optimizer_";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Milliseconds,
    Percent,
    Bytes,
    Count,
    Ratio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub name: String,
    pub value: f64,
    pub unit: MetricUnit,
    pub timestamp: DateTime<Utc>,
    pub context: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub latest: f64,
    pub unit: MetricUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub window_minutes: u64,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
}

/// Compact monitor status used in system health reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSummary {
    pub tracked_metrics: usize,
    pub samples_recorded: u64,
    pub alerts_raised: u64,
    pub recent_alerts: usize,
    pub recent_critical_alerts: usize,
}

/// Rolling per-metric sample rings with threshold alerting.
///
/// Each metric name has its own ring guarded by its map shard, so writers
/// to different metrics rarely contend. Trimming happens one sample at a
/// time on push.
pub struct PerformanceMonitor {
    retention: usize,
    series: DashMap<String, VecDeque<PerformanceMetric>>,
    thresholds: DashMap<String, f64>,
    alerts: Mutex<AlertLog>,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
    samples_recorded: AtomicU64,
}

impl fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("retention", &self.retention)
            .field("tracked_metrics", &self.series.len())
            .field("thresholds", &self.thresholds.len())
            .field("sinks", &self.sinks.read().len())
            .field("samples_recorded", &self.samples_recorded)
            .finish()
    }
}

impl PerformanceMonitor {
    pub fn new(config: &MonitoringConfig) -> Self {
        let thresholds = DashMap::new();
        for (name, threshold) in &config.alert_thresholds {
            thresholds.insert(name.clone(), *threshold);
        }

        let sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];

        Self {
            retention: config.metric_retention_samples,
            series: DashMap::new(),
            thresholds,
            alerts: Mutex::new(AlertLog::new(config.max_alerts)),
            sinks: RwLock::new(sinks),
            samples_recorded: AtomicU64::new(0),
        }
    }

    /// Appends a sample and checks it against the metric's threshold.
    /// Returns the alert if one was raised.
    pub fn record_metric(
        &self,
        name: &str,
        value: f64,
        unit: MetricUnit,
        context: Option<HashMap<String, String>>,
    ) -> Option<Alert> {
        let context = context.unwrap_or_default();

        {
            let mut ring = self.series.entry(name.to_string()).or_default();
            ring.push_back(PerformanceMetric {
                name: name.to_string(),
                value,
                unit,
                timestamp: Utc::now(),
                context: context.clone(),
            });
            if ring.len() > self.retention {
                ring.pop_front();
            }
        }
        self.samples_recorded.fetch_add(1, Ordering::Relaxed);

        let threshold = self.thresholds.get(name).map(|t| *t.value())?;
        if value <= threshold {
            return None;
        }

        let alert = Alert::new(name, value, threshold, context);
        self.alerts.lock().push(alert.clone());

        let sinks: Vec<Arc<dyn AlertSink>> = self.sinks.read().clone();
        for sink in sinks {
            sink.on_alert(&alert);
        }

        Some(alert)
    }

    /// Registers an additional alert listener.
    pub fn on_alert<S>(&self, sink: S)
    where
        S: AlertSink + 'static,
    {
        self.sinks.write().push(Arc::new(sink));
    }

    pub fn set_threshold(&self, name: impl Into<String>, threshold: f64) {
        let name = name.into();
        debug!("Alert threshold for {} set to {}", name, threshold);
        self.thresholds.insert(name, threshold);
    }

    pub fn remove_threshold(&self, name: &str) -> Option<f64> {
        self.thresholds.remove(name).map(|(_, threshold)| threshold)
    }

    pub fn threshold(&self, name: &str) -> Option<f64> {
        self.thresholds.get(name).map(|t| *t.value())
    }

    pub fn latest(&self, name: &str) -> Option<f64> {
        self.series
            .get(name)
            .and_then(|ring| ring.back().map(|metric| metric.value))
    }

    /// Samples of `name` recorded within `window`, oldest first.
    pub fn metric_history(&self, name: &str, window: Duration) -> Vec<PerformanceMetric> {
        let cutoff = cutoff(window);
        self.series
            .get(name)
            .map(|ring| {
                ring.iter()
                    .filter(|metric| metric.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn alerts(&self, window: Duration) -> Vec<Alert> {
        self.alerts.lock().since(cutoff(window))
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn performance_report(&self, window_minutes: u64) -> PerformanceReport {
        let window = Duration::from_secs(window_minutes.saturating_mul(60));
        let since = cutoff(window);

        let mut metrics = BTreeMap::new();
        for entry in self.series.iter() {
            if let Some(summary) = summarize(entry.value(), since) {
                metrics.insert(entry.key().clone(), summary);
            }
        }

        let recommendations = recommendations(&metrics);
        let alerts = self.alerts.lock().since(since);

        info!(
            "Generated performance report over {} minutes: {} metrics, {} alerts",
            window_minutes,
            metrics.len(),
            alerts.len()
        );

        PerformanceReport {
            generated_at: Utc::now(),
            window_minutes,
            metrics,
            alerts,
            recommendations,
        }
    }

    pub fn summary(&self, window: Duration) -> MonitoringSummary {
        let alerts = self.alerts.lock();
        let recent = alerts.since(cutoff(window));

        MonitoringSummary {
            tracked_metrics: self.series.len(),
            samples_recorded: self.samples_recorded.load(Ordering::Relaxed),
            alerts_raised: alerts.total_raised(),
            recent_alerts: recent.len(),
            recent_critical_alerts: recent
                .iter()
                .filter(|alert| alert.severity == AlertSeverity::Critical)
                .count(),
        }
    }

    /// Renders the latest value of every metric as a Prometheus gauge.
    pub fn export_prometheus(&self) -> Result<String, OptimizationError> {
        let registry = Registry::new();

        let snapshot: BTreeMap<String, PerformanceMetric> = self
            .series
            .iter()
            .filter_map(|entry| entry.value().back().map(|m| (entry.key().clone(), m.clone())))
            .collect();

        let mut exported = HashSet::new();
        for (metric, latest) in &snapshot {
            let name = prometheus_name(metric);
            if !exported.insert(name.clone()) {
                debug!("Skipping metric {} in export, {} is already taken", metric, name);
                continue;
            }

            let opts = Opts::new(
                name,
                format!("Latest value of {} ({:?})", metric, latest.unit),
            );
            let gauge =
                Gauge::with_opts(opts).map_err(|e| OptimizationError::MetricsExport(e.to_string()))?;
            gauge.set(latest.value);
            registry
                .register(Box::new(gauge))
                .map_err(|e| OptimizationError::MetricsExport(e.to_string()))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(|e| OptimizationError::MetricsExport(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| OptimizationError::MetricsExport(e.to_string()))
    }
}

fn cutoff(window: Duration) -> DateTime<Utc> {
    let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Utc::now()
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn summarize(ring: &VecDeque<PerformanceMetric>, since: DateTime<Utc>) -> Option<MetricSummary> {
    let mut samples = ring.iter().filter(|metric| metric.timestamp >= since);
    let first = samples.next()?;

    let mut summary = MetricSummary {
        count: 1,
        avg: first.value,
        min: first.value,
        max: first.value,
        latest: first.value,
        unit: first.unit,
    };
    let mut total = first.value;

    for metric in samples {
        summary.count += 1;
        total += metric.value;
        summary.min = summary.min.min(metric.value);
        summary.max = summary.max.max(metric.value);
        summary.latest = metric.value;
    }
    summary.avg = total / summary.count as f64;

    Some(summary)
}

fn recommendations(metrics: &BTreeMap<String, MetricSummary>) -> Vec<String> {
    let mut advice = Vec::new();

    for (name, summary) in metrics {
        if (name.contains("latency") || name.contains("response_time")) && summary.avg > 500.0 {
            advice.push(format!(
                "Average {} is {:.1}ms; consider request batching or connection pooling",
                name, summary.avg
            ));
        } else if name.contains("error_rate") && summary.avg > 0.05 {
            advice.push(format!(
                "{} averages {:.1}%; review downstream health and circuit breaker thresholds",
                name,
                summary.avg * 100.0
            ));
        } else if (name.contains("hit_ratio") || name.contains("hit_rate")) && summary.avg < 0.7 {
            advice.push(format!(
                "{} is {:.1}%; review cache TTLs or warm frequently requested keys",
                name,
                summary.avg * 100.0
            ));
        } else if name == CPU_PERCENT_METRIC && summary.avg > 80.0 {
            advice.push(format!(
                "CPU usage averages {:.1}%; reduce concurrent work or scale out",
                summary.avg
            ));
        } else if name == MEMORY_PERCENT_METRIC && summary.avg > 85.0 {
            advice.push(format!(
                "Memory usage averages {:.1}%; lower the local cache capacity",
                summary.avg
            ));
        }
    }

    if advice.is_empty() {
        advice.push("All monitored metrics are within normal parameters".to_string());
    }
    advice
}

fn prometheus_name(metric: &str) -> String {
    let sanitized: String = metric
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("{}{}", PROMETHEUS_PREFIX, sanitized)
}
