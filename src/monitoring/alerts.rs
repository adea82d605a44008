use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{error, warn};
use uuid::Uuid;

const CRITICAL_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    /// Critical at or above 1.5x the threshold, warning below.
    pub fn classify(value: f64, threshold: f64) -> Self {
        if value >= threshold * CRITICAL_MULTIPLIER {
            Self::Critical
        } else {
            Self::Warning
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub metric_name: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
    pub context: HashMap<String, String>,
}

impl Alert {
    pub fn new(
        metric_name: impl Into<String>,
        value: f64,
        threshold: f64,
        context: HashMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            metric_name: metric_name.into(),
            value,
            threshold,
            severity: AlertSeverity::classify(value, threshold),
            timestamp: Utc::now(),
            context,
        }
    }

    pub fn message(&self) -> String {
        format!(
            "{} = {:.2} exceeded threshold {:.2}",
            self.metric_name, self.value, self.threshold
        )
    }
}

/// Receives alerts as soon as they are appended to the log. Called
/// synchronously on the recording thread, so implementations must not block.
pub trait AlertSink: Send + Sync {
    fn on_alert(&self, alert: &Alert);
}

impl<F> AlertSink for F
where
    F: Fn(&Alert) + Send + Sync,
{
    fn on_alert(&self, alert: &Alert) {
        (self)(alert)
    }
}

#[derive(Debug)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn on_alert(&self, alert: &Alert) {
        match alert.severity {
            AlertSeverity::Critical => {
                error!("ALERT [{}] {}", alert.severity, alert.message());
            }
            AlertSeverity::Warning => {
                warn!("ALERT [{}] {}", alert.severity, alert.message());
            }
        }
    }
}

/// Bounded alert history; the oldest alert is dropped on overflow.
#[derive(Debug)]
pub struct AlertLog {
    capacity: usize,
    alerts: VecDeque<Alert>,
    total_raised: u64,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            alerts: VecDeque::new(),
            total_raised: 0,
        }
    }

    pub fn push(&mut self, alert: Alert) {
        self.total_raised += 1;
        self.alerts.push_back(alert);
        while self.alerts.len() > self.capacity {
            self.alerts.pop_front();
        }
    }

    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|alert| alert.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn total_raised(&self) -> u64 {
        self.total_raised
    }
}
