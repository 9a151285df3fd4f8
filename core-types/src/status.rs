use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Discrete health level exposed by each analysis service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverallStatus {
    Ok,
    #[default]
    Warn,
    Crit,
}

/// Work that needs an operator: an association that ended in a non-retryable error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusGauge {
    pub label: String,
    pub value: f64,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ServiceStatus {
    overall: OverallStatus,
    warnings: Vec<String>,
    alerts: Vec<OperatorAlert>,
    gauges: Vec<StatusGauge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusSnapshot {
    pub name: String,
    pub overall: OverallStatus,
    pub warnings: Vec<String>,
    pub alerts: Vec<OperatorAlert>,
    pub gauges: Vec<StatusGauge>,
}

/// Metric sample emitted by a service-specific reporter.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub metric: String,
    pub value: f64,
    pub labels: Vec<(String, String)>,
}

impl MetricSample {
    pub fn gauge(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }
}

/// Implemented by services that publish counters to whatever exporter the host wires up.
pub trait ServiceMetricsReporter: Send + Sync {
    fn service_name(&self) -> &'static str;
    fn collect_metrics(&self) -> Vec<MetricSample>;
}

/// Shared handle so a service can publish its own status.
#[derive(Clone)]
pub struct ServiceStatusHandle {
    name: &'static str,
    inner: Arc<RwLock<ServiceStatus>>,
}

impl ServiceStatusHandle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(RwLock::new(ServiceStatus::default())),
        }
    }

    pub fn service_name(&self) -> &'static str {
        self.name
    }

    pub fn set_overall(&self, status: OverallStatus) {
        self.inner.write().overall = status;
    }

    pub fn push_warning(&self, msg: impl Into<String>) {
        self.inner.write().warnings.push(msg.into());
    }

    pub fn clear_warnings_matching(&self, predicate: impl Fn(&str) -> bool) {
        self.inner.write().warnings.retain(|w| !predicate(w));
    }

    /// Records an alert; repeated alerts for the same subject replace the older one.
    pub fn raise_alert(&self, subject: impl Into<String>, message: impl Into<String>) {
        let subject = subject.into();
        let message = message.into();
        let mut guard = self.inner.write();
        guard.alerts.retain(|a| a.subject != subject);
        guard.alerts.push(OperatorAlert { subject, message });
        guard.overall = OverallStatus::Crit;
    }

    pub fn acknowledge_alert(&self, subject: &str) -> bool {
        let mut guard = self.inner.write();
        let before = guard.alerts.len();
        guard.alerts.retain(|a| a.subject != subject);
        let removed = guard.alerts.len() != before;
        if removed && guard.alerts.is_empty() && guard.overall == OverallStatus::Crit {
            guard.overall = OverallStatus::Warn;
        }
        removed
    }

    pub fn set_gauges(&self, gauges: Vec<StatusGauge>) {
        self.inner.write().gauges = gauges;
    }

    pub fn snapshot(&self) -> ServiceStatusSnapshot {
        let guard = self.inner.read();
        ServiceStatusSnapshot {
            name: self.name.to_string(),
            overall: guard.overall,
            warnings: guard.warnings.clone(),
            alerts: guard.alerts.clone(),
            gauges: guard.gauges.clone(),
        }
    }

    pub fn overall(&self) -> OverallStatus {
        self.inner.read().overall
    }
}

impl ServiceMetricsReporter for ServiceStatusHandle {
    fn service_name(&self) -> &'static str {
        self.name
    }

    fn collect_metrics(&self) -> Vec<MetricSample> {
        let guard = self.inner.read();
        let mut samples: Vec<MetricSample> = guard
            .gauges
            .iter()
            .map(|g| MetricSample {
                metric: format!("{}_{}", self.name.to_lowercase(), slugify(&g.label)),
                value: g.value,
                labels: g
                    .unit
                    .as_ref()
                    .map(|unit| vec![("unit".to_string(), unit.clone())])
                    .unwrap_or_default(),
            })
            .collect();
        samples.push(MetricSample::gauge(
            format!("{}_open_alerts", self.name.to_lowercase()),
            guard.alerts.len() as f64,
        ));
        samples
    }
}

fn slugify(label: &str) -> String {
    label
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
