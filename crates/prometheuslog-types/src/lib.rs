//! Shared types for prometheuslog
//!
//! This crate contains the application identity and the closed catalog of
//! metrics that the log classifier is allowed to produce.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Application Types
// ============================================================================

/// One monitored application, as loaded from the config file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationConfig {
    /// Zero-based position in the config file
    pub id: usize,

    /// Application name; also the key looked up inside JSON metric payloads
    pub name: String,

    /// Log file to follow
    pub log_path: PathBuf,
}

impl ApplicationConfig {
    /// Create a config entry
    pub fn new(id: usize, name: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            log_path: log_path.into(),
        }
    }
}

// ============================================================================
// Metric Catalog
// ============================================================================

/// Storage kind of a metric
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Monotonic int64, only ever incremented
    Counter,
    /// Last-write-wins float64
    Gauge,
    /// Last-write-wins int64
    GaugeInt,
}

impl MetricKind {
    /// Lowercase label used in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::GaugeInt => "gauge_int",
        }
    }
}

/// Well-known keys inside the `metrics` object of a structured metrics payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JsonMetric {
    ApmAlertsRunning,
    ApmAlertCreationRate,
    PayloadReceptionRate,
    CaseCreationRate,
    CaseTerminateRate,
}

impl JsonMetric {
    pub const ALL: [JsonMetric; 5] = [
        Self::ApmAlertsRunning,
        Self::ApmAlertCreationRate,
        Self::PayloadReceptionRate,
        Self::CaseCreationRate,
        Self::CaseTerminateRate,
    ];

    /// Key as it appears in the JSON payload
    pub fn json_key(&self) -> &'static str {
        match self {
            Self::ApmAlertsRunning => "apmAlertsRunning",
            Self::ApmAlertCreationRate => "apmAlertCreationRate",
            Self::PayloadReceptionRate => "payloadReceptionRate",
            Self::CaseCreationRate => "caseCreationRate",
            Self::CaseTerminateRate => "caseTerminateRate",
        }
    }

    /// Look up a payload key; unknown keys are not part of the catalog
    pub fn from_json_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.json_key() == key)
    }

    /// Name of the gauge this payload key feeds
    pub fn metric_name(&self) -> &'static str {
        match self {
            Self::ApmAlertsRunning => "apm-metric-apmAlertsRunning-total",
            Self::ApmAlertCreationRate => "apm-metric-apmAlertCreationRate-total",
            Self::PayloadReceptionRate => "apm-metric-payloadReceptionRate-total",
            Self::CaseCreationRate => "apm-metric-caseCreationRate-total",
            Self::CaseTerminateRate => "apm-metric-caseTerminateRate-total",
        }
    }
}

/// Every metric a sink can hold. Each key has exactly one kind for the
/// lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKey {
    LogReadRate,
    MemoryFreeBytes,
    MemoryTotalBytes,
    AlertCreated,
    WebHarvestExitDuration,
    WarnMessages,
    ErrorMessages,
    FatalMessages,
    Json(JsonMetric),
}

impl MetricKey {
    /// Full catalog, in a stable order
    pub fn all() -> impl Iterator<Item = MetricKey> {
        [
            Self::LogReadRate,
            Self::MemoryFreeBytes,
            Self::MemoryTotalBytes,
            Self::AlertCreated,
            Self::WebHarvestExitDuration,
            Self::WarnMessages,
            Self::ErrorMessages,
            Self::FatalMessages,
        ]
        .into_iter()
        .chain(JsonMetric::ALL.into_iter().map(Self::Json))
    }

    /// Catalog name of the metric
    pub fn name(&self) -> &'static str {
        match self {
            Self::LogReadRate => "apm-log-read-rate",
            Self::MemoryFreeBytes => "apm-common-memoryfree-bytes",
            Self::MemoryTotalBytes => "apm-common-memorytotal-bytes",
            Self::AlertCreated => "apm-alert-created-total",
            Self::WebHarvestExitDuration => "apm-webharvest-exit-duration",
            Self::WarnMessages => "common-warn-messages-total",
            Self::ErrorMessages => "common-error-messages-total",
            Self::FatalMessages => "apm-common-fatal-messages-total",
            Self::Json(metric) => metric.metric_name(),
        }
    }

    /// Storage kind the sink creates for this metric
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::LogReadRate
            | Self::AlertCreated
            | Self::WarnMessages
            | Self::ErrorMessages
            | Self::FatalMessages => MetricKind::Counter,
            Self::MemoryFreeBytes | Self::MemoryTotalBytes | Self::WebHarvestExitDuration => {
                MetricKind::Gauge
            }
            Self::Json(_) => MetricKind::GaugeInt,
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Point-in-time value of one metric
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Counter(i64),
    Gauge(f64),
    GaugeInt(i64),
}

impl MetricValue {
    /// Value widened to f64, as the exposition format carries it
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Counter(v) | Self::GaugeInt(v) => v as f64,
            Self::Gauge(v) => v,
        }
    }
}
