//! Log ingestion for prometheuslog
//!
//! This crate tails application log files, classifies each line against a
//! static rule table, and aggregates the results into per-application metric
//! sinks owned by a [`Supervisor`].

mod classifier;
mod error;
mod monitor;
mod sink;
mod supervisor;
mod tail;

pub use classifier::{Classification, MetricUpdate, RuleError, classify, validate_catalog};
pub use error::{ExtractError, MonitorError};
pub use monitor::{ApplicationMonitor, METRICS_LOG_INTERVAL, line_rate_limiter};
pub use sink::MetricSink;
pub use supervisor::Supervisor;
pub use tail::{DEFAULT_POLL_INTERVAL, LogFollower, MAX_LINE_BYTES, Whence};

// Re-export types used in our public API
pub use prometheuslog_types::{ApplicationConfig, JsonMetric, MetricKey, MetricKind, MetricValue};
