use std::sync::Arc;
use std::time::Duration;

use metrics::Label;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use prometheuslog_logs::{ApplicationMonitor, MetricKey, MetricValue, Supervisor};

/// Prometheus-safe name for one application's metric:
/// `<application>_<environment>_<metric>`, with anything outside
/// `[a-zA-Z0-9_:]` replaced by `_`.
pub fn exposed_name(application: &str, environment: &str, key: MetricKey) -> String {
    let raw = format!("{application}_{environment}_{}", key.name());
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Copies metric sinks into the global `metrics` recorder on a fixed interval
#[derive(Clone, Debug)]
pub struct ExportBridge {
    environment: String,
    flush_interval: Duration,
}

impl ExportBridge {
    /// Create a bridge labelling every metric with `environment`
    pub fn new(environment: impl Into<String>, flush_interval: Duration) -> Self {
        Self {
            environment: environment.into(),
            flush_interval,
        }
    }

    /// Environment label and name segment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Time between flushes
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Publish every touched metric of one monitor. Returns how many were published.
    pub fn flush_monitor(&self, monitor: &ApplicationMonitor) -> usize {
        let labels = vec![
            Label::new("application", monitor.name().to_string()),
            Label::new("environment", self.environment.clone()),
        ];

        let snapshot = monitor.sink().snapshot();
        for (key, value) in &snapshot {
            let name = exposed_name(monitor.name(), &self.environment, *key);
            match *value {
                MetricValue::Counter(v) => {
                    metrics::counter!(name, labels.clone()).absolute(v.max(0) as u64)
                }
                gauge => metrics::gauge!(name, labels.clone()).set(gauge.as_f64()),
            }
        }
        snapshot.len()
    }

    /// Publish every monitor the supervisor owns
    pub fn flush(&self, supervisor: &Supervisor) -> usize {
        supervisor
            .applications()
            .iter()
            .map(|monitor| self.flush_monitor(monitor))
            .sum()
    }

    /// Flush on every interval tick until cancelled
    pub async fn run(self, supervisor: Arc<Supervisor>, cancel: CancellationToken) {
        info!(
            environment = %self.environment,
            interval_ms = self.flush_interval.as_millis() as u64,
            "export bridge started"
        );
        let mut ticker = tokio::time::interval(self.flush_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let published = self.flush(&supervisor);
                    debug!(published, "flushed metrics");
                }
            }
        }
        // Final flush so the last values are not lost
        self.flush(&supervisor);
    }
}
