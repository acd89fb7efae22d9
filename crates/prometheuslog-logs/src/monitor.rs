use std::io;
use std::num::NonZeroU32;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use prometheuslog_types::{ApplicationConfig, MetricKey};

use crate::classifier;
use crate::sink::MetricSink;

/// How often a debug-mode monitor dumps its sink to the log
pub const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Token bucket admitting `max_rate` lines per second with no burst, so
/// N lines always take at least (N-1)/max_rate seconds.
pub fn line_rate_limiter(max_rate: NonZeroU32) -> DefaultDirectRateLimiter {
    RateLimiter::direct(Quota::per_second(max_rate).allow_burst(NonZeroU32::MIN))
}

struct MonitorInner {
    config: ApplicationConfig,
    sink: MetricSink,
    lines_read: AtomicU64,
    last_line_at: RwLock<Option<DateTime<Utc>>>,
    debug_enabled: bool,
    cancel: CancellationToken,
}

/// One monitored application: identity, its metric sink and the state of its
/// ingestion loop. Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct ApplicationMonitor {
    inner: Arc<MonitorInner>,
}

impl ApplicationMonitor {
    /// Create a monitor with a fresh sink. Nothing is spawned.
    pub fn new(config: ApplicationConfig, debug_enabled: bool) -> Self {
        Self::with_cancel(config, debug_enabled, CancellationToken::new())
    }

    /// Create a monitor stopped by `cancel`
    pub(crate) fn with_cancel(
        config: ApplicationConfig,
        debug_enabled: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                sink: MetricSink::new(),
                lines_read: AtomicU64::new(0),
                last_line_at: RwLock::new(None),
                debug_enabled,
                cancel,
            }),
        }
    }

    /// Position of the application in the config file
    pub fn id(&self) -> usize {
        self.inner.config.id
    }

    /// Application name, used in metric names and JSON lookups
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Log file this monitor follows
    pub fn log_path(&self) -> &Path {
        &self.inner.config.log_path
    }

    /// This application's metrics
    pub fn sink(&self) -> &MetricSink {
        &self.inner.sink
    }

    /// Whether rule diagnostics are logged
    pub fn debug_enabled(&self) -> bool {
        self.inner.debug_enabled
    }

    /// Lines classified so far
    pub fn lines_read(&self) -> u64 {
        self.inner.lines_read.load(Ordering::Relaxed)
    }

    /// When the most recent line was classified
    pub fn last_line_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_line_at.read()
    }

    /// Stop this monitor's ingestion loop. Other monitors are unaffected.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// True once the monitor was stopped or its task died
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Classify one line into this monitor's sink and count it
    pub fn process_line(&self, line: &str) {
        let name = self.name();
        let classification = classifier::classify(line, name);

        if self.inner.debug_enabled {
            for message in &classification.diagnostics {
                debug!(app = name, "{}", message.trim_end());
            }
        }
        for failure in &classification.errors {
            if failure.error.is_partial() {
                debug!(app = name, rule = failure.rule, error = %failure.error, "metric skipped");
            } else {
                warn!(
                    app = name,
                    rule = failure.rule,
                    error = %failure.error,
                    "rule failed, line partially classified"
                );
            }
        }

        classification.apply(&self.inner.sink);
        self.inner.sink.increment_counter(MetricKey::LogReadRate, 1);
        self.inner.lines_read.fetch_add(1, Ordering::Relaxed);
        *self.inner.last_line_at.write() = Some(Utc::now());
    }

    /// Run the ingestion loop until the source ends or the monitor is stopped.
    ///
    /// Each line waits for a rate-limiter token before it is classified.
    /// Source errors and classification panics are logged and skipped.
    pub async fn ingest<S>(&self, lines: S, max_rate: NonZeroU32)
    where
        S: Stream<Item = io::Result<String>>,
    {
        let limiter = line_rate_limiter(max_rate);
        let cancel = self.inner.cancel.clone();
        let mut lines = std::pin::pin!(lines);

        info!(app = self.name(), id = self.id(), max_rate = max_rate.get(), "ingestion started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                next = lines.next() => {
                    match next {
                        Some(Ok(line)) => {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = limiter.until_ready() => {}
                            }
                            let processed = std::panic::catch_unwind(AssertUnwindSafe(|| {
                                self.process_line(&line)
                            }));
                            if processed.is_err() {
                                error!(app = self.name(), "classification panicked, line skipped");
                            }
                        }
                        Some(Err(e)) => {
                            warn!(app = self.name(), error = %e, "error reading log, continuing");
                        }
                        None => {
                            debug!(app = self.name(), "log source ended");
                            break;
                        }
                    }
                }
            }
        }

        info!(app = self.name(), lines_read = self.lines_read(), "ingestion stopped");
    }

    /// Periodically log the sink contents as JSON until stopped
    pub async fn log_metrics(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot: serde_json::Map<String, serde_json::Value> = self
                        .sink()
                        .snapshot()
                        .into_iter()
                        .map(|(key, value)| {
                            let value = serde_json::to_value(value).unwrap_or_default();
                            (key.name().to_string(), value)
                        })
                        .collect();
                    info!(
                        target: "prometheuslog::metrics",
                        app = self.name(),
                        metrics = %serde_json::Value::Object(snapshot),
                        "metrics snapshot"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for ApplicationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationMonitor")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("log_path", &self.log_path())
            .field("lines_read", &self.lines_read())
            .field("debug_enabled", &self.debug_enabled())
            .finish()
    }
}
