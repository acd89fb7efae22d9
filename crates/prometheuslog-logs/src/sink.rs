use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::warn;

use prometheuslog_types::{MetricKey, MetricKind, MetricValue};

/// Storage for a single metric
#[derive(Debug)]
enum Cell {
    Counter(AtomicI64),
    /// f64 bits
    Gauge(AtomicU64),
    GaugeInt(AtomicI64),
}

impl Cell {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(AtomicI64::new(0)),
            MetricKind::Gauge => Self::Gauge(AtomicU64::new(0f64.to_bits())),
            MetricKind::GaugeInt => Self::GaugeInt(AtomicI64::new(0)),
        }
    }

    fn value(&self) -> MetricValue {
        match self {
            Self::Counter(v) => MetricValue::Counter(v.load(Ordering::Relaxed)),
            Self::Gauge(v) => MetricValue::Gauge(f64::from_bits(v.load(Ordering::Relaxed))),
            Self::GaugeInt(v) => MetricValue::GaugeInt(v.load(Ordering::Relaxed)),
        }
    }
}

/// Per-application metric registry.
///
/// Cloning yields another handle to the same registry. Metrics are created on
/// first touch and never removed. The owning ingestion loop is the only
/// writer; the export bridge reads through [`MetricSink::snapshot`].
#[derive(Clone, Default)]
pub struct MetricSink {
    metrics: Arc<RwLock<HashMap<MetricKey, Arc<Cell>>>>,
}

impl MetricSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cell for a key, creating it with the key's kind if absent
    fn get_or_create(&self, key: MetricKey) -> Arc<Cell> {
        if let Some(cell) = self.metrics.read().get(&key) {
            return Arc::clone(cell);
        }
        let mut metrics = self.metrics.write();
        Arc::clone(
            metrics
                .entry(key)
                .or_insert_with(|| Arc::new(Cell::new(key.kind()))),
        )
    }

    /// Add `delta` to a counter. Non-positive deltas are ignored.
    pub fn increment_counter(&self, key: MetricKey, delta: i64) {
        if delta <= 0 {
            return;
        }
        match &*self.get_or_create(key) {
            Cell::Counter(v) => {
                v.fetch_add(delta, Ordering::Relaxed);
            }
            _ => warn!(metric = %key, kind = key.kind().as_str(), "ignoring counter update"),
        }
    }

    /// Set a float gauge
    pub fn set_gauge(&self, key: MetricKey, value: f64) {
        match &*self.get_or_create(key) {
            Cell::Gauge(v) => v.store(value.to_bits(), Ordering::Relaxed),
            _ => warn!(metric = %key, kind = key.kind().as_str(), "ignoring gauge update"),
        }
    }

    /// Set an integer gauge
    pub fn set_gauge_int(&self, key: MetricKey, value: i64) {
        match &*self.get_or_create(key) {
            Cell::GaugeInt(v) => v.store(value, Ordering::Relaxed),
            _ => warn!(metric = %key, kind = key.kind().as_str(), "ignoring gauge update"),
        }
    }

    /// Current value, if the metric has been touched
    pub fn get(&self, key: MetricKey) -> Option<MetricValue> {
        self.metrics.read().get(&key).map(|cell| cell.value())
    }

    /// All touched metrics in catalog order
    pub fn snapshot(&self) -> Vec<(MetricKey, MetricValue)> {
        let metrics = self.metrics.read();
        MetricKey::all()
            .filter_map(|key| metrics.get(&key).map(|cell| (key, cell.value())))
            .collect()
    }

    /// Number of touched metrics
    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    /// True until the first metric is touched
    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }
}

impl std::fmt::Debug for MetricSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.snapshot().into_iter().map(|(k, v)| (k.name(), v)))
            .finish()
    }
}
