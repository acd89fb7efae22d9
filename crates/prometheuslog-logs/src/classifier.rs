use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use prometheuslog_types::{JsonMetric, MetricKey};

use crate::error::{ExtractError, MonitorError};
use crate::sink::MetricSink;

static MEMORY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"freeMemory=([0-9]+) totalMemory=([0-9]+)").expect("valid memory pattern")
});

static SCRAPE_DURATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"scrapeExecuteFinished.*completed=true,duration=([0-9]+)ms")
        .expect("valid scrape pattern")
});

static JSON_LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2}.*jsonMetricsMessageToBeSent",
    )
    .expect("valid json metrics pattern")
});

/// Delimiter between the log prefix and a structured metrics payload
const JSON_DELIMITER: &str = "json=";

/// A single mutation of a metric sink
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricUpdate {
    Increment(MetricKey),
    SetGauge(MetricKey, f64),
    SetGaugeInt(MetricKey, i64),
}

impl MetricUpdate {
    /// Metric this update writes
    pub fn key(&self) -> MetricKey {
        match *self {
            Self::Increment(key) | Self::SetGauge(key, _) | Self::SetGaugeInt(key, _) => key,
        }
    }

    /// Write the update into `sink`
    pub fn apply(&self, sink: &MetricSink) {
        match *self {
            Self::Increment(key) => sink.increment_counter(key, 1),
            Self::SetGauge(key, value) => sink.set_gauge(key, value),
            Self::SetGaugeInt(key, value) => sink.set_gauge_int(key, value),
        }
    }
}

/// A rule failure, attributed to the rule that raised it
#[derive(Debug)]
pub struct RuleError {
    pub rule: &'static str,
    pub error: ExtractError,
}

/// Everything the rule table produced for one line
#[derive(Debug, Default)]
pub struct Classification {
    /// Sink mutations, in rule order
    pub updates: Vec<MetricUpdate>,

    /// Debug-mode diagnostic messages
    pub diagnostics: Vec<String>,

    /// Recovered rule failures; the remaining rules still ran
    pub errors: Vec<RuleError>,
}

impl Classification {
    /// True when no rule matched
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.diagnostics.is_empty() && self.errors.is_empty()
    }

    /// Apply every update to the sink, returning how many were applied
    pub fn apply(&self, sink: &MetricSink) -> usize {
        for update in &self.updates {
            update.apply(sink);
        }
        self.updates.len()
    }
}

type Extractor = fn(&str, &str, &mut Classification) -> Result<(), ExtractError>;

/// One entry of the static rule table
struct Rule {
    name: &'static str,
    /// Cheap substring test gating the extractor
    trigger: &'static str,
    extract: Extractor,
    /// Metrics this rule is allowed to write
    outputs: &'static [MetricKey],
}

const JSON_OUTPUTS: [MetricKey; 5] = [
    MetricKey::Json(JsonMetric::ApmAlertsRunning),
    MetricKey::Json(JsonMetric::ApmAlertCreationRate),
    MetricKey::Json(JsonMetric::PayloadReceptionRate),
    MetricKey::Json(JsonMetric::CaseCreationRate),
    MetricKey::Json(JsonMetric::CaseTerminateRate),
];

/// Evaluated in order; every rule whose trigger matches runs independently
static RULES: [Rule; 7] = [
    Rule {
        name: "memory",
        trigger: "memoryUsageIs",
        extract: extract_memory,
        outputs: &[MetricKey::MemoryFreeBytes, MetricKey::MemoryTotalBytes],
    },
    Rule {
        name: "alert-created",
        trigger: "postPayloadStarted",
        extract: extract_alert_created,
        outputs: &[MetricKey::AlertCreated],
    },
    Rule {
        name: "webharvest-duration",
        trigger: "scrapeExecuteFinished",
        extract: extract_scrape_duration,
        outputs: &[MetricKey::WebHarvestExitDuration],
    },
    Rule {
        name: "json-metrics",
        trigger: "jsonMetricsMessageToBeSent",
        extract: extract_json_metrics,
        outputs: &JSON_OUTPUTS,
    },
    Rule {
        name: "warn",
        trigger: "WARN",
        extract: extract_warn,
        outputs: &[MetricKey::WarnMessages],
    },
    Rule {
        name: "error",
        trigger: "ERROR",
        extract: extract_error,
        outputs: &[MetricKey::ErrorMessages],
    },
    Rule {
        name: "fatal",
        trigger: "FATAL",
        extract: extract_fatal,
        outputs: &[MetricKey::FatalMessages],
    },
];

/// Check the metric catalog and the rule table once at startup.
///
/// Fails if two catalog entries share a name or two rules claim the same output.
pub fn validate_catalog() -> Result<(), MonitorError> {
    let mut names = HashSet::new();
    for key in MetricKey::all() {
        if !names.insert(key.name()) {
            return Err(MonitorError::DuplicateMetric(key.name()));
        }
    }
    let mut claimed = HashSet::new();
    for output in RULES.iter().flat_map(|rule| rule.outputs) {
        if !claimed.insert(*output) {
            return Err(MonitorError::DuplicateMetric(output.name()));
        }
    }
    Ok(())
}

/// Run the rule table over one raw line.
///
/// Pure: the result depends only on `line` and `app_name`.
pub fn classify(line: &str, app_name: &str) -> Classification {
    let mut out = Classification::default();

    for rule in &RULES {
        if !line.contains(rule.trigger) {
            continue;
        }
        let first_update = out.updates.len();
        if let Err(error) = (rule.extract)(line, app_name, &mut out) {
            out.errors.push(RuleError {
                rule: rule.name,
                error,
            });
        }
        debug_assert!(
            out.updates[first_update..]
                .iter()
                .all(|u| rule.outputs.contains(&u.key())),
            "rule {} wrote outside its outputs",
            rule.name
        );
    }

    out
}

/// `memoryUsageIs ... freeMemory=<int> totalMemory=<int>`
fn extract_memory(line: &str, _app: &str, out: &mut Classification) -> Result<(), ExtractError> {
    let Some(caps) = MEMORY_PATTERN.captures(line) else {
        return Ok(());
    };
    let free = &caps[1];
    let total = &caps[2];
    out.diagnostics
        .push(format!("Common - Memory Report - Free {free} Max: {total}"));

    let free = parse_float(MetricKey::MemoryFreeBytes, free)?;
    let total = parse_float(MetricKey::MemoryTotalBytes, total)?;
    out.updates
        .push(MetricUpdate::SetGauge(MetricKey::MemoryFreeBytes, free));
    out.updates
        .push(MetricUpdate::SetGauge(MetricKey::MemoryTotalBytes, total));
    Ok(())
}

fn extract_alert_created(
    _line: &str,
    _app: &str,
    out: &mut Classification,
) -> Result<(), ExtractError> {
    out.diagnostics.push("Common - Alert Created".to_string());
    out.updates
        .push(MetricUpdate::Increment(MetricKey::AlertCreated));
    Ok(())
}

/// `scrapeExecuteFinished: completed=true,duration=<int>ms`
fn extract_scrape_duration(
    line: &str,
    _app: &str,
    out: &mut Classification,
) -> Result<(), ExtractError> {
    let Some(caps) = SCRAPE_DURATION_PATTERN.captures(line) else {
        return Ok(());
    };
    let duration = &caps[1];
    out.diagnostics
        .push(format!("APM >> WebHarvest Thread Exit Duration: {duration}"));
    let duration = parse_float(MetricKey::WebHarvestExitDuration, duration)?;
    out.updates.push(MetricUpdate::SetGauge(
        MetricKey::WebHarvestExitDuration,
        duration,
    ));
    Ok(())
}

/// Timestamped line carrying `json={...,"metrics":{...}}`.
///
/// Each well-known key under `metrics` is read from its per-application entry.
/// A bad entry skips that one metric; a bad payload skips them all.
fn extract_json_metrics(
    line: &str,
    app_name: &str,
    out: &mut Classification,
) -> Result<(), ExtractError> {
    out.diagnostics.push("Common - Processing Metrics".to_string());
    if !JSON_LINE_PATTERN.is_match(line) {
        return Ok(());
    }

    let (_, payload) = line
        .split_once(JSON_DELIMITER)
        .ok_or(ExtractError::MissingPayload)?;
    let payload: Value = serde_json::from_str(payload.trim())?;
    let metrics = payload
        .get("metrics")
        .and_then(Value::as_object)
        .ok_or(ExtractError::MissingMetrics)?;

    for (key, entry) in metrics {
        let Some(metric) = JsonMetric::from_json_key(key) else {
            continue;
        };
        match application_value(metric, entry, app_name) {
            Ok(value) => out
                .updates
                .push(MetricUpdate::SetGaugeInt(MetricKey::Json(metric), value)),
            Err(error) => out.errors.push(RuleError {
                rule: "json-metrics",
                error,
            }),
        }
    }
    Ok(())
}

/// Read `entry[app_name]` as an integer. Strings are parsed base-10;
/// numbers must be whole (`79` and `79.0` both read as 79).
fn application_value(
    metric: JsonMetric,
    entry: &Value,
    app_name: &str,
) -> Result<i64, ExtractError> {
    let name = metric.metric_name();
    let value = entry
        .get(app_name)
        .ok_or(ExtractError::MissingApplicationValue { metric: name })?;
    let parsed = match value {
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(whole_number)),
        _ => None,
    };
    parsed.ok_or_else(|| ExtractError::InvalidInteger {
        metric: name,
        value: match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    })
}

/// `v` as i64 if it is finite, integral and in range
fn whole_number(v: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0; // 2^63
    (v.is_finite() && v.fract() == 0.0 && (-LIMIT..LIMIT).contains(&v)).then_some(v as i64)
}

fn extract_warn(line: &str, _app: &str, out: &mut Classification) -> Result<(), ExtractError> {
    severity(line, MetricKey::WarnMessages, out);
    Ok(())
}

fn extract_error(line: &str, _app: &str, out: &mut Classification) -> Result<(), ExtractError> {
    severity(line, MetricKey::ErrorMessages, out);
    Ok(())
}

fn extract_fatal(line: &str, _app: &str, out: &mut Classification) -> Result<(), ExtractError> {
    severity(line, MetricKey::FatalMessages, out);
    Ok(())
}

/// Severity rules echo the whole line in debug mode
fn severity(line: &str, key: MetricKey, out: &mut Classification) {
    out.diagnostics.push(line.to_string());
    out.updates.push(MetricUpdate::Increment(key));
}

fn parse_float(key: MetricKey, raw: &str) -> Result<f64, ExtractError> {
    raw.parse::<f64>().map_err(|_| ExtractError::InvalidNumber {
        metric: key.name(),
        value: raw.to_string(),
    })
}
