//! Metrics registry holding the latest snapshot, and its text rendering.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::mapping::{build_metric_name, sanitize_prefix};
use crate::sample::{MetricKind, MetricsSnapshot};

/// Outcome of one step of a scrape cycle, for self-metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Ok,
    Fail,
}

impl StepResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepResult::Ok => "ok",
            StepResult::Fail => "fail",
        }
    }
}

/// Cumulative exporter statistics.
///
/// These live outside [`MetricsSnapshot`]: they change on failed cycles too.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeStats {
    pub dial_ok: u64,
    pub dial_fail: u64,
    pub bind_ok: u64,
    pub bind_fail: u64,
    pub scrape_ok: u64,
    pub scrape_fail: u64,
    pub mapping_warnings: u64,
    /// Duration of the last completed cycle, successful or not.
    pub last_duration: Option<Duration>,
    /// Unix time of the last successful cycle.
    pub last_success_unix: Option<f64>,
}

impl ScrapeStats {
    pub fn record_dial(&mut self, result: StepResult) {
        match result {
            StepResult::Ok => self.dial_ok += 1,
            StepResult::Fail => self.dial_fail += 1,
        }
    }

    pub fn record_bind(&mut self, result: StepResult) {
        match result {
            StepResult::Ok => self.bind_ok += 1,
            StepResult::Fail => self.bind_fail += 1,
        }
    }

    pub fn record_scrape(&mut self, result: StepResult, duration: Duration) {
        match result {
            StepResult::Ok => self.scrape_ok += 1,
            StepResult::Fail => self.scrape_fail += 1,
        }
        self.last_duration = Some(duration);
    }
}

/// Thread-safe holder of the current [`MetricsSnapshot`].
///
/// [`update`](Self::update) swaps in a complete snapshot under a short write
/// lock; [`snapshot`](Self::snapshot) clones the `Arc` under a read lock.
/// Readers therefore see either the old or the new snapshot, never a mix, and
/// rendering happens outside the lock.
pub struct MetricsRegistry {
    current: RwLock<Arc<MetricsSnapshot>>,
    stats: RwLock<ScrapeStats>,
    prefix: String,
}

impl MetricsRegistry {
    /// Create an empty registry. `prefix` names the exporter's own metrics and
    /// is sanitized the same way [`MetricMapper`](crate::mapping::MetricMapper)
    /// sanitizes it.
    pub fn new(prefix: impl AsRef<str>) -> Self {
        Self {
            current: RwLock::new(Arc::new(MetricsSnapshot::new())),
            stats: RwLock::new(ScrapeStats::default()),
            prefix: sanitize_prefix(prefix.as_ref()),
        }
    }

    /// Atomically replace the current snapshot.
    pub fn update(&self, snapshot: MetricsSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self.current.write() = snapshot;
    }

    /// The current snapshot (empty until the first successful scrape).
    pub fn snapshot(&self) -> Arc<MetricsSnapshot> {
        self.current.read().clone()
    }

    /// Get the current number of stored series.
    pub fn series_count(&self) -> usize {
        self.current.read().len()
    }

    /// Get exporter statistics.
    pub fn stats(&self) -> ScrapeStats {
        self.stats.read().clone()
    }

    /// Apply a change to the statistics.
    pub fn with_stats<F: FnOnce(&mut ScrapeStats)>(&self, f: F) {
        f(&mut *self.stats.write());
    }

    /// Whether at least one scrape has succeeded.
    pub fn is_ready(&self) -> bool {
        self.stats.read().scrape_ok > 0
    }

    /// Render the current snapshot and exporter statistics in Prometheus
    /// exposition format.
    pub fn render(&self) -> String {
        let snapshot = self.snapshot();
        let stats = self.stats();

        let mut output = render_snapshot(&snapshot);
        render_stats(&mut output, &self.prefix, &stats, snapshot.len());
        output
    }
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<MetricsRegistry>;

/// Render a snapshot: HELP and TYPE once per family, then one line per series.
pub fn render_snapshot(snapshot: &MetricsSnapshot) -> String {
    let mut output = String::with_capacity(snapshot.len() * 100);
    let mut current_family: Option<&str> = None;

    for sample in snapshot.iter() {
        if current_family != Some(sample.name()) {
            writeln!(output, "# HELP {} {}", sample.name(), escape_help(sample.help)).ok();
            writeln!(output, "# TYPE {} {}", sample.name(), sample.kind.as_str()).ok();
            current_family = Some(sample.name());
        }

        writeln!(
            output,
            "{}{} {}",
            sample.name(),
            format_labels(sample.labels()),
            format_value(sample.value)
        )
        .ok();
    }

    output
}

fn render_stats(output: &mut String, prefix: &str, stats: &ScrapeStats, series: usize) {
    let name = |suffix: &str| build_metric_name(prefix, suffix);

    let result_family = |output: &mut String, suffix: &str, help: &str, ok: u64, fail: u64| {
        let name = name(suffix);
        writeln!(output, "# HELP {} {}", name, help).ok();
        writeln!(output, "# TYPE {} {}", name, MetricKind::Counter.as_str()).ok();
        for (result, value) in [(StepResult::Fail, fail), (StepResult::Ok, ok)] {
            writeln!(output, "{}{{result=\"{}\"}} {}", name, result.as_str(), value).ok();
        }
    };

    result_family(
        output,
        "dial_total",
        "Connection attempts to the LDAP server, by result",
        stats.dial_ok,
        stats.dial_fail,
    );
    result_family(
        output,
        "bind_total",
        "Authenticated bind attempts, by result",
        stats.bind_ok,
        stats.bind_fail,
    );
    result_family(
        output,
        "scrape_total",
        "Scrape cycles, by result",
        stats.scrape_ok,
        stats.scrape_fail,
    );

    let single = |output: &mut String, suffix: &str, help: &str, kind: MetricKind, value: f64| {
        let name = name(suffix);
        writeln!(output, "# HELP {} {}", name, help).ok();
        writeln!(output, "# TYPE {} {}", name, kind.as_str()).ok();
        writeln!(output, "{} {}", name, format_value(value)).ok();
    };

    single(
        output,
        "mapping_warnings_total",
        "Monitor attribute values that could not be parsed",
        MetricKind::Counter,
        stats.mapping_warnings as f64,
    );
    single(
        output,
        "exporter_series",
        "Series in the current snapshot",
        MetricKind::Gauge,
        series as f64,
    );
    if let Some(duration) = stats.last_duration {
        single(
            output,
            "scrape_duration_seconds",
            "Duration of the last scrape cycle",
            MetricKind::Gauge,
            duration.as_secs_f64(),
        );
    }
    if let Some(ts) = stats.last_success_unix {
        single(
            output,
            "last_scrape_success_timestamp_seconds",
            "Unix time of the last successful scrape",
            MetricKind::Gauge,
            ts,
        );
    }
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape HELP text (backslash and newline only).
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Format labels for Prometheus exposition format.
fn format_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}
