//! Mapping from `cn=Monitor` entries to Prometheus metrics.
//!
//! The [`METRIC_TABLE`] is the single source of truth tying monitoring paths to
//! metric names, types and labels. Entries that match no row are ignored, so
//! servers exposing additional statistics need no changes here.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use ldap_monitor::MonitoringEntry;
use tracing::{debug, trace};

use crate::sample::{MetricKind, MetricSample, MetricsSnapshot, SeriesKey};

/// Which entries a table row applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnMatch {
    /// Exactly this DN.
    Exact(&'static str),
    /// Any direct child of this DN. The child's RDN value becomes a label.
    ChildOf {
        parent: &'static str,
        label: &'static str,
    },
}

/// How attribute values turn into samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueParser {
    /// The first value, parsed as an integer or float.
    Number,
    /// Every `contextCSN` value, one sample per server id.
    ContextCsn,
}

/// One row of the mapping table.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub dn: DnMatch,
    pub attribute: &'static str,
    /// Metric name without the configured prefix.
    pub name: &'static str,
    pub kind: MetricKind,
    pub help: &'static str,
    /// Fixed labels attached to every sample of this row.
    pub labels: &'static [(&'static str, &'static str)],
    pub parser: ValueParser,
}

const MONITOR_COUNTER: &str = "monitorCounter";
const MONITORED_INFO: &str = "monitoredInfo";

const fn exact(
    dn: &'static str,
    attribute: &'static str,
    name: &'static str,
    kind: MetricKind,
    help: &'static str,
    labels: &'static [(&'static str, &'static str)],
) -> MetricDef {
    MetricDef {
        dn: DnMatch::Exact(dn),
        attribute,
        name,
        kind,
        help,
        labels,
        parser: ValueParser::Number,
    }
}

const THREADS_HELP: &str = "Worker thread pool state, from cn=Threads,cn=Monitor";
const WAITERS_HELP: &str = "Connections waiting for I/O, from cn=Waiters,cn=Monitor";

/// Known monitoring paths.
pub const METRIC_TABLE: &[MetricDef] = &[
    // Connections
    exact(
        "cn=Total,cn=Connections,cn=Monitor",
        MONITOR_COUNTER,
        "connections_total",
        MetricKind::Gauge,
        "Connections accepted since server start",
        &[],
    ),
    exact(
        "cn=Current,cn=Connections,cn=Monitor",
        MONITOR_COUNTER,
        "connections_current",
        MetricKind::Gauge,
        "Currently open connections",
        &[],
    ),
    exact(
        "cn=Max File Descriptors,cn=Connections,cn=Monitor",
        MONITOR_COUNTER,
        "connections_max_file_descriptors",
        MetricKind::Gauge,
        "Maximum number of file descriptors available to connections",
        &[],
    ),
    // Statistics
    exact(
        "cn=Bytes,cn=Statistics,cn=Monitor",
        MONITOR_COUNTER,
        "statistics_bytes_total",
        MetricKind::Counter,
        "Bytes sent to clients",
        &[],
    ),
    exact(
        "cn=PDU,cn=Statistics,cn=Monitor",
        MONITOR_COUNTER,
        "statistics_pdu_total",
        MetricKind::Counter,
        "Protocol data units sent to clients",
        &[],
    ),
    exact(
        "cn=Entries,cn=Statistics,cn=Monitor",
        MONITOR_COUNTER,
        "statistics_entries_total",
        MetricKind::Counter,
        "Entries sent to clients",
        &[],
    ),
    exact(
        "cn=Referrals,cn=Statistics,cn=Monitor",
        MONITOR_COUNTER,
        "statistics_referrals_total",
        MetricKind::Counter,
        "Referrals sent to clients",
        &[],
    ),
    // Operations, one child per operation type
    MetricDef {
        dn: DnMatch::ChildOf {
            parent: "cn=Operations,cn=Monitor",
            label: "operation",
        },
        attribute: "monitorOpInitiated",
        name: "operations_initiated_total",
        kind: MetricKind::Counter,
        help: "Operations initiated, by operation type",
        labels: &[],
        parser: ValueParser::Number,
    },
    MetricDef {
        dn: DnMatch::ChildOf {
            parent: "cn=Operations,cn=Monitor",
            label: "operation",
        },
        attribute: "monitorOpCompleted",
        name: "operations_completed_total",
        kind: MetricKind::Counter,
        help: "Operations completed, by operation type",
        labels: &[],
        parser: ValueParser::Number,
    },
    // Threads
    exact(
        "cn=Max,cn=Threads,cn=Monitor",
        MONITORED_INFO,
        "threads",
        MetricKind::Gauge,
        THREADS_HELP,
        &[("state", "max")],
    ),
    exact(
        "cn=Max Pending,cn=Threads,cn=Monitor",
        MONITORED_INFO,
        "threads",
        MetricKind::Gauge,
        THREADS_HELP,
        &[("state", "max_pending")],
    ),
    exact(
        "cn=Open,cn=Threads,cn=Monitor",
        MONITORED_INFO,
        "threads",
        MetricKind::Gauge,
        THREADS_HELP,
        &[("state", "open")],
    ),
    exact(
        "cn=Starting,cn=Threads,cn=Monitor",
        MONITORED_INFO,
        "threads",
        MetricKind::Gauge,
        THREADS_HELP,
        &[("state", "starting")],
    ),
    exact(
        "cn=Active,cn=Threads,cn=Monitor",
        MONITORED_INFO,
        "threads",
        MetricKind::Gauge,
        THREADS_HELP,
        &[("state", "active")],
    ),
    exact(
        "cn=Pending,cn=Threads,cn=Monitor",
        MONITORED_INFO,
        "threads",
        MetricKind::Gauge,
        THREADS_HELP,
        &[("state", "pending")],
    ),
    exact(
        "cn=Backload,cn=Threads,cn=Monitor",
        MONITORED_INFO,
        "threads",
        MetricKind::Gauge,
        THREADS_HELP,
        &[("state", "backload")],
    ),
    // Waiters
    exact(
        "cn=Read,cn=Waiters,cn=Monitor",
        MONITOR_COUNTER,
        "waiters",
        MetricKind::Gauge,
        WAITERS_HELP,
        &[("type", "read")],
    ),
    exact(
        "cn=Write,cn=Waiters,cn=Monitor",
        MONITOR_COUNTER,
        "waiters",
        MetricKind::Gauge,
        WAITERS_HELP,
        &[("type", "write")],
    ),
    // Time
    exact(
        "cn=Uptime,cn=Time,cn=Monitor",
        MONITORED_INFO,
        "uptime_seconds",
        MetricKind::Gauge,
        "Seconds since server start",
        &[],
    ),
    // Replication state per database
    MetricDef {
        dn: DnMatch::ChildOf {
            parent: "cn=Databases,cn=Monitor",
            label: "database",
        },
        attribute: "contextCSN",
        name: "replication_context_csn_timestamp_seconds",
        kind: MetricKind::Gauge,
        help: "Timestamp of the latest change seen from each replica (contextCSN)",
        labels: &[],
        parser: ValueParser::ContextCsn,
    },
];

/// A value that could not be turned into a sample. Not fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingWarning {
    pub dn: String,
    pub attribute: String,
    pub value: String,
    pub reason: String,
}

impl std::fmt::Display for MappingWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}={:?}: {}",
            self.dn, self.attribute, self.value, self.reason
        )
    }
}

/// Result of mapping one entry sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingOutcome {
    pub snapshot: MetricsSnapshot,
    pub warnings: Vec<MappingWarning>,
}

/// Translates monitoring entries into a [`MetricsSnapshot`] using [`METRIC_TABLE`].
///
/// Mapping is deterministic: the same entries always produce the same outcome.
#[derive(Debug, Clone)]
pub struct MetricMapper {
    prefix: String,
    default_labels: Vec<(String, String)>,
    table: &'static [MetricDef],
}

impl MetricMapper {
    /// Create a mapper with a metric name prefix (e.g. "openldap") and labels
    /// added to every sample.
    pub fn new(prefix: &str, default_labels: &BTreeMap<String, String>) -> Self {
        // Keys that sanitize to the same name keep the first in key order.
        let mut labels: Vec<(String, String)> = Vec::with_capacity(default_labels.len());
        for (k, v) in default_labels {
            let name = sanitize_label_name(k);
            if labels.iter().any(|(existing, _)| *existing == name) {
                debug!(label = %k, sanitized = %name, "Dropping default label with duplicate name");
                continue;
            }
            labels.push((name, v.clone()));
        }

        Self {
            prefix: sanitize_prefix(prefix),
            default_labels: labels,
            table: METRIC_TABLE,
        }
    }

    /// Full metric name for a table row.
    pub fn metric_name(&self, name: &str) -> String {
        build_metric_name(&self.prefix, name)
    }

    /// Map every entry against the table.
    pub fn map(&self, entries: &[MonitoringEntry]) -> MappingOutcome {
        let mut outcome = MappingOutcome::default();

        for entry in entries {
            let dn = normalize_dn(&entry.dn);
            let mut matched = false;

            for def in self.table {
                let Some(child) = match_dn(&def.dn, &dn) else {
                    continue;
                };
                matched = true;
                self.map_row(def, child.as_deref(), entry, &mut outcome);
            }

            if !matched {
                trace!(dn = %entry.dn, "No mapping for monitor entry");
            }
        }

        outcome
    }

    fn map_row(
        &self,
        def: &MetricDef,
        child: Option<&str>,
        entry: &MonitoringEntry,
        outcome: &mut MappingOutcome,
    ) {
        let values = entry.values(def.attribute);
        if values.is_empty() {
            return;
        }

        let mut labels: Vec<(String, String)> = def
            .labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let (DnMatch::ChildOf { label, .. }, Some(child)) = (def.dn, child) {
            labels.push((label.to_string(), child.to_string()));
        }

        let name = self.metric_name(def.name);

        match def.parser {
            ValueParser::Number => {
                let raw = &values[0];
                if values.len() > 1 {
                    trace!(dn = %entry.dn, attribute = def.attribute, "Using first of multiple values");
                }
                match parse_number(raw) {
                    Ok(value) => self.push(def, &name, labels, value, entry, outcome),
                    Err(reason) => outcome.warnings.push(warning(entry, def, raw, reason)),
                }
            }
            ValueParser::ContextCsn => {
                for raw in values {
                    match parse_context_csn(raw) {
                        Ok((timestamp, sid)) => {
                            let mut labels = labels.clone();
                            labels.push(("sid".to_string(), sid));
                            self.push(def, &name, labels, timestamp, entry, outcome);
                        }
                        Err(reason) => outcome.warnings.push(warning(entry, def, raw, reason)),
                    }
                }
            }
        }
    }

    fn push(
        &self,
        def: &MetricDef,
        name: &str,
        mut labels: Vec<(String, String)>,
        value: f64,
        entry: &MonitoringEntry,
        outcome: &mut MappingOutcome,
    ) {
        // Default labels never override labels from the table.
        for (k, v) in &self.default_labels {
            if !labels.iter().any(|(lk, _)| lk == k) {
                labels.push((k.clone(), v.clone()));
            }
        }

        let sample = MetricSample::new(SeriesKey::new(name, labels), def.kind, def.help, value);
        if !outcome.snapshot.insert(sample) {
            debug!(dn = %entry.dn, metric = %name, "Duplicate series, keeping first value");
        }
    }
}

fn warning(entry: &MonitoringEntry, def: &MetricDef, raw: &str, reason: String) -> MappingWarning {
    debug!(dn = %entry.dn, attribute = def.attribute, value = %raw, reason = %reason, "Skipping unparseable value");
    MappingWarning {
        dn: entry.dn.clone(),
        attribute: def.attribute.to_string(),
        value: raw.to_string(),
        reason,
    }
}

/// Lowercase a DN and strip whitespace around RDN separators.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| {
            let rdn = rdn.trim();
            match rdn.split_once('=') {
                Some((attr, value)) => format!("{}={}", attr.trim(), value.trim()),
                None => rdn.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
        .to_ascii_lowercase()
}

/// Match a normalized DN against a row.
///
/// Returns `None` when the row does not apply, `Some(None)` for an exact match
/// and `Some(Some(value))` with the child's RDN value for a `ChildOf` match.
fn match_dn(pattern: &DnMatch, dn: &str) -> Option<Option<String>> {
    match pattern {
        DnMatch::Exact(expected) => (normalize_dn(expected) == dn).then_some(None),
        DnMatch::ChildOf { parent, .. } => {
            let suffix = format!(",{}", normalize_dn(parent));
            let rdn = dn.strip_suffix(&suffix)?;
            if rdn.contains(',') {
                return None;
            }
            let (_, value) = rdn.split_once('=')?;
            if value.is_empty() {
                return None;
            }
            Some(Some(value.replace(' ', "_")))
        }
    }
}

/// Parse an integer or float attribute value. Non-finite values are rejected.
pub fn parse_number(raw: &str) -> Result<f64, String> {
    let trimmed = raw.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return Ok(v as f64);
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        Ok(_) => Err("value is not finite".to_string()),
        Err(_) => Err("not a number".to_string()),
    }
}

/// Parse a `contextCSN` value into (unix timestamp in seconds, server id).
///
/// Format: `YYYYmmddHHMMSS.ffffffZ#count#sid#mod`.
pub fn parse_context_csn(raw: &str) -> Result<(f64, String), String> {
    let mut parts = raw.trim().split('#');
    let timestamp = parts.next().unwrap_or_default();
    let _count = parts.next().ok_or("missing change count")?;
    let sid = parts.next().ok_or("missing server id")?;

    if sid.is_empty() {
        return Err("empty server id".to_string());
    }

    let parsed = NaiveDateTime::parse_from_str(timestamp, "%Y%m%d%H%M%S%.fZ")
        .map_err(|e| format!("invalid timestamp: {}", e))?;
    let micros = parsed.and_utc().timestamp_micros();

    Ok((micros as f64 / 1_000_000.0, sid.to_string()))
}

/// Sanitize a metric name to be Prometheus-compatible.
///
/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
/// This function:
/// - Replaces invalid characters with underscores
/// - Ensures the name starts with a letter or underscore
/// - Collapses multiple underscores into one
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);
    let mut last_was_underscore = false;

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        result.push('_');
        last_was_underscore = true;
    }

    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == ':' {
            result.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        result.push_str("unnamed");
    }

    result
}

/// Sanitize a label name to be Prometheus-compatible.
///
/// Prometheus label names must match `[a-zA-Z_][a-zA-Z0-9_]*`.
/// Labels starting with `__` are reserved for internal use.
pub fn sanitize_label_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut last_was_underscore = false;

    for (i, c) in name.chars().enumerate() {
        let valid = if i == 0 {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_ascii_alphanumeric() || c == '_'
        };

        if valid {
            result.push(c);
            last_was_underscore = c == '_';
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        return "label".to_string();
    }

    if result.starts_with("__") {
        result.insert(0, 'z');
    }

    result
}

/// Normalize a metric name prefix. An empty prefix stays empty.
pub fn sanitize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        String::new()
    } else {
        sanitize_metric_name(prefix)
    }
}

/// Build a full metric name: `{prefix}_{name}`.
pub fn build_metric_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}
