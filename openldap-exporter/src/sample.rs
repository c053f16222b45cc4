//! Typed metric samples and the snapshot produced by one scrape cycle.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Prometheus metric type of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    /// Get the TYPE comment string for Prometheus exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// A unique identifier for a metric time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// The full Prometheus metric name.
    pub name: String,
    /// Label key-value pairs, sorted by key.
    pub labels: Vec<(String, String)>,
}

impl SeriesKey {
    /// Create a key, sorting the labels so equal label sets compare equal.
    pub fn new(name: impl Into<String>, mut labels: Vec<(String, String)>) -> Self {
        labels.sort();
        Self {
            name: name.into(),
            labels,
        }
    }
}

/// One numeric sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub key: SeriesKey,
    pub kind: MetricKind,
    /// HELP text of the metric family.
    pub help: &'static str,
    pub value: f64,
}

impl MetricSample {
    pub fn new(key: SeriesKey, kind: MetricKind, help: &'static str, value: f64) -> Self {
        Self {
            key,
            kind,
            help,
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn labels(&self) -> &[(String, String)] {
        &self.key.labels
    }
}

/// The complete sample set of one successful scrape.
///
/// Samples are keyed by (name, label set), so a snapshot never holds two
/// samples for the same series. Iteration is ordered by key, which keeps
/// samples of one family adjacent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    samples: BTreeMap<SeriesKey, MetricSample>,
}

impl MetricsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a sample unless its series is already present.
    ///
    /// Returns `false` (and keeps the existing sample) on a duplicate key.
    pub fn insert(&mut self, sample: MetricSample) -> bool {
        match self.samples.entry(sample.key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(sample);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, key: &SeriesKey) -> Option<&MetricSample> {
        self.samples.get(key)
    }

    /// Look up a sample by name and labels (in any order).
    pub fn find(&self, name: &str, labels: &[(&str, &str)]) -> Option<&MetricSample> {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.samples.get(&SeriesKey::new(name, labels))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricSample> {
        self.samples.values()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
