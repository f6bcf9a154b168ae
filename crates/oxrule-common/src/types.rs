use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Label holding the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Bit pattern of the staleness marker understood by Prometheus-compatible storages.
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// Returns the staleness marker value.
pub fn stale_nan() -> f64 {
    f64::from_bits(STALE_NAN_BITS)
}

/// Reports whether `v` is the staleness marker (and not an ordinary NaN).
pub fn is_stale_nan(v: f64) -> bool {
    v.to_bits() == STALE_NAN_BITS
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A single series returned by a datasource query.
///
/// Timestamps are unix seconds. Instant queries return exactly one value per
/// metric; range queries return one value per step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub labels: Vec<Label>,
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

impl Metric {
    /// Builds an instant-query metric from `(name, value)` label pairs.
    ///
    /// # Examples
    ///
    /// ```
    /// use oxrule_common::Metric;
    ///
    /// let m = Metric::instant(&[("__name__", "up"), ("job", "node")], 1_700_000_000, 1.0);
    /// assert_eq!(m.label("job"), Some("node"));
    /// assert_eq!(m.values, vec![1.0]);
    /// ```
    pub fn instant(labels: &[(&str, &str)], timestamp: i64, value: f64) -> Self {
        Self {
            labels: labels.iter().map(|(k, v)| Label::new(*k, *v)).collect(),
            timestamps: vec![timestamp],
            values: vec![value],
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Sets label `name` to `value`, replacing an existing entry in place.
    pub fn set_label(&mut self, name: &str, value: &str) {
        match self.labels.iter_mut().find(|l| l.name == name) {
            Some(l) => l.value = value.to_string(),
            None => self.labels.push(Label::new(name, value)),
        }
    }

    pub fn del_label(&mut self, name: &str) {
        self.labels.retain(|l| l.name != name);
    }

    /// Label pairs as an ordered map; later duplicates win.
    pub fn label_map(&self) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect()
    }

    /// First sample value, `NaN` for an empty metric.
    pub fn first_value(&self) -> f64 {
        self.values.first().copied().unwrap_or(f64::NAN)
    }
}

/// Result of one datasource request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub data: Vec<Metric>,
    /// Number of series the datasource scanned, when it reports it.
    pub series_fetched: Option<usize>,
    /// Whether the datasource returned a partial response, when it reports it.
    pub is_partial: Option<bool>,
}

impl QueryResult {
    pub fn new(data: Vec<Metric>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }
}

/// Sample timestamps are unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: f64,
    pub timestamp: i64,
}

/// A series produced by a rule and handed to remote write.
///
/// Labels are kept sorted by name so that equal label sets always compare
/// and stringify identically.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeSeries {
    pub labels: Vec<Label>,
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    /// Builds a series from parallel value/timestamp slices; `timestamps` are
    /// unix seconds and are stored as milliseconds.
    pub fn new(values: &[f64], timestamps: &[i64], labels: &BTreeMap<String, String>) -> Self {
        let samples = values
            .iter()
            .zip(timestamps)
            .map(|(v, ts)| Sample {
                value: *v,
                timestamp: ts * 1000,
            })
            .collect();
        let labels = labels
            .iter()
            .map(|(k, v)| Label::new(k.clone(), v.clone()))
            .collect();
        Self { labels, samples }
    }

    /// Builds a series from an arbitrary label list, sorting it by name.
    pub fn from_labels(mut labels: Vec<Label>, samples: Vec<Sample>) -> Self {
        labels.sort();
        Self { labels, samples }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Renders labels as `{name="value",...}`; used as the identity key of a
    /// series when tracking what was previously written.
    ///
    /// # Examples
    ///
    /// ```
    /// use oxrule_common::{Label, TimeSeries};
    ///
    /// let ts = TimeSeries::from_labels(
    ///     vec![Label::new("job", "a"), Label::new("__name__", "foo")],
    ///     vec![],
    /// );
    /// assert_eq!(ts.labels_string(), r#"{__name__="foo",job="a"}"#);
    /// ```
    pub fn labels_string(&self) -> String {
        let mut s = String::with_capacity(self.labels.len() * 16 + 2);
        s.push('{');
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            let name = if label.name.is_empty() {
                METRIC_NAME_LABEL
            } else {
                label.name.as_str()
            };
            let _ = write!(s, "{name}={:?}", label.value);
        }
        s.push('}');
        s
    }
}
