use std::fmt;

use serde::{Deserialize, Serialize};

use crate::labels::{Label, LabelSet, METRIC_NAME_LABEL};
use crate::sample::{Sample, Timestamp};

/// The type of a metric family.
///
/// The queue does not aggregate and therefore never interprets the type; it
/// is carried so sinks can map samples onto typed backend schemas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// A monotonically increasing value.
    Counter,
    /// A value that can go up and down.
    Gauge,
    /// A precomputed summary of observations.
    Summary,
    /// A cumulative histogram of observations.
    Histogram,
    /// A value of unknown type.
    Untyped,
}

impl MetricType {
    /// Returns the lowercase name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Summary => "summary",
            Self::Histogram => "histogram",
            Self::Untyped => "untyped",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One metric within a [`MetricFamily`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FamilyMetric {
    /// Label pairs of this metric, without the family name.
    #[serde(default)]
    pub labels: Vec<Label>,
    /// The observation time.
    pub timestamp: Timestamp,
    /// The observed value.
    pub value: f64,
}

/// A batch of metrics sharing a name and a type, as produced by the scraper.
///
/// This is the external representation at the producer boundary. The queue
/// reads only the name, the type, and each metric's labels, timestamp and
/// value.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MetricFamily {
    /// The family name, qualified into the `__name__` label on expansion.
    pub name: String,
    /// The family type.
    #[serde(rename = "type")]
    pub ty: MetricType,
    /// The metrics of this family.
    #[serde(default)]
    pub metrics: Vec<FamilyMetric>,
}

impl MetricFamily {
    /// Expands this family into samples with fully qualified label sets.
    ///
    /// Each metric yields one sample whose label set is the metric's pairs
    /// plus `__name__` set to the family name. The family name takes
    /// precedence over a stray `__name__` pair in the metric's own labels.
    /// A family without metrics yields no samples.
    pub fn into_samples(self) -> impl Iterator<Item = Sample> {
        let name = self.name;
        self.metrics.into_iter().map(move |metric| {
            let mut labels = Vec::with_capacity(metric.labels.len() + 1);
            labels.push(Label::new(METRIC_NAME_LABEL, name.clone()));
            labels.extend(metric.labels);
            Sample::new(LabelSet::new(labels), metric.timestamp, metric.value)
        })
    }
}
