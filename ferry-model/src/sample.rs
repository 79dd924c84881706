use serde::{Deserialize, Serialize};

use crate::labels::{LabelSet, METRIC_NAME_LABEL};

/// Milliseconds since the Unix epoch.
///
/// The queue forwards timestamps verbatim; only the backend interprets them.
pub type Timestamp = i64;

/// One observation of a time series.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Sample {
    /// The fully qualified label set identifying the series.
    pub labels: LabelSet,
    /// The observation time.
    pub timestamp: Timestamp,
    /// The observed value.
    pub value: f64,
}

impl Sample {
    /// Creates a sample.
    pub fn new(labels: LabelSet, timestamp: Timestamp, value: f64) -> Self {
        Self {
            labels,
            timestamp,
            value,
        }
    }

    /// Returns the metric name carried in the `__name__` label.
    ///
    /// Returns the empty string if the sample has no name label.
    pub fn name(&self) -> &str {
        self.labels.get(METRIC_NAME_LABEL)
    }
}
