//! Core data model for the ferry write path.
//!
//! The model is deliberately small: a [`LabelSet`] identifies a time series, a
//! [`Sample`] is one observation of a series, and a [`MetricFamily`] is the
//! external representation handed over by the scraper. The queue only ever
//! routes and forwards these types; it never interprets timestamps or values.
//!
//! Label sets are stored sorted by name, which makes equality, formatting and
//! the 64-bit identity hash independent of how the set was assembled. The
//! identity hash is the routing key for shard selection and must therefore be
//! stable across processes, see [`LabelSet::hash64`].

#![warn(missing_docs)]

mod family;
mod labels;
mod sample;

pub use self::family::{FamilyMetric, MetricFamily, MetricType};
pub use self::labels::{is_valid_label_name, Label, LabelBuilder, LabelSet, METRIC_NAME_LABEL};
pub use self::sample::{Sample, Timestamp};
