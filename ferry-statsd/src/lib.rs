//! A typed statsd client for internal queue metrics.
//!
//! Metric names are declared once by implementing one of the name traits
//! ([`CounterMetric`], [`GaugeMetric`], [`TimerMetric`]) on an enum, and
//! recorded through the [`metric!`] macro. The traits carry no behavior; they
//! exist so a counter name cannot accidentally be recorded as a gauge.
//!
//! Recording without an installed exporter is a no-op, so library code can
//! emit metrics unconditionally. Processes that want statsd output call
//! [`init`] once at startup:
//!
//! ```no_run
//! ferry_statsd::init(ferry_statsd::MetricsConfig {
//!     prefix: "ferry".to_owned(),
//!     host: "localhost:8125".to_owned(),
//! }).unwrap();
//! ```
//!
//! Tests assert on emitted metrics with [`with_capturing_test_client`], which
//! installs a thread-local recorder and returns the formatted lines:
//!
//! ```
//! use ferry_statsd::{metric, CounterMetric};
//!
//! struct Accepted;
//!
//! impl CounterMetric for Accepted {
//!     fn name(&self) -> &'static str {
//!         "accepted"
//!     }
//! }
//!
//! let lines = ferry_statsd::with_capturing_test_client(|| {
//!     metric!(counter(Accepted) += 1, reason = "test");
//! });
//! assert_eq!(lines, ["accepted:1|c|#reason:test"]);
//! ```

use std::fmt;

use metrics_exporter_dogstatsd::{AggregationMode, BuildError, DogStatsDBuilder};

use crate::capture::CaptureRecorder;

mod capture;

#[doc(hidden)]
pub mod _private {
    pub use ::metrics::*;
}

/// Configuration for the statsd exporter installed by [`init`].
#[derive(Debug)]
pub struct MetricsConfig {
    /// Prefix prepended to every metric name.
    pub prefix: String,
    /// `host:port` of the statsd endpoint.
    pub host: String,
}

/// Error returned from [`init`].
#[derive(Debug)]
pub struct Error(BuildError);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<BuildError> for Error {
    fn from(value: BuildError) -> Self {
        Self(value)
    }
}

/// Installs the global dogstatsd exporter.
pub fn init(config: MetricsConfig) -> Result<(), Error> {
    ferry_log::info!("reporting metrics to statsd at {}", config.host);

    DogStatsDBuilder::default()
        .with_remote_address(&config.host)?
        .with_aggregation_mode(AggregationMode::Aggressive)
        .send_histograms_as_distributions(true)
        .set_global_prefix(config.prefix)
        .install()?;

    Ok(())
}

/// Runs `f` with a capturing recorder on the current thread and returns the
/// formatted metric lines it emitted.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let recorder = CaptureRecorder::default();
    metrics::with_local_recorder(&recorder, f);
    recorder.consume()
}

/// Names a counter metric.
///
/// Counters are monotonically increasing event counts; the receiving server
/// derives rates from them. Record with `metric!(counter(Name) += n)`.
pub trait CounterMetric {
    /// The statsd name of this counter.
    fn name(&self) -> &'static str;
}

/// Names a gauge metric.
///
/// Gauges are instantaneous values that keep their last recorded value.
/// Record with `metric!(gauge(Name) = value)`, or adjust with `+=` / `-=`.
pub trait GaugeMetric {
    /// The statsd name of this gauge.
    fn name(&self) -> &'static str;
}

/// Names a timer metric.
///
/// Timers record durations in milliseconds. Record an explicit
/// `std::time::Duration` with `metric!(timer(Name) = duration)`, or time a
/// block of code:
///
/// ```
/// use ferry_statsd::{metric, TimerMetric};
///
/// struct Flush;
///
/// impl TimerMetric for Flush {
///     fn name(&self) -> &'static str {
///         "flush"
///     }
/// }
///
/// let value = metric!(timer(Flush), shard = "0", {
///     2 + 2
/// });
/// assert_eq!(value, 4);
/// ```
pub trait TimerMetric {
    /// The statsd name of this timer.
    fn name(&self) -> &'static str;
}

#[doc(hidden)]
#[macro_export]
macro_rules! metric_key {
    ($name:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        let name = $crate::_private::KeyName::from_const_str($name);
        let labels = ::std::vec![
            $($crate::_private::Label::new(
                $crate::_private::SharedString::const_str($k),
                $crate::_private::SharedString::from_owned($v.to_string()),
            )),*
        ];

        $crate::_private::Key::from_parts(name, labels)
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! metric_metadata {
    () => {
        $crate::_private::metadata_var!(::std::module_path!(), $crate::_private::Level::INFO)
    };
}

/// Records a metric named by one of the metric traits.
///
/// Optional `tag = value` pairs follow the metric expression; tag values are
/// converted with `to_string`. See the [crate documentation](self) for
/// examples.
#[macro_export]
macro_rules! metric {
    // counter increment
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {{
        match $value {
            value if value != 0 => {
                let key = $crate::metric_key!($crate::CounterMetric::name(&$id) $(, stringify!($($k).*) => $v)*);
                let metadata = $crate::metric_metadata!();
                $crate::_private::with_recorder(|recorder| recorder.register_counter(&key, metadata))
                    .increment(value);
            }
            _ => {}
        }
    }};

    // gauge set
    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {{
        let key = $crate::metric_key!($crate::GaugeMetric::name(&$id) $(, stringify!($($k).*) => $v)*);
        let metadata = $crate::metric_metadata!();
        $crate::_private::with_recorder(|recorder| recorder.register_gauge(&key, metadata))
            .set($value as f64);
    }};

    // gauge increment
    (gauge($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {{
        let key = $crate::metric_key!($crate::GaugeMetric::name(&$id) $(, stringify!($($k).*) => $v)*);
        let metadata = $crate::metric_metadata!();
        $crate::_private::with_recorder(|recorder| recorder.register_gauge(&key, metadata))
            .increment($value as f64);
    }};

    // gauge decrement
    (gauge($id:expr) -= $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {{
        let key = $crate::metric_key!($crate::GaugeMetric::name(&$id) $(, stringify!($($k).*) => $v)*);
        let metadata = $crate::metric_metadata!();
        $crate::_private::with_recorder(|recorder| recorder.register_gauge(&key, metadata))
            .decrement($value as f64);
    }};

    // timer value
    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {{
        let key = $crate::metric_key!($crate::TimerMetric::name(&$id) $(, stringify!($($k).*) => $v)*);
        let metadata = $crate::metric_metadata!();
        $crate::_private::with_recorder(|recorder| recorder.register_histogram(&key, metadata))
            .record($value.as_nanos() as f64 / 1e6);
    }};

    // timed block
    (timer($id:expr), $($($k:ident).* = $v:expr,)* $block:block) => {{
        let started = ::std::time::Instant::now();
        let rv = { $block };
        $crate::metric!(timer($id) = started.elapsed() $(, $($k).* = $v)*);
        rv
    }};
}
