use std::sync::{Arc, Mutex, PoisonError};

use metrics::{Counter, Gauge, Histogram, Key, KeyName, SharedString, Unit};

/// A recorder that captures emitted metrics as statsd-style lines.
///
/// Installed thread-locally by
/// [`with_capturing_test_client`](crate::with_capturing_test_client).
#[derive(Debug, Default)]
pub struct CaptureRecorder {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CaptureRecorder {
    /// Returns the captured lines in emission order.
    pub fn consume(self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.clone()
    }

    fn handle(&self, key: &Key, kind: &'static str) -> Arc<CaptureFn> {
        Arc::new(CaptureFn {
            lines: Arc::clone(&self.lines),
            key: key.clone(),
            kind,
        })
    }
}

impl metrics::Recorder for CaptureRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &metrics::Metadata<'_>) -> Counter {
        Counter::from_arc(self.handle(key, "c"))
    }

    fn register_gauge(&self, key: &Key, _: &metrics::Metadata<'_>) -> Gauge {
        Gauge::from_arc(self.handle(key, "g"))
    }

    fn register_histogram(&self, key: &Key, _: &metrics::Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.handle(key, "ms"))
    }
}

struct CaptureFn {
    lines: Arc<Mutex<Vec<String>>>,
    key: Key,
    kind: &'static str,
}

impl CaptureFn {
    fn push(&self, value: impl std::fmt::Display) {
        let name = self.key.name();
        let tags = self
            .key
            .labels()
            .map(|label| format!("{}:{}", label.key(), label.value()))
            .collect::<Vec<_>>()
            .join(",");

        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.push(format!("{name}:{value}|{}|#{tags}", self.kind));
    }
}

impl metrics::CounterFn for CaptureFn {
    fn increment(&self, value: u64) {
        self.push(value);
    }

    fn absolute(&self, value: u64) {
        self.push(format!("={value}"));
    }
}

impl metrics::GaugeFn for CaptureFn {
    fn increment(&self, value: f64) {
        self.push(format!("+{value}"));
    }

    fn decrement(&self, value: f64) {
        self.push(format!("-{value}"));
    }

    fn set(&self, value: f64) {
        self.push(value);
    }
}

impl metrics::HistogramFn for CaptureFn {
    fn record(&self, value: f64) {
        self.push(value);
    }
}
