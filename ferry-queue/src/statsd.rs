use ferry_statsd::{CounterMetric, GaugeMetric, TimerMetric};

/// Counter metrics for the sample queue.
pub enum QueueCounters {
    /// Number of samples accepted into a shard buffer.
    SamplesEnqueued,

    /// Number of samples dropped before reaching a shard buffer.
    ///
    /// Tagged with `reason`: `full` when the target buffer had no room or
    /// the queue was already closed, `relabel` when a relabel rule dropped
    /// the sample.
    SamplesDropped,

    /// Number of batches stored successfully.
    BatchesSent,

    /// Number of batches the sink failed to store. Failed batches are
    /// discarded, not retried.
    BatchErrors,
}

impl CounterMetric for QueueCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::SamplesEnqueued => "queue.samples.enqueued",
            Self::SamplesDropped => "queue.samples.dropped",
            Self::BatchesSent => "queue.batches.sent",
            Self::BatchErrors => "queue.batches.errors",
        }
    }
}

/// Gauge metrics for the sample queue.
pub enum QueueGauges {
    /// The current shard count.
    Shards,

    /// Total number of samples buffered across all shards, sampled by the
    /// autoscaler.
    Depth,
}

impl GaugeMetric for QueueGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::Shards => "queue.shards",
            Self::Depth => "queue.depth",
        }
    }
}

/// Timer metrics for the sample queue.
pub enum QueueTimers {
    /// Time spent in a single `Sink::store` call.
    StoreDuration,
}

impl TimerMetric for QueueTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::StoreDuration => "queue.store.duration",
        }
    }
}
