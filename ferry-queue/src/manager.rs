use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use ferry_model::{MetricFamily, Sample};
use ferry_relabel::{RelabelError, RelabelRule};
use ferry_statsd::metric;

use crate::config::QueueConfig;
use crate::shards::Shards;
use crate::sink::Sink;
use crate::statsd::{QueueCounters, QueueGauges};

/// How often the autoscaler samples queue pressure.
const SHARD_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Any error that may occur while building or starting a [`QueueManager`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The per-shard buffer capacity is zero.
    #[error("queue capacity must be greater than zero")]
    InvalidCapacity,

    /// The batch size bound is zero.
    #[error("max samples per send must be greater than zero")]
    InvalidBatchSize,

    /// The batch deadline is zero.
    #[error("batch send deadline must be greater than zero")]
    InvalidDeadline,

    /// The shard bounds are empty or inverted.
    #[error("invalid shard bounds: min {min} must lie in 1..={max}")]
    InvalidShardBounds {
        /// The configured lower bound.
        min: usize,
        /// The configured upper bound.
        max: usize,
    },

    /// A relabel rule failed to validate.
    #[error("invalid relabel configuration")]
    Relabel(#[from] RelabelError),

    /// `start` was called a second time.
    #[error("queue manager was already started")]
    AlreadyStarted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

/// The sharded fan-out queue between the scraper and the backend sink.
///
/// Cloning is cheap and yields a handle to the same queue. See the
/// [crate documentation](crate) for the delivery guarantees.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    rules: Vec<RelabelRule>,
    sink: Arc<dyn Sink>,
    /// The current shard set. Swapped only by the autoscaler; the lock is
    /// held for the pointer swap, never across an await.
    shards: Mutex<Arc<Shards>>,
    state: Mutex<State>,
    shutdown_tx: watch::Sender<bool>,
    scaler: Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    /// Creates a queue manager forwarding to the given sink.
    ///
    /// Validates the configuration and compiles the relabel rules; every
    /// configuration error surfaces here, before anything runs.
    pub fn new(config: QueueConfig, sink: Arc<dyn Sink>) -> Result<Self, QueueError> {
        config.validate()?;
        let rules = ferry_relabel::compile(&config.relabel_configs)?;
        let shards = Arc::new(Shards::new(config.min_shards, config.capacity));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                rules,
                sink,
                shards: Mutex::new(shards),
                state: Mutex::new(State::Idle),
                shutdown_tx,
                scaler: Mutex::new(None),
            }),
        })
    }

    /// Expands a metric family, relabels each sample, and routes it to the
    /// current shard set.
    ///
    /// Never blocks and never waits on the sink. Samples rejected by a
    /// relabel rule or by a full shard buffer are dropped and counted.
    pub fn append(&self, family: MetricFamily) {
        let inner = &self.inner;
        // Held across the whole enqueue loop: a resize swap must not
        // interleave with an append, or a stale shard set could deliver a
        // late sample ahead of a newer one for the same series. Enqueues
        // never block, so the critical section stays short.
        let shards = inner.shards.lock();

        for sample in family.into_samples() {
            let sample = if inner.rules.is_empty() {
                sample
            } else {
                let Sample {
                    labels,
                    timestamp,
                    value,
                } = sample;
                match ferry_relabel::process(labels, &inner.rules) {
                    Some(labels) => Sample::new(labels, timestamp, value),
                    None => {
                        metric!(
                            counter(QueueCounters::SamplesDropped) += 1,
                            reason = "relabel"
                        );
                        continue;
                    }
                }
            };

            if shards.enqueue(sample) {
                metric!(counter(QueueCounters::SamplesEnqueued) += 1);
            } else {
                metric!(counter(QueueCounters::SamplesDropped) += 1, reason = "full");
            }
        }
    }

    /// Spawns the shard workers and, when the shard bounds allow scaling,
    /// the autoscaler.
    ///
    /// Samples appended before `start` are buffered up to the shard
    /// capacity and flushed once the workers run. Must be called within a
    /// tokio runtime. A second call returns [`QueueError::AlreadyStarted`].
    pub fn start(&self) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock();
            if *state != State::Idle {
                return Err(QueueError::AlreadyStarted);
            }
            *state = State::Running;
        }

        let shards = self.inner.shards.lock().clone();
        shards.start(Arc::clone(&self.inner.sink), &self.inner.config);
        metric!(gauge(QueueGauges::Shards) = shards.len());

        if self.inner.config.max_shards > self.inner.config.min_shards {
            let inner = Arc::clone(&self.inner);
            let shutdown = self.inner.shutdown_tx.subscribe();
            *self.inner.scaler.lock() = Some(tokio::spawn(run_scaler(inner, shutdown)));
        }

        Ok(())
    }

    /// Shuts the queue down.
    ///
    /// Stops the autoscaler, closes all shard buffers and waits for the
    /// workers to flush their residual batches and exit. Samples appended
    /// after the close are dropped. No deadline is imposed; callers that
    /// need one wrap this in a timeout.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == State::Stopped {
                return;
            }
            *state = State::Stopped;
        }

        let _ = self.inner.shutdown_tx.send(true);
        let scaler = self.inner.scaler.lock().take();
        if let Some(handle) = scaler {
            let _ = handle.await;
        }

        let shards = self.inner.shards.lock().clone();
        shards.stop().await;
    }

    /// Returns the current shard count.
    pub fn shard_count(&self) -> usize {
        self.inner.shards.lock().len()
    }

    /// Returns the total number of samples currently buffered.
    pub fn queue_len(&self) -> usize {
        self.inner.shards.lock().queue_len()
    }
}

/// Periodically samples queue pressure and resizes the shard set.
async fn run_scaler(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let start = tokio::time::Instant::now() + SHARD_UPDATE_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, SHARD_UPDATE_INTERVAL);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }

        let shards = inner.shards.lock().clone();
        let depth = shards.queue_len();
        metric!(gauge(QueueGauges::Depth) = depth);

        let current = shards.len();
        let desired = desired_shards(depth, current, &inner.config);
        if desired != current {
            reshard(&inner, desired, &shutdown).await;
        }
    }
}

/// Picks a shard count from current queue pressure.
///
/// Doubles when the buffers run more than half full, halves when they run
/// nearly empty, clamped to the configured bounds. Deliberately stateless;
/// the correctness of a resize lives in [`reshard`], not here.
fn desired_shards(depth: usize, current: usize, config: &QueueConfig) -> usize {
    let total = current * config.capacity;
    let desired = if depth * 2 > total {
        current * 2
    } else if depth * 10 < total {
        current / 2
    } else {
        current
    };
    desired.clamp(config.min_shards, config.max_shards)
}

/// Replaces the current shard set with one of `desired` width.
///
/// The new set is swapped in unstarted: appends buffer into it right away,
/// but its workers only start once the old set has fully drained. Old-set
/// samples therefore reach the sink strictly before new-set samples, which
/// preserves per-series ordering across the resize.
async fn reshard(inner: &Arc<Inner>, desired: usize, shutdown: &watch::Receiver<bool>) {
    let new_shards = Arc::new(Shards::new(desired, inner.config.capacity));
    let old = {
        let mut shards = inner.shards.lock();
        mem::replace(&mut *shards, Arc::clone(&new_shards))
    };

    ferry_log::info!(from = old.len(), to = desired, "resharding sample queue");
    old.stop().await;

    if *shutdown.borrow() {
        // Shutdown raced the resize. The final stop already owns the new
        // set and discards whatever it buffered; do not start workers.
        return;
    }

    new_shards.start(Arc::clone(&inner.sink), &inner.config);
    metric!(gauge(QueueGauges::Shards) = desired);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use similar_asserts::assert_eq;
    use tokio::sync::Semaphore;

    use ferry_model::{FamilyMetric, Label, LabelSet, MetricType};
    use ferry_relabel::{RelabelAction, RelabelConfig};

    use crate::sink::StoreError;

    use super::*;

    /// A sink that records every stored batch.
    struct RecordingSink {
        batches: Mutex<Vec<Vec<Sample>>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
            }
        }

        fn batches(&self) -> Vec<Vec<Sample>> {
            self.batches.lock().clone()
        }

        fn samples(&self) -> Vec<Sample> {
            self.batches.lock().iter().flatten().cloned().collect()
        }

        fn sample_count(&self) -> usize {
            self.batches.lock().iter().map(Vec::len).sum()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn store(&self, batch: Vec<Sample>) -> Result<(), StoreError> {
            self.batches.lock().push(batch);
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    /// A sink that blocks every store call until unlocked, counting calls.
    struct BlockingSink {
        calls: AtomicUsize,
        block: Semaphore,
    }

    impl BlockingSink {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                block: Semaphore::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn unlock(&self) {
            self.block.add_permits(1000);
        }
    }

    #[async_trait]
    impl Sink for BlockingSink {
        async fn store(&self, _batch: Vec<Sample>) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.block.acquire().await.unwrap();
            Ok(())
        }

        fn name(&self) -> &str {
            "blocking"
        }
    }

    /// A sink that takes a fixed amount of (virtual) time per batch.
    struct SlowSink {
        delay: Duration,
        stored: AtomicUsize,
    }

    impl SlowSink {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                stored: AtomicUsize::new(0),
            }
        }

        fn stored(&self) -> usize {
            self.stored.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sink for SlowSink {
        async fn store(&self, batch: Vec<Sample>) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.stored.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    /// A sink that rejects every batch.
    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Sink for FailingSink {
        async fn store(&self, _batch: Vec<Sample>) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::new("backend unavailable"))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn family(name: &str, value: f64) -> MetricFamily {
        family_with(name, &[("job", "test")], value)
    }

    fn family_with(name: &str, labels: &[(&str, &str)], value: f64) -> MetricFamily {
        MetricFamily {
            name: name.to_owned(),
            ty: MetricType::Gauge,
            metrics: vec![FamilyMetric {
                labels: labels
                    .iter()
                    .map(|(name, value)| Label::new(*name, *value))
                    .collect(),
                timestamp: 1_700_000_000_000,
                value,
            }],
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_sample_delivery() {
        ferry_log::init_test();

        let max = 10;
        let config = QueueConfig {
            max_samples_per_send: max,
            capacity: 2 * max,
            min_shards: 1,
            max_shards: 1,
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::new());
        let manager = QueueManager::new(config, sink.clone()).unwrap();

        // The first two batches fit the buffer; everything beyond must be
        // dropped because no worker is draining yet.
        let captures = ferry_statsd::with_capturing_test_client(|| {
            for i in 0..4 * max {
                manager.append(family(&format!("test_metric_{i}"), i as f64));
            }
        });
        let dropped = captures
            .iter()
            .filter(|line| line.starts_with("queue.samples.dropped:1|c|#reason:full"))
            .count();
        assert_eq!(dropped, 2 * max);

        manager.start().unwrap();
        wait_until(|| sink.sample_count() == 2 * max).await;
        manager.stop().await;

        let samples = sink.samples();
        assert_eq!(samples.len(), 2 * max);
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample.name(), format!("test_metric_{i}"));
            assert_eq!(sample.value, i as f64);
        }
        for batch in sink.batches() {
            assert!(batch.len() <= max);
        }
    }

    #[tokio::test]
    async fn test_sample_delivery_order() {
        ferry_log::init_test();

        let series = 10;
        let max = 10;
        let n = series * max;
        let config = QueueConfig {
            max_samples_per_send: max,
            batch_send_deadline: 100,
            min_shards: 3,
            max_shards: 3,
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::new());
        let manager = QueueManager::new(config, sink.clone()).unwrap();

        for i in 0..n {
            manager.append(family(&format!("test_metric_{}", i % series), i as f64));
        }
        manager.start().unwrap();
        wait_until(|| sink.sample_count() == n).await;
        manager.stop().await;

        // Every series sees its values in submission order, regardless of
        // how batches from different shards interleave.
        let mut last: HashMap<String, f64> = HashMap::new();
        for sample in sink.samples() {
            let name = sample.name().to_owned();
            if let Some(previous) = last.get(&name) {
                assert!(
                    sample.value > *previous,
                    "series {name} went backwards: {} after {previous}",
                    sample.value
                );
            }
            last.insert(name, sample.value);
        }
        assert_eq!(last.len(), series);
    }

    #[tokio::test]
    async fn test_at_most_one_store_in_flight_per_shard() {
        ferry_log::init_test();

        let max = 10;
        let config = QueueConfig {
            max_samples_per_send: max,
            capacity: 2 * max,
            min_shards: 1,
            max_shards: 1,
            ..Default::default()
        };
        let sink = Arc::new(BlockingSink::new());
        let manager = QueueManager::new(config, sink.clone()).unwrap();

        manager.start().unwrap();
        for i in 0..2 * max {
            manager.append(family(&format!("test_metric_{i}"), i as f64));
        }

        // The worker drains one batch and then blocks inside the store
        // call; the second batch must stay in the buffer.
        wait_until(|| manager.queue_len() == max).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.calls(), 1);
        assert_eq!(manager.queue_len(), max);

        sink.unlock();
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_deadline_flush() {
        ferry_log::init_test();

        let config = QueueConfig {
            max_samples_per_send: 100,
            batch_send_deadline: 1_000,
            min_shards: 1,
            max_shards: 1,
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::new());
        let manager = QueueManager::new(config, sink.clone()).unwrap();

        manager.start().unwrap();
        let started = tokio::time::Instant::now();
        for i in 0..50 {
            manager.append(family(&format!("test_metric_{i}"), i as f64));
        }

        // A half-full batch stays open until the deadline.
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(sink.sample_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.sample_count(), 50);
        assert_eq!(sink.batches().len(), 1);
        assert!(started.elapsed() >= Duration::from_millis(1_000));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_flushes_residual_batch() {
        ferry_log::init_test();

        let config = QueueConfig {
            max_samples_per_send: 10,
            min_shards: 1,
            max_shards: 1,
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::new());
        let manager = QueueManager::new(config, sink.clone()).unwrap();

        manager.start().unwrap();
        for i in 0..3 {
            manager.append(family(&format!("test_metric_{i}"), i as f64));
        }
        manager.stop().await;

        assert_eq!(sink.sample_count(), 3);
    }

    #[tokio::test]
    async fn test_relabel_admission() {
        ferry_log::init_test();

        let config = QueueConfig {
            min_shards: 1,
            max_shards: 1,
            relabel_configs: vec![RelabelConfig {
                action: RelabelAction::Drop,
                source_labels: vec!["job".to_owned()],
                regex: "^canary$".to_owned(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::new());
        let manager = QueueManager::new(config, sink.clone()).unwrap();
        manager.start().unwrap();

        let captures = ferry_statsd::with_capturing_test_client(|| {
            manager.append(family_with("up", &[("job", "canary")], 1.0));
            manager.append(family_with("up", &[("job", "prod")], 1.0));
        });
        assert!(captures
            .iter()
            .any(|line| line.starts_with("queue.samples.dropped:1|c|#reason:relabel")));

        manager.stop().await;

        let samples = sink.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels.get("job"), "prod");
    }

    #[tokio::test]
    async fn test_sink_errors_discard_batches() {
        ferry_log::init_test();

        let config = QueueConfig {
            max_samples_per_send: 2,
            batch_send_deadline: 100,
            min_shards: 1,
            max_shards: 1,
            ..Default::default()
        };
        let sink = Arc::new(FailingSink {
            calls: AtomicUsize::new(0),
        });
        let manager = QueueManager::new(config, sink.clone()).unwrap();

        manager.start().unwrap();
        for i in 0..4 {
            manager.append(family(&format!("test_metric_{i}"), i as f64));
        }

        // Two batches fail; neither is retried, and the queue keeps going.
        wait_until(|| sink.calls.load(Ordering::SeqCst) >= 2).await;
        manager.stop().await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let manager = QueueManager::new(
            QueueConfig {
                min_shards: 1,
                max_shards: 1,
                ..Default::default()
            },
            Arc::new(RecordingSink::new()),
        )
        .unwrap();

        manager.start().unwrap();
        assert!(matches!(manager.start(), Err(QueueError::AlreadyStarted)));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_relabel_config_fails_construction() {
        let config = QueueConfig {
            relabel_configs: vec![RelabelConfig {
                regex: "(".to_owned(),
                target_label: "t".to_owned(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let result = QueueManager::new(config, Arc::new(RecordingSink::new()));
        assert!(matches!(result, Err(QueueError::Relabel(_))));
    }

    #[tokio::test]
    async fn test_reshard_drains_old_set_before_new() {
        ferry_log::init_test();

        let config = QueueConfig {
            max_samples_per_send: 10,
            min_shards: 1,
            max_shards: 1,
            ..Default::default()
        };
        let sink: Arc<RecordingSink> = Arc::new(RecordingSink::new());

        fn sample(value: f64) -> Sample {
            Sample::new(LabelSet::from_pairs([("__name__", "m")]), 0, value)
        }

        // The replacement protocol: the new set buffers while the old one
        // drains, and only starts flushing afterwards.
        let old = Shards::new(1, 10);
        let new = Shards::new(2, 10);

        old.start(sink.clone(), &config);
        assert!(old.enqueue(sample(1.0)));
        assert!(new.enqueue(sample(2.0)));

        old.stop().await;
        assert_eq!(sink.samples().len(), 1);

        new.start(sink.clone(), &config);
        new.stop().await;

        let values: Vec<f64> = sink.samples().iter().map(|sample| sample.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoscaler_grows_under_pressure() {
        ferry_log::init_test();

        let config = QueueConfig {
            capacity: 4,
            max_samples_per_send: 2,
            batch_send_deadline: 1_000,
            min_shards: 1,
            max_shards: 2,
            ..Default::default()
        };
        let sink = Arc::new(SlowSink::new(Duration::from_secs(60)));
        let manager = QueueManager::new(config, sink.clone()).unwrap();

        manager.start().unwrap();
        for i in 0..4 {
            manager.append(family(&format!("test_metric_{i}"), i as f64));
        }

        // Let the worker pull one batch and park inside the slow store,
        // then fill the buffer back up so pressure is visible at the next
        // autoscaler tick.
        tokio::time::sleep(Duration::from_millis(10)).await;
        for i in 4..6 {
            manager.append(family(&format!("test_metric_{i}"), i as f64));
        }

        for _ in 0..100 {
            if manager.shard_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(manager.shard_count(), 2);

        // Stopping waits out the in-flight reshard, which in turn drains
        // the old set; nothing accepted so far may be lost.
        manager.stop().await;
        assert_eq!(sink.stored(), 6);
    }

    #[test]
    fn test_desired_shards_policy() {
        let config = QueueConfig {
            capacity: 100,
            min_shards: 1,
            max_shards: 8,
            ..Default::default()
        };

        // More than half full: double.
        assert_eq!(desired_shards(60, 1, &config), 2);
        assert_eq!(desired_shards(150, 2, &config), 4);
        // Nearly empty: halve, clamped to the minimum.
        assert_eq!(desired_shards(0, 4, &config), 2);
        assert_eq!(desired_shards(0, 1, &config), 1);
        // In between: keep.
        assert_eq!(desired_shards(30, 1, &config), 1);
        // Clamped to the maximum.
        assert_eq!(desired_shards(1_000, 8, &config), 8);
    }
}
