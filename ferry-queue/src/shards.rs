use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use ferry_model::Sample;
use ferry_statsd::metric;

use crate::config::QueueConfig;
use crate::sink::Sink;
use crate::statsd::{QueueCounters, QueueTimers};

/// A fixed-width set of bounded shard buffers and their workers.
///
/// The set is created unstarted: its buffers accept samples immediately, but
/// nothing is flushed until [`Shards::start`] spawns the workers. The queue
/// manager relies on this split to replace one set with another without
/// reordering series, see the resize protocol in the manager.
pub(crate) struct Shards {
    queues: Vec<mpsc::Sender<Sample>>,
    receivers: Mutex<Option<Vec<mpsc::Receiver<Sample>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    close_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Shards {
    /// Creates an unstarted set of `shards` buffers of `capacity` samples.
    pub(crate) fn new(shards: usize, capacity: usize) -> Self {
        let mut queues = Vec::with_capacity(shards);
        let mut receivers = Vec::with_capacity(shards);
        for _ in 0..shards {
            let (tx, rx) = mpsc::channel(capacity);
            queues.push(tx);
            receivers.push(rx);
        }
        let (close_tx, _) = watch::channel(false);

        Self {
            queues,
            receivers: Mutex::new(Some(receivers)),
            handles: Mutex::new(Vec::new()),
            close_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the number of shards.
    pub(crate) fn len(&self) -> usize {
        self.queues.len()
    }

    /// Routes a sample to its shard buffer.
    ///
    /// Returns `false` when the sample was dropped because the target buffer
    /// is full or the set is closed. Never blocks.
    pub(crate) fn enqueue(&self, sample: Sample) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }

        let shard = (sample.labels.hash64() % self.queues.len() as u64) as usize;
        self.queues[shard].try_send(sample).is_ok()
    }

    /// Returns the total number of samples buffered across all shards.
    pub(crate) fn queue_len(&self) -> usize {
        self.queues
            .iter()
            .map(|queue| queue.max_capacity() - queue.capacity())
            .sum()
    }

    /// Spawns one worker per shard. A second call is a no-op.
    pub(crate) fn start(&self, sink: Arc<dyn Sink>, config: &QueueConfig) {
        let Some(receivers) = self.receivers.lock().take() else {
            return;
        };

        let mut handles = self.handles.lock();
        for (index, rx) in receivers.into_iter().enumerate() {
            let worker = ShardWorker {
                index,
                sink: Arc::clone(&sink),
                max_samples_per_send: config.max_samples_per_send,
                batch_send_deadline: config.batch_send_deadline(),
                close_rx: self.close_tx.subscribe(),
            };
            handles.push(tokio::spawn(worker.run(rx)));
        }
    }

    /// Closes all buffers and waits for the workers to drain and exit.
    ///
    /// Samples enqueued after the close are dropped. Workers finish their
    /// in-flight store call, drain their buffer and flush the residual batch
    /// before exiting; no deadline is imposed here.
    pub(crate) async fn stop(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let _ = self.close_tx.send(true);

        let handles = mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// One queue worker, owning the receiving end of a shard buffer.
struct ShardWorker {
    index: usize,
    sink: Arc<dyn Sink>,
    max_samples_per_send: usize,
    batch_send_deadline: Duration,
    close_rx: watch::Receiver<bool>,
}

impl ShardWorker {
    /// Runs the worker until its shard set closes.
    ///
    /// The loop waits for a sample, the batch deadline, or the close signal.
    /// The deadline is armed when the first sample of a batch arrives, so a
    /// trickle of samples is flushed at most `batch_send_deadline` after the
    /// batch opened. Awaiting the store call inside the loop is what bounds
    /// the shard to a single in-flight batch.
    async fn run(self, mut rx: mpsc::Receiver<Sample>) {
        let Self {
            index,
            sink,
            max_samples_per_send,
            batch_send_deadline,
            mut close_rx,
        } = self;

        let mut batch: Vec<Sample> = Vec::with_capacity(max_samples_per_send);
        let deadline = sleep_until(Instant::now());
        tokio::pin!(deadline);

        // The set may have been closed before this worker was spawned.
        let mut open = !*close_rx.borrow_and_update();

        while open {
            tokio::select! {
                biased;

                _ = close_rx.changed() => open = false,

                _ = deadline.as_mut(), if !batch.is_empty() => {
                    flush(&*sink, index, &mut batch).await;
                }

                sample = rx.recv() => match sample {
                    Some(sample) => {
                        if batch.is_empty() {
                            deadline.as_mut().reset(Instant::now() + batch_send_deadline);
                        }
                        batch.push(sample);
                        if batch.len() >= max_samples_per_send {
                            flush(&*sink, index, &mut batch).await;
                        }
                    }
                    None => open = false,
                },
            }
        }

        // Drain what made it into the buffer before the close, then flush
        // the residual batch.
        while let Ok(sample) = rx.try_recv() {
            batch.push(sample);
            if batch.len() >= max_samples_per_send {
                flush(&*sink, index, &mut batch).await;
            }
        }
        flush(&*sink, index, &mut batch).await;
    }
}

/// Sends the pending batch through the sink and resets it.
///
/// Failed batches are logged and discarded; the queue never retries.
async fn flush(sink: &dyn Sink, shard: usize, batch: &mut Vec<Sample>) {
    if batch.is_empty() {
        return;
    }

    let samples = mem::take(batch);
    let count = samples.len();

    let result = metric!(timer(QueueTimers::StoreDuration), sink = sink.name(), shard = shard, {
        sink.store(samples).await
    });

    match result {
        Ok(()) => {
            metric!(counter(QueueCounters::BatchesSent) += 1, sink = sink.name());
        }
        Err(error) => {
            ferry_log::error!(
                sink = sink.name(),
                shard,
                error = %error,
                "dropping batch of {count} samples after store failure"
            );
            metric!(counter(QueueCounters::BatchErrors) += 1, sink = sink.name());
        }
    }
}
