use std::time::Duration;

use serde::{Deserialize, Serialize};

use ferry_relabel::RelabelConfig;

use crate::manager::QueueError;

/// Parameters used by the [`QueueManager`](crate::QueueManager).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Per-shard buffer size in samples.
    ///
    /// Once a shard's buffer is full, further samples routed to it are
    /// dropped until the worker catches up. Defaults to `10_000`.
    pub capacity: usize,

    /// The maximum number of samples per batch.
    ///
    /// A worker flushes as soon as its pending batch reaches this size.
    /// Defaults to `200`.
    pub max_samples_per_send: usize,

    /// The maximum wall time in milliseconds a non-empty batch may remain
    /// open before it is flushed regardless of its size.
    ///
    /// Defaults to `5_000`.
    pub batch_send_deadline: u64,

    /// The lower bound on the shard count; also the initial shard count.
    ///
    /// Defaults to `1`.
    pub min_shards: usize,

    /// The upper bound on the shard count.
    ///
    /// When equal to `min_shards`, the shard count is fixed and no
    /// autoscaler runs. Defaults to `200`.
    pub max_shards: usize,

    /// Relabel rules applied to every sample before it enters the queue.
    ///
    /// Defaults to no rules.
    pub relabel_configs: Vec<RelabelConfig>,
}

impl QueueConfig {
    /// Returns the batch deadline as a [`Duration`].
    pub fn batch_send_deadline(&self) -> Duration {
        Duration::from_millis(self.batch_send_deadline)
    }

    /// Checks the configuration invariants.
    pub(crate) fn validate(&self) -> Result<(), QueueError> {
        if self.capacity == 0 {
            return Err(QueueError::InvalidCapacity);
        }
        if self.max_samples_per_send == 0 {
            return Err(QueueError::InvalidBatchSize);
        }
        if self.batch_send_deadline == 0 {
            return Err(QueueError::InvalidDeadline);
        }
        if self.min_shards == 0 || self.min_shards > self.max_shards {
            return Err(QueueError::InvalidShardBounds {
                min: self.min_shards,
                max: self.max_shards,
            });
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_samples_per_send: 200,
            batch_send_deadline: 5_000,
            min_shards: 1,
            max_shards: 200,
            relabel_configs: Vec::new(),
        }
    }
}
