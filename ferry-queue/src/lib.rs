//! Sharded fan-out queue for the ferry write path.
//!
//! The [`QueueManager`] accepts metric families from the scraper, applies the
//! configured relabel rules, and partitions the resulting samples by label
//! set hash onto a fixed set of shards. Each shard owns a bounded buffer and
//! one worker that coalesces samples into batches, bounded by size and by
//! wall time, and forwards each batch through the [`Sink`].
//!
//! Three properties shape the design:
//!
//! - **Per-series ordering**: a series always hashes to the same shard, and a
//!   shard flushes in enqueue order, so samples of one series reach the sink
//!   in submission order. Shard-set resizes drain the old set completely
//!   before the new one starts flushing, which extends the guarantee across
//!   resizes.
//! - **Bounded sink concurrency**: a worker awaits its in-flight store call
//!   before reading more samples, so at most one batch per shard is in
//!   flight at any instant.
//! - **Drop, never block**: producers run on the scrape hot path. When a
//!   shard buffer is full the sample is dropped and counted; `append` never
//!   waits on the backend.

#![warn(missing_docs)]

mod config;
mod manager;
mod shards;
mod sink;
mod statsd;

pub use self::config::QueueConfig;
pub use self::manager::{QueueError, QueueManager};
pub use self::sink::{Sink, StoreError};
