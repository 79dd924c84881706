use std::error::Error;

use async_trait::async_trait;
use thiserror::Error;

use ferry_model::Sample;

/// Error returned by a sink that failed to store a batch.
///
/// The queue logs and counts these errors; it never inspects them and never
/// retries the batch.
#[derive(Debug, Error)]
#[error("failed to store batch")]
pub struct StoreError(#[source] Box<dyn Error + Send + Sync>);

impl StoreError {
    /// Wraps a sink-specific error.
    pub fn new(source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self(source.into())
    }
}

/// The backend client receiving batches from the queue.
///
/// Implementations own their wire format, authentication and retry policy.
/// The queue treats the sink as opaque: it awaits [`Sink::store`] for each
/// batch, holds back further batches for the same shard until the call
/// returns, and discards the batch either way.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Delivers one batch of samples.
    ///
    /// May suspend arbitrarily long; the queue imposes no deadline. The
    /// samples of the batch belong to the same shard and are ordered by
    /// enqueue time.
    async fn store(&self, batch: Vec<Sample>) -> Result<(), StoreError>;

    /// Diagnostic identifier used in logs and metrics.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_preserves_source() {
        let error = StoreError::new("backend unavailable");
        assert!(error.source().is_some());
        assert_eq!(error.to_string(), "failed to store batch");
        assert_eq!(
            error.source().unwrap().to_string(),
            "backend unavailable"
        );
    }
}
