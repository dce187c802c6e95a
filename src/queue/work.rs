//! Handle for one checked-out job.

use super::codec::QueueKeys;
use crate::error::Result;
use crate::store::{Batch, KeyValueStore};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, instrument};

/// An in-progress job returned by [`super::JobQueue::get`].
///
/// Exactly one of [`complete`](Self::complete) or
/// [`resubmit`](Self::resubmit) must be called. A handle that is dropped
/// without either leaves the job in the processing list until the next
/// [`super::JobQueue::cleanup`]. Both calls remove-if-present, so retrying
/// one after a transient store error is safe.
#[must_use = "call complete() or resubmit() once the job has been handled"]
pub struct WorkHandle<S> {
    store: Arc<S>,
    queue: String,
    keys: QueueKeys,
    key: Vec<u8>,
}

impl<S: KeyValueStore> WorkHandle<S> {
    pub(crate) fn new(store: Arc<S>, queue: &str, keys: QueueKeys, key: Vec<u8>) -> Self {
        Self {
            store,
            queue: queue.to_string(),
            keys,
            key,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Dedup key of the checked-out job.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Finish the job: drop it from processing and from the dedup index.
    #[instrument(skip(self), fields(work = %self))]
    pub async fn complete(&self) -> Result<()> {
        self.store
            .exec(
                Batch::new()
                    .lrem(&self.keys.processing, &self.key)
                    .hdel(&self.keys.index, &self.key),
            )
            .await?;
        record(&self.queue, "complete");
        debug!("job completed");
        Ok(())
    }

    /// Return the job to the waiting list for another attempt.
    ///
    /// The dedup entry stays, so the job still counts as queued and a
    /// concurrent submit of the same job is rejected.
    #[instrument(skip(self), fields(work = %self))]
    pub async fn resubmit(&self) -> Result<()> {
        self.store
            .exec(
                Batch::new()
                    .lrem(&self.keys.processing, &self.key)
                    .lpush(&self.keys.waiting, &self.key),
            )
            .await?;
        record(&self.queue, "resubmit");
        debug!("job resubmitted");
        Ok(())
    }
}

impl<S> std::fmt::Display for WorkHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.queue, String::from_utf8_lossy(&self.key))
    }
}

impl<S> std::fmt::Debug for WorkHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkHandle")
            .field("queue", &self.queue)
            .field("key", &String::from_utf8_lossy(&self.key))
            .finish()
    }
}

fn record(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}
