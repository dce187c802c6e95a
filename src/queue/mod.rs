//! Reliable job queue with duplicate suppression.
//!
//! Each queue lives in three store structures:
//!
//! - `<name>`: waiting list of dedup keys (push head, pop tail)
//! - `<name>:processing`: keys currently checked out by a consumer
//! - `<name>:payload`: dedup index, dedup key -> encoded payload
//!
//! A job's key is in at most one of the two lists at any time, and every
//! transition between them is a single atomic store operation. Delivery is
//! at-least-once: a consumer that dies holding a job gets it redelivered
//! after [`JobQueue::cleanup`].

pub mod codec;
pub mod work;

pub use codec::{Codec, Job, JsonCodec, QueueKeys};
pub use work::WorkHandle;

use crate::error::{Error, Result};
use crate::store::{Batch, KeyValueStore};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_job_transition, start_job_span};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, error, info, instrument, warn};

/// Point-in-time sizes of a queue's structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub waiting: usize,
    pub processing: usize,
    /// Outstanding jobs, waiting or in flight.
    pub indexed: usize,
}

/// A named job queue on a [`KeyValueStore`].
pub struct JobQueue<S, C = JsonCodec> {
    store: Arc<S>,
    name: String,
    keys: QueueKeys,
    codec: C,
}

impl<S: KeyValueStore> JobQueue<S> {
    /// Create a queue handle using JSON payloads.
    pub fn new(store: Arc<S>, name: impl Into<String>) -> Self {
        Self::with_codec(store, name, JsonCodec)
    }
}

impl<S: KeyValueStore, C: Codec> JobQueue<S, C> {
    /// Create a queue handle with a custom payload codec.
    pub fn with_codec(store: Arc<S>, name: impl Into<String>, codec: C) -> Self {
        let name = name.into();
        Self {
            keys: QueueKeys::new(&name),
            store,
            name,
            codec,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Return every in-progress job to the waiting list.
    ///
    /// Call once at consumer startup, before the first [`get`](Self::get),
    /// to recover jobs abandoned by a crashed process. It moves jobs that
    /// live consumers are still working on too, so it must not run while
    /// other consumers of this queue are active.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn cleanup(&self) -> Result<usize> {
        info!("returning in-progress jobs to the queue");
        let mut moved = 0;
        while let Some(key) = self
            .store
            .pop_push(&self.keys.processing, &self.keys.waiting)
            .await?
        {
            info!(key = %String::from_utf8_lossy(&key), "moved job from processing to waiting");
            moved += 1;
        }
        self.record("cleanup");
        Ok(moved)
    }

    /// Number of outstanding jobs (waiting or in flight).
    pub async fn len(&self) -> Result<usize> {
        self.store.hlen(&self.keys.index).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            waiting: self.store.llen(&self.keys.waiting).await?,
            processing: self.store.llen(&self.keys.processing).await?,
            indexed: self.len().await?,
        })
    }

    /// Whether a job with the same dedup key is waiting or in flight.
    pub async fn is_queued<J: Job>(&self, job: &J) -> Result<bool> {
        let (key, _) = codec::marshal(&self.codec, job)?;
        self.store.hexists(&self.keys.index, &key).await
    }

    /// Queue a job.
    ///
    /// Fails with [`Error::AlreadyQueued`] if a job with the same dedup key
    /// is already waiting or in flight. The membership check and the
    /// insert are one guarded batch, so two racing submits cannot both
    /// succeed.
    #[instrument(skip(self, job), fields(queue = %self.name))]
    pub async fn submit<J: Job>(&self, job: &J) -> Result<()> {
        let (key, payload) = codec::marshal(&self.codec, job)?;
        let applied = self
            .store
            .exec(
                Batch::new()
                    .unless_field_exists(&self.keys.index, &key)
                    .hset(&self.keys.index, &key, &payload)
                    .lpush(&self.keys.waiting, &key),
            )
            .await;

        let result = match &applied {
            Ok(true) => "ok",
            Ok(false) => "duplicate",
            Err(_) => "error",
        };
        metrics::jobs_submitted().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("result", result),
            ],
        );

        if applied? {
            self.record("submit");
            Ok(())
        } else {
            Err(Error::AlreadyQueued)
        }
    }

    /// Wait for the next job and check it out.
    ///
    /// There is no timeout; race this against a cancellation signal if a
    /// bounded wait is needed. If the payload cannot be loaded or decoded
    /// the job is put back on the waiting list before the error is
    /// returned, so the caller must not resubmit it.
    pub async fn get<J: Job>(&self) -> Result<(WorkHandle<S>, J)> {
        loop {
            let key = self
                .store
                .pop_push_blocking(&self.keys.waiting, &self.keys.processing)
                .await?;
            if let Some(checked_out) = self.check_out(key).await? {
                return Ok(checked_out);
            }
        }
    }

    /// Non-blocking [`get`](Self::get): `None` when nothing is waiting.
    pub async fn try_get<J: Job>(&self) -> Result<Option<(WorkHandle<S>, J)>> {
        while let Some(key) = self
            .store
            .pop_push(&self.keys.waiting, &self.keys.processing)
            .await?
        {
            if let Some(checked_out) = self.check_out(key).await? {
                return Ok(Some(checked_out));
            }
        }
        Ok(None)
    }

    /// Load and decode a key that was just moved to processing.
    ///
    /// Returns `None` for an orphaned key whose payload is gone. Any other
    /// failure puts the job back on the waiting list before returning.
    async fn check_out<J: Job>(&self, key: Vec<u8>) -> Result<Option<(WorkHandle<S>, J)>> {
        let handle = WorkHandle::new(Arc::clone(&self.store), &self.name, self.keys.clone(), key);
        let span = start_job_span(&self.name, &handle.to_string());
        let started = Instant::now();

        async {
            self.record("get");
            let payload = match self.store.hget(&self.keys.index, handle.key()).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    warn!("dequeued job has no payload, dropping orphaned key");
                    self.store
                        .exec(Batch::new().lrem(&self.keys.processing, handle.key()))
                        .await?;
                    record_job_transition(&span, "waiting", "absent");
                    return Ok(None);
                }
                Err(load_err) => {
                    warn!(error = %load_err, "could not load job payload, resubmitting");
                    return Err(self.put_back(&handle, &span, load_err).await);
                }
            };

            match self.codec.decode::<J>(&payload) {
                Ok(job) => {
                    record_job_transition(&span, "waiting", "processing");
                    metrics::operation_duration_ms().record(
                        started.elapsed().as_secs_f64() * 1000.0,
                        &[KeyValue::new("operation", "queue.get")],
                    );
                    Ok(Some((handle, job)))
                }
                Err(decode_err) => {
                    warn!(error = %decode_err, "could not decode job, resubmitting");
                    Err(self.put_back(&handle, &span, decode_err).await)
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Return a job that could not be handed out to the waiting list.
    ///
    /// Yields `cause` once the job is back, or [`Error::Unrecoverable`] if
    /// the resubmit itself failed.
    async fn put_back(&self, handle: &WorkHandle<S>, span: &tracing::Span, cause: Error) -> Error {
        if let Err(resubmit_err) = handle.resubmit().await {
            error!(
                error = %resubmit_err,
                cause = %cause,
                "could not resubmit job after failed checkout; it may be lost"
            );
            return Error::Unrecoverable {
                job: handle.to_string(),
                reason: resubmit_err.to_string(),
            };
        }
        record_job_transition(span, "processing", "waiting");
        cause
    }

    fn record(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}
