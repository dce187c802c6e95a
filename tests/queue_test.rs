//! Integration tests for the job queue against the in-memory store.

use async_trait::async_trait;
use kvsync::store::{Batch, KeyValueStore};
use kvsync::{Error, Job, JobQueue, MemoryStore};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Crawl {
    url: String,
    depth: u32,
}

impl Job for Crawl {}

/// Deduplicated on url only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Fetch {
    url: String,
    attempt: u32,
}

impl Job for Fetch {
    fn dedup_key(&self) -> Option<Vec<u8>> {
        Some(self.url.as_bytes().to_vec())
    }
}

fn queue(store: &Arc<MemoryStore>) -> JobQueue<MemoryStore> {
    JobQueue::new(Arc::clone(store), "crawl")
}

fn crawl(url: &str) -> Crawl {
    Crawl {
        url: url.to_string(),
        depth: 1,
    }
}

// ---------------------------------------------------------------------------
// Lifecycle: submit → get → complete / resubmit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_get_complete_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);

    q.submit(&json!({"url": "a"})).await.unwrap();
    assert_eq!(q.len().await.unwrap(), 1);

    let (work, job) = q.get::<Value>().await.unwrap();
    assert_eq!(job, json!({"url": "a"}));
    assert_eq!(q.len().await.unwrap(), 1, "in-flight jobs stay indexed");

    work.complete().await.unwrap();
    assert_eq!(q.len().await.unwrap(), 0);
    assert!(q.is_empty().await.unwrap());
    assert_eq!(q.stats().await.unwrap(), Default::default());
}

#[tokio::test]
async fn get_round_trips_typed_jobs() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    let job = Crawl {
        url: "https://example.com/a".into(),
        depth: 3,
    };

    q.submit(&job).await.unwrap();
    let (work, got) = q.get::<Crawl>().await.unwrap();
    assert_eq!(got, job);
    assert_eq!(work.queue(), "crawl");
    assert_eq!(work.key(), serde_json::to_vec(&job).unwrap());
    work.complete().await.unwrap();
}

#[tokio::test]
async fn jobs_are_delivered_in_submission_order() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    for url in ["a", "b", "c"] {
        q.submit(&crawl(url)).await.unwrap();
    }

    for url in ["a", "b", "c"] {
        let (work, job) = q.get::<Crawl>().await.unwrap();
        assert_eq!(job.url, url);
        work.complete().await.unwrap();
    }
}

#[tokio::test]
async fn checked_out_job_is_only_in_processing() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    q.submit(&crawl("a")).await.unwrap();

    let (work, _) = q.get::<Crawl>().await.unwrap();
    assert!(store.list(&q.keys().waiting).is_empty());
    assert_eq!(store.list(&q.keys().processing), vec![work.key().to_vec()]);

    work.resubmit().await.unwrap();
    assert_eq!(store.list(&q.keys().waiting), vec![work.key().to_vec()]);
    assert!(store.list(&q.keys().processing).is_empty());
}

#[tokio::test]
async fn resubmitted_job_is_delivered_again_and_stays_queued() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    let job = crawl("retry-me");
    q.submit(&job).await.unwrap();

    let (work, _) = q.get::<Crawl>().await.unwrap();
    work.resubmit().await.unwrap();

    assert!(q.is_queued(&job).await.unwrap());
    assert!(matches!(q.submit(&job).await, Err(Error::AlreadyQueued)));
    assert_eq!(q.len().await.unwrap(), 1);

    let (again, got) = q.get::<Crawl>().await.unwrap();
    assert_eq!(got, job);
    again.complete().await.unwrap();
    assert!(!q.is_queued(&job).await.unwrap());
}

#[tokio::test]
async fn completed_job_can_be_submitted_again() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    let job = crawl("again");

    q.submit(&job).await.unwrap();
    let (work, _) = q.get::<Crawl>().await.unwrap();
    work.complete().await.unwrap();

    q.submit(&job).await.unwrap();
    assert_eq!(q.len().await.unwrap(), 1);
}

#[tokio::test]
async fn complete_is_safe_to_repeat() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    q.submit(&crawl("twice")).await.unwrap();

    let (work, _) = q.get::<Crawl>().await.unwrap();
    work.complete().await.unwrap();
    work.complete().await.unwrap();
    assert_eq!(q.stats().await.unwrap(), Default::default());
}

// ---------------------------------------------------------------------------
// Dedup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_submit_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    let job = crawl("dup");

    q.submit(&job).await.unwrap();
    let err = q.submit(&job).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyQueued), "got {err:?}");

    assert_eq!(q.len().await.unwrap(), 1);
    assert_eq!(store.list(&q.keys().waiting).len(), 1);
}

#[tokio::test]
async fn duplicate_of_in_flight_job_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    let job = crawl("busy");
    q.submit(&job).await.unwrap();
    let (work, _) = q.get::<Crawl>().await.unwrap();

    assert!(q.is_queued(&job).await.unwrap());
    assert!(matches!(q.submit(&job).await, Err(Error::AlreadyQueued)));

    work.complete().await.unwrap();
}

#[tokio::test]
async fn custom_dedup_key_ignores_other_fields() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    let first = Fetch {
        url: "https://example.com".into(),
        attempt: 1,
    };
    let second = Fetch {
        url: "https://example.com".into(),
        attempt: 2,
    };

    q.submit(&first).await.unwrap();
    assert!(q.is_queued(&second).await.unwrap());
    assert!(matches!(q.submit(&second).await, Err(Error::AlreadyQueued)));

    let (work, got) = q.get::<Fetch>().await.unwrap();
    assert_eq!(got, first);
    assert_eq!(work.key(), b"https://example.com");
    assert_eq!(work.to_string(), "crawl:https://example.com");
    work.complete().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_submits_queue_exactly_one_copy() {
    let store = Arc::new(MemoryStore::new());
    let q = Arc::new(queue(&store));

    let submits: Vec<_> = (0..16)
        .map(|_| {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.submit(&crawl("contended")).await })
        })
        .collect();

    let mut accepted = 0;
    for submit in submits {
        match submit.await.unwrap() {
            Ok(()) => accepted += 1,
            Err(Error::AlreadyQueued) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(q.len().await.unwrap(), 1);
    assert_eq!(store.list(&q.keys().waiting).len(), 1);
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cleanup_recovers_abandoned_jobs() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    q.submit(&crawl("a")).await.unwrap();
    q.submit(&crawl("b")).await.unwrap();

    // Consumer checks out both jobs and dies without finishing them.
    let (first, _) = q.get::<Crawl>().await.unwrap();
    let (second, _) = q.get::<Crawl>().await.unwrap();
    drop((first, second));
    assert!(q.try_get::<Crawl>().await.unwrap().is_none());

    let restarted = queue(&store);
    assert_eq!(restarted.cleanup().await.unwrap(), 2);
    assert_eq!(restarted.cleanup().await.unwrap(), 0);

    let stats = restarted.stats().await.unwrap();
    assert_eq!(stats.waiting, 2);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.indexed, 2);

    let (work, job) = restarted.get::<Crawl>().await.unwrap();
    assert_eq!(job.url, "a");
    work.complete().await.unwrap();
}

#[tokio::test]
async fn undecodable_job_is_put_back_and_error_returned() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    q.submit(&json!({"unexpected": true})).await.unwrap();

    let err = q.get::<Crawl>().await.unwrap_err();
    assert!(matches!(err, Error::Payload(_)), "got {err:?}");

    let stats = q.stats().await.unwrap();
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.indexed, 1);

    let (work, job) = q.get::<Value>().await.unwrap();
    assert_eq!(job, json!({"unexpected": true}));
    work.complete().await.unwrap();
}

#[tokio::test]
async fn orphaned_key_without_payload_is_dropped() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    store
        .exec(Batch::new().lpush(&q.keys().waiting, b"ghost"))
        .await
        .unwrap();

    assert!(q.try_get::<Value>().await.unwrap().is_none());
    assert!(store.list(&q.keys().processing).is_empty());
}

/// Memory store whose batches and payload reads can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_exec: AtomicBool,
    /// Fail the next `hget` only.
    fail_next_hget: AtomicBool,
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> kvsync::Result<bool> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn set_if_present(&self, key: &str, value: &[u8], ttl: Duration) -> kvsync::Result<bool> {
        self.inner.set_if_present(key, value, ttl).await
    }

    async fn pop_push_blocking(&self, src: &str, dst: &str) -> kvsync::Result<Vec<u8>> {
        self.inner.pop_push_blocking(src, dst).await
    }

    async fn pop_push(&self, src: &str, dst: &str) -> kvsync::Result<Option<Vec<u8>>> {
        self.inner.pop_push(src, dst).await
    }

    async fn llen(&self, list: &str) -> kvsync::Result<usize> {
        self.inner.llen(list).await
    }

    async fn hget(&self, hash: &str, field: &[u8]) -> kvsync::Result<Option<Vec<u8>>> {
        if self.fail_next_hget.swap(false, Ordering::SeqCst) {
            return Err(Error::Store("transient".to_string()));
        }
        self.inner.hget(hash, field).await
    }

    async fn hexists(&self, hash: &str, field: &[u8]) -> kvsync::Result<bool> {
        self.inner.hexists(hash, field).await
    }

    async fn hlen(&self, hash: &str) -> kvsync::Result<usize> {
        self.inner.hlen(hash).await
    }

    async fn exec(&self, batch: Batch) -> kvsync::Result<bool> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(Error::Store("exec disabled".to_string()));
        }
        self.inner.exec(batch).await
    }
}

#[tokio::test]
async fn failed_compensating_resubmit_is_unrecoverable() {
    let store = Arc::new(FlakyStore::default());
    let q = JobQueue::new(Arc::clone(&store), "crawl");
    q.submit(&json!({"not": "a crawl"})).await.unwrap();

    store.fail_exec.store(true, Ordering::SeqCst);
    let err = q.get::<Crawl>().await.unwrap_err();
    assert!(matches!(err, Error::Unrecoverable { .. }), "got {err:?}");
}

#[tokio::test]
async fn payload_read_failure_puts_job_back() {
    let store = Arc::new(FlakyStore::default());
    let q = JobQueue::new(Arc::clone(&store), "crawl");
    q.submit(&crawl("retry-me")).await.unwrap();

    store.fail_next_hget.store(true, Ordering::SeqCst);
    let err = q.get::<Crawl>().await.unwrap_err();
    assert!(err.is_store(), "got {err:?}");

    let stats = q.stats().await.unwrap();
    assert_eq!((stats.waiting, stats.processing, stats.indexed), (1, 0, 1));
    assert!(matches!(
        q.submit(&crawl("retry-me")).await,
        Err(Error::AlreadyQueued)
    ));

    let (work, job) = q.try_get::<Crawl>().await.unwrap().expect("job redelivered");
    assert_eq!(job, crawl("retry-me"));
    work.complete().await.unwrap();
    assert!(q.is_empty().await.unwrap());
}

#[tokio::test]
async fn payload_read_failure_with_failed_resubmit_is_unrecoverable() {
    let store = Arc::new(FlakyStore::default());
    let q = JobQueue::new(Arc::clone(&store), "crawl");
    q.submit(&crawl("doomed")).await.unwrap();

    store.fail_next_hget.store(true, Ordering::SeqCst);
    store.fail_exec.store(true, Ordering::SeqCst);
    let err = q.get::<Crawl>().await.unwrap_err();
    assert!(matches!(err, Error::Unrecoverable { .. }), "got {err:?}");
}

// ---------------------------------------------------------------------------
// Blocking behaviour
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_waits_for_a_submission() {
    let store = Arc::new(MemoryStore::new());
    let consumer = {
        let q = queue(&store);
        tokio::spawn(async move {
            let (work, job) = q.get::<Crawl>().await?;
            work.complete().await?;
            Ok::<_, Error>(job)
        })
    };

    tokio::task::yield_now().await;
    assert!(!consumer.is_finished());

    queue(&store).submit(&crawl("late")).await.unwrap();
    let job = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer should wake")
        .unwrap()
        .unwrap();
    assert_eq!(job.url, "late");
    assert_eq!(queue(&store).len().await.unwrap(), 0);
}

#[tokio::test]
async fn empty_queue_reports_zero() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    assert_eq!(q.len().await.unwrap(), 0);
    assert!(!q.is_queued(&crawl("nothing")).await.unwrap());
    assert_eq!(q.cleanup().await.unwrap(), 0);
    assert!(q.try_get::<Crawl>().await.unwrap().is_none());
}
