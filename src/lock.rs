//! Lease-based distributed lock.
//!
//! A lock is a store key created with set-if-absent and a TTL. While the
//! lock is held a background task refreshes the TTL every quarter lease,
//! so a crashed holder loses the lock after at most one lease duration.
//!
//! This is an advisory lease lock, not a fenced one: if renewal fails the
//! holder is only told through [`DistributedLock::lost`] /
//! [`DistributedLock::renewal_error`]. Long critical sections should
//! select on `lost()` and abort when it resolves.
//!
//! A failed renewal returns the handle to idle before the error is
//! reported, so the caller can go straight back to [`DistributedLock::lock`]
//! and a later [`DistributedLock::unlock`] returns [`Error::NotHeld`].

use crate::error::{Error, Result};
use crate::store::KeyValueStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lease used when none is configured.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(2);

/// Smallest lease that still gives a non-zero renewal period.
const MIN_LEASE: Duration = Duration::from_millis(4);

/// Wait used by [`DistributedLock::lock`]: effectively forever.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(100_000 * 3600);

type HeldSlot = Arc<std::sync::Mutex<Option<Held>>>;

/// State kept while the lease is held.
struct Held {
    // Keeps other local callers out until release.
    _local: OwnedMutexGuard<()>,
    stop: oneshot::Sender<()>,
    renewal: JoinHandle<()>,
}

/// A named lease lock on a [`KeyValueStore`].
pub struct DistributedLock<S> {
    store: Arc<S>,
    key: String,
    lease: Duration,
    token: Vec<u8>,
    local: Arc<Mutex<()>>,
    held: HeldSlot,
    errors_tx: mpsc::Sender<Error>,
    errors_rx: Mutex<mpsc::Receiver<Error>>,
}

impl<S: KeyValueStore> DistributedLock<S> {
    /// Create an idle lock handle for `key` with the default lease.
    pub fn new(store: Arc<S>, key: impl Into<String>) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(1);
        Self {
            store,
            key: key.into(),
            lease: DEFAULT_LEASE,
            token: Uuid::new_v4().to_string().into_bytes(),
            local: Arc::new(Mutex::new(())),
            held: Arc::new(std::sync::Mutex::new(None)),
            errors_tx,
            errors_rx: Mutex::new(errors_rx),
        }
    }

    /// Override the lease duration.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease.max(MIN_LEASE);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Whether this handle currently believes it holds the lease.
    pub fn is_held(&self) -> bool {
        self.held_slot().is_some()
    }

    /// Block until the lock is acquired or the store fails.
    pub async fn lock(&self) -> Result<()> {
        self.lock_wait(UNBOUNDED_WAIT).await
    }

    /// Try to acquire the lock for up to `wait`.
    ///
    /// Returns [`Error::LockTimeout`] if the deadline passes while another
    /// holder owns the key. Store errors abort immediately.
    #[instrument(skip(self), fields(lock = %self.key))]
    pub async fn lock_wait(&self, wait: Duration) -> Result<()> {
        let local = Arc::clone(&self.local).lock_owned().await;
        let deadline = Instant::now().checked_add(wait);

        loop {
            match self.store.set_if_absent(&self.key, &self.token, self.lease).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    record_acquisition(&self.key, "error");
                    warn!(error = %e, "lock acquisition aborted by store error");
                    return Err(e);
                }
            }

            tokio::time::sleep(self.lease).await;
            if deadline.is_some_and(|d| Instant::now() > d) {
                record_acquisition(&self.key, "timeout");
                debug!(?wait, "lock acquisition timed out");
                return Err(Error::LockTimeout);
            }
        }

        self.drain_errors();

        {
            // The renewal task clears this slot on failure, so it must not
            // observe the slot before the hold is stored.
            let mut slot = self.held_slot();
            let (stop, stop_rx) = oneshot::channel();
            let renewal = tokio::spawn(renew(
                Arc::clone(&self.store),
                Renewal {
                    key: self.key.clone(),
                    token: self.token.clone(),
                    lease: self.lease,
                    held: Arc::clone(&self.held),
                    errors: self.errors_tx.clone(),
                },
                stop_rx,
            ));
            *slot = Some(Held {
                _local: local,
                stop,
                renewal,
            });
        }

        record_acquisition(&self.key, "acquired");
        info!("lock acquired");
        Ok(())
    }

    /// Stop renewing and release the local guard.
    ///
    /// The store key is left to expire on its own. Returns
    /// [`Error::NotHeld`] if the handle is idle, including after a renewal
    /// failure has already released it.
    #[instrument(skip(self), fields(lock = %self.key))]
    pub async fn unlock(&self) -> Result<()> {
        let held = self.held_slot().take().ok_or(Error::NotHeld)?;

        let _ = held.stop.send(());
        if let Err(e) = held.renewal.await {
            warn!(error = %e, "renewal task did not shut down cleanly");
        }

        info!("lock released");
        Ok(())
    }

    /// Wait until the renewal task reports that the lease was lost.
    pub async fn lost(&self) -> Error {
        let mut errors = self.errors_rx.lock().await;
        match errors.recv().await {
            Some(e) => e,
            // Unreachable while `self` holds the sender.
            None => Error::LeaseLost(format!("{}: renewal channel closed", self.key)),
        }
    }

    /// Non-blocking check for a renewal failure.
    pub fn renewal_error(&self) -> Option<Error> {
        self.errors_rx.try_lock().ok()?.try_recv().ok()
    }

    fn drain_errors(&self) {
        // Skipped while another caller is parked in `lost()`.
        let Ok(mut errors) = self.errors_rx.try_lock() else {
            return;
        };
        while let Ok(stale) = errors.try_recv() {
            debug!(error = %stale, "discarding renewal error from previous hold");
        }
    }

    fn held_slot(&self) -> std::sync::MutexGuard<'_, Option<Held>> {
        lock_slot(&self.held)
    }
}

impl<S> Drop for DistributedLock<S> {
    fn drop(&mut self) {
        if let Some(held) = lock_slot(&self.held).take() {
            held.renewal.abort();
        }
    }
}

fn lock_slot(held: &HeldSlot) -> std::sync::MutexGuard<'_, Option<Held>> {
    held.lock().unwrap_or_else(|e| e.into_inner())
}

/// What the renewal task needs besides the store.
struct Renewal {
    key: String,
    token: Vec<u8>,
    lease: Duration,
    held: HeldSlot,
    errors: mpsc::Sender<Error>,
}

/// Refresh the lease every quarter period until told to stop.
///
/// On failure the hold is taken out of the handle before the error is
/// reported, and the local guard is released after it.
async fn renew<S: KeyValueStore>(
    store: Arc<S>,
    renewal: Renewal,
    mut stop: oneshot::Receiver<()>,
) {
    let Renewal {
        key,
        token,
        lease,
        held,
        errors,
    } = renewal;
    let mut ticks = tokio::time::interval(lease / 4);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => return,
            _ = ticks.tick() => {}
        }

        let failure = match store.set_if_present(&key, &token, lease).await {
            Ok(true) => continue,
            Ok(false) => Error::LeaseLost(format!("{key}: lease expired before renewal")),
            Err(e) => e,
        };

        metrics::lock_renewal_failures().add(1, &[KeyValue::new("lock", key.clone())]);
        warn!(lock = %key, error = %failure, "lease renewal failed, lock lost");

        // Empty if `unlock` already took the hold and is joining this task.
        let released = lock_slot(&held).take();
        let _ = errors.try_send(failure);
        drop(released);
        return;
    }
}

fn record_acquisition(key: &str, result: &'static str) {
    metrics::lock_acquisitions().add(
        1,
        &[
            KeyValue::new("lock", key.to_string()),
            KeyValue::new("result", result),
        ],
    );
}
