//! Metric instrument factories for kvsync.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"kvsync"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for kvsync instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("kvsync")
}

/// Counter: queue-level operations (submit, get, complete, resubmit, cleanup).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("kvsync.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: jobs submitted.
/// Labels: `queue`, `result` ("ok" | "duplicate" | "error").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("kvsync.jobs.submitted")
        .with_description("Number of jobs submitted")
        .build()
}

/// Counter: lock acquisition attempts by outcome.
/// Labels: `lock`, `result` ("acquired" | "timeout" | "error").
pub fn lock_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("kvsync.lock.acquisitions")
        .with_description("Number of lock acquisition attempts")
        .build()
}

/// Counter: lease renewals that failed, losing the lock.
/// Labels: `lock`.
pub fn lock_renewal_failures() -> Counter<u64> {
    meter()
        .u64_counter("kvsync.lock.renewal_failures")
        .with_description("Number of failed lease renewals")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("kvsync.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
