//! Job span helpers.
//!
//! Provides span creation and state-transition recording for jobs moving
//! between the waiting and processing lists.

use tracing::Span;

/// Start a span for a dequeued job.
///
/// The `job.state` field is declared empty and can be filled in by the
/// consumer once it knows how the job ended.
pub fn start_job_span(queue: &str, job: &str) -> Span {
    tracing::info_span!(
        "queue.job",
        "queue.name" = queue,
        "job.key" = job,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_job_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
