//! Metric instrument factories for workpool.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workpool"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for workpool instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workpool")
}

/// Counter: queue-level operations.
/// Labels: `operation` ("enqueue" | "dequeue" | "dequeue_exhausted").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workpool.queue.operations")
        .with_description("Number of work queue operations")
        .build()
}

/// Counter: items taken through lookup, work and commit.
/// Labels: `result` ("committed" | "failed" | "cancelled").
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("workpool.items.processed")
        .with_description("Number of work items processed")
        .build()
}

/// Counter: worker loop exits.
/// Labels: `policy`, `result` ("success" | "failure" | "cancelled").
pub fn worker_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("workpool.worker.outcomes")
        .with_description("Number of worker loop exits by result")
        .build()
}

/// Counter: completion signal false→true transitions.
pub fn signal_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workpool.signal.transitions")
        .with_description("Number of completion signal transitions")
        .build()
}

/// Histogram: episode duration in milliseconds.
/// Labels: `policy`, `result` ("success" | "failed" | "timed_out").
pub fn episode_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workpool.episode.duration_ms")
        .with_description("Coordination episode duration in milliseconds")
        .with_unit("ms")
        .build()
}
