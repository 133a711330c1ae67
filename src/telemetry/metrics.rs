//! Metric instrument factories for snappea.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"snappea"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for snappea instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("snappea")
}

/// Counter: enqueue calls.
/// Labels: `task_type`, `result` ("ok" | "duplicate" | "rejected" | "error").
pub fn task_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("snappea.task.enqueued")
        .with_description("Number of enqueue calls")
        .build()
}

/// Counter: task status transitions written by the runner.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("snappea.task.state_transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: tasks leased by claim-next.
pub fn task_claimed() -> Counter<u64> {
    meter()
        .u64_counter("snappea.task.claimed")
        .with_description("Number of tasks leased by claim-next")
        .build()
}

/// Counter: polling cycles that failed to reach the store.
pub fn runner_cycle_errors() -> Counter<u64> {
    meter()
        .u64_counter("snappea.runner.cycle_errors")
        .with_description("Claim cycles that failed against the store")
        .build()
}

/// Counter: claimed tasks whose type has no registered handler.
/// Labels: `task_type`.
pub fn task_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("snappea.task.unroutable")
        .with_description("Claimed tasks with no registered handler")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `task_type`, `outcome`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("snappea.task.duration_ms")
        .with_description("Handler execution time in milliseconds")
        .with_unit("ms")
        .build()
}
