//! Task execution span helpers.
//!
//! Provides span creation and state-transition recording for tasks
//! flowing through the runner.

use tracing::Span;

use crate::model::TaskId;

/// Start a span for one execution attempt of a task.
///
/// The `task.outcome` field is declared empty and filled in once the
/// attempt settles.
pub fn start_task_span(task_type: &str, task_id: TaskId, attempt: u32) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.type" = task_type,
        "task.id" = %task_id,
        "task.attempt" = attempt,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record a status transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.outcome", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
