//! Integration tests for telemetry initialization and span helpers.

use snappea::model::TaskId;
use snappea::telemetry::{TelemetryConfig, init_telemetry, metrics, task};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Only one global subscriber per process; the only init in this binary.
    let guard = init_telemetry(TelemetryConfig::new("snappea-test")).unwrap();
    assert!(!guard.is_exporting());

    let again = init_telemetry(TelemetryConfig::new("snappea-test"));
    assert!(matches!(again, Err(snappea::error::Error::Other(_))));
}

#[test]
fn task_span_creates_and_records_transition() {
    let span = task::start_task_span("send_digest", TaskId(7), 1);
    task::record_state_transition(&span, "in_progress", "done");
}

#[test]
fn metric_instruments_build_without_a_provider() {
    metrics::task_enqueued().add(1, &[]);
    metrics::task_claimed().add(2, &[]);
    metrics::runner_cycle_errors().add(1, &[]);
    metrics::task_duration_ms().record(12.5, &[]);
}
