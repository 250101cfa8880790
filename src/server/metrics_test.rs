//! Tests for controller metrics

use super::metrics::{create_metrics, ControllerMetrics};

#[test]
fn test_metrics_creation() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    // Record some values so metrics appear in output
    // (Prometheus only outputs metrics with values)
    metrics.record_apply_success(0.1);
    metrics.record_event("create");
    metrics.record_fault("malformed_resource");
    metrics.set_owned_resources(2);

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("classgate_reconciliations_total"));
    assert!(output.contains("classgate_apply_duration_seconds"));
    assert!(output.contains("classgate_owned_resources 2"));
    assert!(output.contains("classgate_events_total"));
    assert!(output.contains("classgate_faults_total"));
}

#[test]
fn test_record_reconciliation_results() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_apply_success(0.5);
    metrics.record_apply_success(1.2);
    metrics.record_apply_failure(2.0);
    metrics.record_unchanged();

    let output = metrics.encode().expect("should encode metrics");

    assert!(output.contains("classgate_reconciliations_total{result=\"applied\"} 2"));
    assert!(output.contains("classgate_reconciliations_total{result=\"failed\"} 1"));
    assert!(output.contains("classgate_reconciliations_total{result=\"unchanged\"} 1"));
    // Failed attempts are timed too
    assert!(output.contains("classgate_apply_duration_seconds_count 3"));
}

#[test]
fn test_events_and_faults_by_kind() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_event("update");
    metrics.record_event("update");
    metrics.record_event("resync");
    metrics.record_fault("apply_exhausted");

    let output = metrics.encode().expect("should encode metrics");

    assert!(output.contains("classgate_events_total{kind=\"update\"} 2"));
    assert!(output.contains("classgate_events_total{kind=\"resync\"} 1"));
    assert!(output.contains("classgate_faults_total{kind=\"apply_exhausted\"} 1"));
}

#[test]
fn test_owned_resources_gauge_follows_latest_value() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.set_owned_resources(5);
    metrics.set_owned_resources(1);

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("classgate_owned_resources 1"));
}

#[test]
fn test_create_shared_metrics() {
    let metrics = create_metrics().expect("should create shared metrics");

    // Verify Arc sharing works
    let metrics2 = metrics.clone();
    metrics.record_apply_success(0.1);

    let output = metrics2.encode().expect("should encode from clone");
    assert!(output.contains("classgate_reconciliations_total{result=\"applied\"} 1"));
}

#[test]
fn test_histogram_buckets() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_apply_success(0.005); // < 0.01
    metrics.record_apply_success(0.03); // < 0.05
    metrics.record_apply_success(0.8); // < 1.0
    metrics.record_apply_success(3.0); // < 5.0

    let output = metrics.encode().expect("should encode metrics");

    assert!(output.contains("classgate_apply_duration_seconds_bucket{le=\"0.01\"} 1"));
    assert!(output.contains("classgate_apply_duration_seconds_bucket{le=\"1\"} 3"));
    assert!(output.contains("classgate_apply_duration_seconds_bucket{le=\"+Inf\"} 4"));
    assert!(output.contains("classgate_apply_duration_seconds_count 4"));
}
