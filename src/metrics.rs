//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Scheduler cycles and throttling skips
//! - Batch shipping outcomes and sizes
//! - Cursor fetches and pushes
//! - Per-destination failure counts
//! - Sibling heartbeats
//! - Engine state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current
//! state, histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a scheduler cycle.
pub fn record_cycle(data_driven: bool) {
    let kind = if data_driven { "data_driven" } else { "idle" };
    counter!("replication_cycles_total", "kind" => kind).increment(1);
}

/// Record a destination skipped by the back-off policy.
pub fn record_destination_skipped(url: &str) {
    counter!("replication_destination_skips_total", "url" => url.to_string()).increment(1);
}

/// Record a worker launch for a destination.
pub fn record_worker_started(url: &str) {
    counter!("replication_workers_started_total", "url" => url.to_string()).increment(1);
}

/// Record a remote cursor fetch result.
pub fn record_cursor_fetch(url: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_cursor_fetches_total", "url" => url.to_string(), "status" => status)
        .increment(1);
}

/// Record an explicit cursor push (filtered-region advance).
pub fn record_cursor_push(url: &str) {
    counter!("replication_cursor_pushes_total", "url" => url.to_string()).increment(1);
}

/// Record a shipped batch outcome.
pub fn record_ship(url: &str, kind: &str, records: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_ships_total",
        "url" => url.to_string(),
        "kind" => kind.to_string(),
        "status" => status
    )
    .increment(1);
    if success {
        counter!(
            "replication_records_shipped_total",
            "url" => url.to_string(),
            "kind" => kind.to_string()
        )
        .increment(records as u64);
        histogram!("replication_batch_size", "kind" => kind.to_string()).record(records as f64);
    }
}

/// Record latency of one outbound peer request.
pub fn record_peer_request_latency(url: &str, operation: &str, duration: Duration) {
    histogram!(
        "replication_peer_request_duration_seconds",
        "url" => url.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Gauge for a destination's in-memory failure count.
pub fn set_failure_count(url: &str, count: u64) {
    gauge!("replication_failure_count", "url" => url.to_string()).set(count as f64);
}

/// Record a sibling heartbeat result.
pub fn record_heartbeat(url: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_heartbeats_total", "url" => url.to_string(), "status" => status)
        .increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encoded numerically for alerting.
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state; these tests just verify the
    // helpers accept the full range of inputs without panicking.

    #[test]
    fn test_record_cycle() {
        record_cycle(true);
        record_cycle(false);
    }

    #[test]
    fn test_record_destination_skipped() {
        record_destination_skipped("http://peer:8080");
        record_destination_skipped("");
    }

    #[test]
    fn test_record_worker_started() {
        record_worker_started("http://peer:8080");
    }

    #[test]
    fn test_record_cursor_fetch() {
        record_cursor_fetch("http://peer:8080", true);
        record_cursor_fetch("http://peer:8080", false);
    }

    #[test]
    fn test_record_cursor_push() {
        record_cursor_push("http://peer:8080");
    }

    #[test]
    fn test_record_ship() {
        record_ship("http://peer:8080", "documents", 100, true);
        record_ship("http://peer:8080", "attachments", 0, true);
        record_ship("http://peer:8080", "documents", 5, false);
    }

    #[test]
    fn test_record_peer_request_latency() {
        record_peer_request_latency("http://peer:8080", "lastEtag", Duration::from_millis(5));
        record_peer_request_latency("http://peer:8080", "replicateDocs", Duration::ZERO);
    }

    #[test]
    fn test_set_failure_count() {
        set_failure_count("http://peer:8080", 0);
        set_failure_count("http://peer:8080", 1500);
    }

    #[test]
    fn test_record_heartbeat() {
        record_heartbeat("http://peer:8080", true);
        record_heartbeat("http://peer:8080", false);
    }

    #[test]
    fn test_set_engine_state_all_states() {
        set_engine_state("Created");
        set_engine_state("Running");
        set_engine_state("ShuttingDown");
        set_engine_state("Stopped");
        set_engine_state("Unknown");
    }
}
