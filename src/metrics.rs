//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Node probe results and latency
//! - Cluster state
//! - Supervisor cycles and divergence
//! - Schema objects created and points copied
//! - Bootstrap attempts and lifecycle operations
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use ha_replicator::metrics;
//! use std::time::Duration;
//!
//! // In the node monitor after a probe
//! metrics::record_node_probe("influx01", "master", true, Duration::from_millis(3));
//!
//! // In the supervisor after copying a chunk
//! metrics::record_points_copied("telegraf", 500);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one liveness probe.
pub fn record_node_probe(node: &str, role: &str, success: bool, latency: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_node_probes_total",
        "node" => node.to_string(),
        "role" => role.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("replication_node_probe_latency_seconds", "node" => node.to_string())
        .record(latency.as_secs_f64());
}

/// Set node up/down gauge (1 = up, 0 = down).
pub fn set_node_up(node: &str, role: &str, up: bool) {
    gauge!("replication_node_up", "node" => node.to_string(), "role" => role.to_string())
        .set(if up { 1.0 } else { 0.0 });
}

/// Set consecutive failure count for a node.
pub fn set_node_consecutive_failures(node: &str, failures: u32) {
    gauge!("replication_node_consecutive_failures", "node" => node.to_string()).set(failures as f64);
}

/// Set cluster state gauge.
///
/// One series per state; the current state is 1, the others 0.
pub fn set_cluster_state(state: &str) {
    for candidate in CLUSTER_STATES {
        let value = if *candidate == state { 1.0 } else { 0.0 };
        gauge!("replication_cluster_state", "state" => *candidate).set(value);
    }
}

const CLUSTER_STATES: &[&str] = &[
    "Bootstrapping",
    "Healthy",
    "MasterDown",
    "SlaveDown",
    "BothDown",
    "Resyncing",
];

/// Record a cluster state transition.
pub fn record_cluster_transition(from: &str, to: &str) {
    counter!(
        "replication_cluster_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Record a bootstrap attempt.
pub fn record_bootstrap_attempt(outcome: &str) {
    counter!("replication_bootstrap_attempts_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a completed supervisor cycle.
pub fn record_supervisor_cycle(state: &str, divergent: usize, duration: Duration) {
    counter!("replication_supervisor_cycles_total", "state" => state.to_string()).increment(1);
    gauge!("replication_divergent_descriptors").set(divergent as f64);
    histogram!("replication_supervisor_cycle_duration_seconds").record(duration.as_secs_f64());
}

/// Record a supervisor cycle skipped (node down or error).
pub fn record_supervisor_skipped(reason: &str) {
    counter!("replication_supervisor_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Record the largest master/slave lag seen this cycle.
pub fn record_replication_lag(lag: Duration) {
    gauge!("replication_lag_seconds").set(lag.as_secs_f64());
}

/// Record schema objects created on the slave.
pub fn record_schema_created(kind: &str, count: usize) {
    if count > 0 {
        counter!("replication_schema_objects_created_total", "kind" => kind.to_string())
            .increment(count as u64);
    }
}

/// Record points written to the slave.
pub fn record_points_copied(database: &str, count: usize) {
    counter!("replication_points_copied_total", "database" => database.to_string())
        .increment(count as u64);
}

/// Record a finished backfill of one descriptor.
pub fn record_backfill(reason: &str, points: usize, duration: Duration) {
    counter!("replication_backfills_total", "reason" => reason.to_string()).increment(1);
    histogram!("replication_backfill_points", "reason" => reason.to_string()).record(points as f64);
    histogram!("replication_backfill_duration_seconds", "reason" => reason.to_string())
        .record(duration.as_secs_f64());
}

/// Record a replication error by kind.
pub fn record_error(kind: &str) {
    counter!("replication_errors_total", "kind" => kind.to_string()).increment(1);
}

/// Record a lifecycle operation (start, stop, reload, copy).
pub fn record_lifecycle(operation: &str, duration: Duration) {
    counter!("replication_lifecycle_operations_total", "operation" => operation.to_string())
        .increment(1);
    histogram!(
        "replication_lifecycle_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}
