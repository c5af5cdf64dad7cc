// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the favorite engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `favorite_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `action`: favorite, unfavorite
//! - `operation`: cache/store call name
//! - `trigger`: interval, threshold, manual
//! - `status`: ok, already_exists, not_found, internal, completed, abandoned, failed

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a favorite/unfavorite outcome
pub fn record_action(action: &str, status: &str) {
    counter!(
        "favorite_engine_actions_total",
        "action" => action.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "favorite_engine_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record the end of a reconciliation pass
pub fn record_reconcile_run(trigger: &str, status: &str, duration: Duration) {
    counter!(
        "favorite_engine_reconcile_runs_total",
        "trigger" => trigger.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("favorite_engine_reconcile_seconds").record(duration.as_secs_f64());
}

/// Record rows committed to the durable store
pub fn record_reconcile_rows(count: usize) {
    counter!("favorite_engine_reconcile_rows_total").increment(count as u64);
}

/// Record a trigger dropped because a pass was already running
pub fn record_trigger_dropped(trigger: &str) {
    counter!(
        "favorite_engine_triggers_dropped_total",
        "trigger" => trigger.to_string()
    )
    .increment(1);
}

/// Set the last observed pending delta
pub fn set_pending_delta(delta: u64) {
    gauge!("favorite_engine_pending_delta").set(delta as f64);
}

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "favorite_engine_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "favorite_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
