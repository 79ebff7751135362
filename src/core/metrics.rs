// src/core/metrics.rs

//! Defines and registers Prometheus metrics for control-plane monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Gauges ---
    /// The number of client runtimes currently connected.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("stratus_connected_clients", "Number of currently connected client runtimes.").unwrap();
    /// Depth of the scheduler's pending queue after the last tick.
    pub static ref PENDING_QUEUE_DEPTH: Gauge =
        register_gauge!("stratus_pending_queue_depth", "Items parked in the scheduler pending queue.").unwrap();
    /// The number of resource units in the cluster view.
    pub static ref RESOURCE_UNITS: Gauge =
        register_gauge!("stratus_resource_units", "Resource units currently in the cluster view.").unwrap();
    /// The number of instances the registry tracks.
    pub static ref TRACKED_INSTANCES: Gauge =
        register_gauge!("stratus_tracked_instances", "Instances currently tracked by the registry.").unwrap();

    // --- Counters ---
    /// Schedule outcomes, labeled by result code.
    pub static ref SCHEDULE_RESULTS_TOTAL: CounterVec =
        register_counter_vec!("stratus_schedule_results_total", "Schedule completions, labeled by status code.", &["code"]).unwrap();
    /// Placements that required evicting lower-priority victims.
    pub static ref PREEMPTIONS_TOTAL: Counter =
        register_counter!("stratus_preemptions_total", "Placements that preempted victim instances.").unwrap();
    /// Group kill requests processed by the group manager.
    pub static ref GROUP_KILLS_TOTAL: Counter =
        register_counter!("stratus_group_kills_total", "Group kill requests processed.").unwrap();
    /// Instances degraded to FATAL after losing their heartbeat.
    pub static ref HEARTBEAT_LOST_TOTAL: Counter =
        register_counter!("stratus_heartbeat_lost_total", "Instances marked FATAL after heartbeat loss.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text
/// format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
