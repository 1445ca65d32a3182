//! Prometheus metric emission for the pipeline, via the `metrics` facade
//! (exported through `metrics-exporter-prometheus` at the binary's HTTP
//! `/metrics` endpoint).
//!
//! Bare recording functions grouped behind a namespace type, the same
//! shape as the teacher's metric helpers — one function per event worth
//! counting or timing, called from whichever component produced it.

use mp_common::HealthReport;
use metrics::{counter, gauge, histogram};

pub struct RouterMetrics;

impl RouterMetrics {
    pub fn record_event_ingested(kind: &str) {
        counter!("mp_events_ingested_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_ingest_parse_error() {
        counter!("mp_ingest_parse_errors_total").increment(1);
    }

    pub fn set_ingest_connected(connected: bool) {
        gauge!("mp_ingest_connected").set(if connected { 1.0 } else { 0.0 });
    }

    pub fn record_interest_match(matched_recipients: usize) {
        histogram!("mp_interest_matches").record(matched_recipients as f64);
    }

    pub fn record_filter_drop(reason: &str) {
        counter!("mp_filter_dropped_total", "reason" => reason.to_string()).increment(1);
    }

    pub fn record_filter_defer() {
        counter!("mp_filter_deferred_total").increment(1);
    }

    pub fn record_notification_enqueued(priority: &str) {
        counter!("mp_notifications_enqueued_total", "priority" => priority.to_string()).increment(1);
    }

    pub fn set_queue_depths(ready: u64, delayed: u64, inflight: u64, dead: u64) {
        gauge!("mp_queue_depth", "state" => "ready").set(ready as f64);
        gauge!("mp_queue_depth", "state" => "delayed").set(delayed as f64);
        gauge!("mp_queue_depth", "state" => "inflight").set(inflight as f64);
        gauge!("mp_queue_depth", "state" => "dead").set(dead as f64);
    }

    pub fn record_dispatch_outcome(outcome: &str) {
        counter!("mp_dispatch_outcomes_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_dispatch_latency_ms(duration_ms: f64) {
        histogram!("mp_dispatch_latency_ms").record(duration_ms);
    }

    pub fn record_rate_limited() {
        counter!("mp_dispatch_rate_limited_total").increment(1);
    }

    pub fn set_circuit_open_count(count: u32) {
        gauge!("mp_circuit_breakers_open").set(count as f64);
    }

    pub fn record_coalesced_batch(item_count: usize) {
        histogram!("mp_coalesced_batch_size").record(item_count as f64);
    }

    /// Re-derives the gauges that mirror a freshly built `HealthReport`,
    /// called on the Supervisor's metrics tick so `/metrics` always
    /// matches the last `/health` snapshot.
    pub fn record_health_report(report: &HealthReport) {
        Self::set_ingest_connected(report.ingest_connected);
        Self::set_queue_depths(report.queue_depth_ready, report.queue_depth_delayed, report.queue_depth_inflight, report.queue_depth_dead);
        Self::set_circuit_open_count(report.circuit_open_count);
        gauge!("mp_dispatch_success_rate").set(report.dispatch_success_rate);
        gauge!("mp_warnings_active").set(report.active_warnings as f64);
        gauge!("mp_warnings_critical").set(report.critical_warnings as f64);
    }
}
