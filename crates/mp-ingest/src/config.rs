/// Configuration for a single reconnecting event source adapter.
///
/// Mirrors `mp_config::IngestConfig`'s fields; kept as its own type here so
/// `mp-ingest` has no dependency on `mp-config` (callers convert at the
/// wiring boundary, e.g. `bin/mp-router`).
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub source_url: String,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub heartbeat_interval_ms: u64,
    pub healthy_window_secs: u64,
    pub parse_error_ratio_threshold: f64,
    pub parse_error_window: usize,
    /// How long the parse-error-ratio breaker stays open once tripped
    /// before the adapter lets a frame through again as a probe. Distinct
    /// from the reconnect backoff fields above: this gates an open
    /// connection's frame processing, not the reconnect loop.
    pub circuit_breaker_reset_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            source_url: "http://127.0.0.1:8088/events".to_string(),
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            heartbeat_interval_ms: 15_000,
            healthy_window_secs: 60,
            parse_error_ratio_threshold: 0.1,
            parse_error_window: 100,
            circuit_breaker_reset_ms: 10_000,
        }
    }
}
