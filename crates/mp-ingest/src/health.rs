use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Atomic health/stats tracker for one event source adapter.
///
/// Tracks everything the Monitoring & Health component and the adapter's
/// own `stats()` operation need: liveness, event throughput, reconnect
/// history, and a sliding window of parse outcomes used for the
/// parse-error-ratio circuit breaker.
#[derive(Debug)]
pub struct IngestHealth {
    name: String,
    running: AtomicBool,
    events_received: AtomicU64,
    in_flight_count: AtomicI64,
    has_fatal_error: AtomicBool,
    fatal_error_message: parking_lot::RwLock<Option<String>>,
    last_event_time_ms: AtomicU64,
    last_heartbeat_ms: AtomicU64,
    reconnect_attempts: AtomicU64,
    connected_since_ms: AtomicU64,
    parse_window: parking_lot::Mutex<VecDeque<bool>>,
    parse_window_cap: usize,
}

impl IngestHealth {
    pub fn new(name: String, parse_window_cap: usize) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            events_received: AtomicU64::new(0),
            in_flight_count: AtomicI64::new(0),
            has_fatal_error: AtomicBool::new(false),
            fatal_error_message: parking_lot::RwLock::new(None),
            last_event_time_ms: AtomicU64::new(0),
            last_heartbeat_ms: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            connected_since_ms: AtomicU64::new(0),
            parse_window: parking_lot::Mutex::new(VecDeque::with_capacity(parse_window_cap)),
            parse_window_cap: parse_window_cap.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        if running {
            self.connected_since_ms.store(now_ms(), Ordering::SeqCst);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn record_event(&self) -> u64 {
        self.last_event_time_ms.store(now_ms(), Ordering::SeqCst);
        self.events_received.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::SeqCst)
    }

    pub fn record_heartbeat(&self) {
        self.last_heartbeat_ms.store(now_ms(), Ordering::SeqCst);
    }

    /// Milliseconds since the last event or heartbeat, whichever is more
    /// recent. Used to detect a missed-heartbeat condition.
    pub fn millis_since_last_signal(&self) -> u64 {
        let last = self
            .last_event_time_ms
            .load(Ordering::SeqCst)
            .max(self.last_heartbeat_ms.load(Ordering::SeqCst))
            .max(self.connected_since_ms.load(Ordering::SeqCst));
        now_ms().saturating_sub(last)
    }

    pub fn increment_in_flight(&self) {
        self.in_flight_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_in_flight(&self) {
        self.in_flight_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight_count(&self) -> i64 {
        self.in_flight_count.load(Ordering::SeqCst)
    }

    pub fn set_fatal_error(&self, error: String) {
        self.has_fatal_error.store(true, Ordering::SeqCst);
        *self.fatal_error_message.write() = Some(error);
    }

    pub fn clear_fatal_error(&self) {
        self.has_fatal_error.store(false, Ordering::SeqCst);
        *self.fatal_error_message.write() = None;
    }

    pub fn has_fatal_error(&self) -> bool {
        self.has_fatal_error.load(Ordering::SeqCst)
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal_error_message.read().clone()
    }

    pub fn increment_reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_reconnect_attempts(&self) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Seconds the current connection has been held open.
    pub fn connected_secs(&self) -> u64 {
        let since = self.connected_since_ms.load(Ordering::SeqCst);
        if since == 0 {
            return 0;
        }
        now_ms().saturating_sub(since) / 1000
    }

    /// Record a frame parse outcome in the sliding window used for the
    /// parse-error-ratio circuit breaker.
    pub fn record_parse_outcome(&self, ok: bool) {
        let mut w = self.parse_window.lock();
        if w.len() >= self.parse_window_cap {
            w.pop_front();
        }
        w.push_back(ok);
    }

    /// Current parse error ratio over the sliding window (0.0 if the
    /// window is empty).
    pub fn parse_error_ratio(&self) -> f64 {
        let w = self.parse_window.lock();
        if w.is_empty() {
            return 0.0;
        }
        let errors = w.iter().filter(|ok| !**ok).count();
        errors as f64 / w.len() as f64
    }

    pub fn is_healthy(&self) -> bool {
        self.is_running() && !self.has_fatal_error()
    }

    pub fn get_status(&self) -> IngestHealthStatus {
        IngestHealthStatus {
            name: self.name.clone(),
            running: self.is_running(),
            healthy: self.is_healthy(),
            events_received: self.events_received(),
            in_flight_count: self.in_flight_count(),
            has_fatal_error: self.has_fatal_error(),
            fatal_error: self.fatal_error(),
            reconnect_attempts: self.reconnect_attempts(),
            connected_secs: self.connected_secs(),
            parse_error_ratio: self.parse_error_ratio(),
        }
    }

    pub fn status(&self) -> IngestHealthSnapshot {
        let last_ms = self.last_event_time_ms.load(Ordering::SeqCst);
        let last_event_at = if last_ms > 0 {
            chrono::DateTime::from_timestamp_millis(last_ms as i64)
        } else {
            None
        };

        let status = if self.has_fatal_error() {
            IngestStatus::Error
        } else if self.is_running() {
            IngestStatus::Running
        } else {
            IngestStatus::Stopped
        };

        IngestHealthSnapshot {
            status,
            events_received: self.events_received(),
            in_flight_count: self.in_flight_count().max(0) as u32,
            reconnect_attempts: self.reconnect_attempts(),
            last_event_at,
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestHealthStatus {
    pub name: String,
    pub running: bool,
    pub healthy: bool,
    pub events_received: u64,
    pub in_flight_count: i64,
    pub has_fatal_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    pub reconnect_attempts: u64,
    pub connected_secs: u64,
    pub parse_error_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestProcessorHealth {
    pub healthy: bool,
    pub total_sources: usize,
    pub healthy_sources: usize,
    pub unhealthy_sources: usize,
    pub sources: Vec<IngestHealthStatus>,
}

#[derive(Debug, Clone)]
pub struct AggregatedHealth {
    live: bool,
    ready: bool,
    pub errors: Vec<String>,
}

impl AggregatedHealth {
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestStatus {
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone)]
pub struct IngestHealthSnapshot {
    pub status: IngestStatus,
    pub events_received: u64,
    pub in_flight_count: u32,
    pub reconnect_attempts: u64,
    pub last_event_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Aggregates health across every adapter instance the process runs
/// (normally just one, but nothing here assumes that).
pub struct IngestHealthService {
    sources: Vec<Arc<IngestHealth>>,
}

impl IngestHealthService {
    pub fn new() -> Self {
        Self { sources: Vec::new() }
    }

    pub fn register(&mut self, health: Arc<IngestHealth>) {
        self.sources.push(health);
    }

    pub fn is_live(&self) -> bool {
        !self.sources.is_empty() && self.sources.iter().any(|h| h.is_running())
    }

    pub fn is_ready(&self) -> bool {
        !self.sources.is_empty() && self.sources.iter().all(|h| h.is_healthy())
    }

    pub fn get_health(&self) -> IngestProcessorHealth {
        let statuses: Vec<IngestHealthStatus> =
            self.sources.iter().map(|h| h.get_status()).collect();

        let healthy_count = statuses.iter().filter(|s| s.healthy).count();
        let total = statuses.len();

        IngestProcessorHealth {
            healthy: healthy_count == total && total > 0,
            total_sources: total,
            healthy_sources: healthy_count,
            unhealthy_sources: total - healthy_count,
            sources: statuses,
        }
    }

    pub fn get_aggregated_health(&self) -> AggregatedHealth {
        let live = self.is_live();
        let ready = self.is_ready();
        let errors: Vec<String> = self.sources.iter().filter_map(|h| h.fatal_error()).collect();
        AggregatedHealth { live, ready, errors }
    }

    pub fn all(&self) -> &[Arc<IngestHealth>] {
        &self.sources
    }
}

impl Default for IngestHealthService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_requires_running_and_no_fatal_error() {
        let health = IngestHealth::new("test-source".to_string(), 10);

        assert!(!health.is_running());
        assert!(!health.is_healthy());

        health.set_running(true);
        assert!(health.is_healthy());

        health.set_fatal_error("transport reset".to_string());
        assert!(!health.is_healthy());

        health.clear_fatal_error();
        assert!(health.is_healthy());
    }

    #[test]
    fn parse_error_ratio_tracks_sliding_window() {
        let health = IngestHealth::new("test-source".to_string(), 4);

        for _ in 0..3 {
            health.record_parse_outcome(true);
        }
        health.record_parse_outcome(false);
        assert_eq!(health.parse_error_ratio(), 0.25);

        // Window caps at 4; pushing a 5th evicts the oldest (an ok frame).
        health.record_parse_outcome(false);
        assert_eq!(health.parse_error_ratio(), 0.5);
    }

    #[test]
    fn service_aggregates_across_sources() {
        let mut service = IngestHealthService::new();
        let a = Arc::new(IngestHealth::new("a".to_string(), 10));
        let b = Arc::new(IngestHealth::new("b".to_string(), 10));
        service.register(a.clone());
        service.register(b.clone());

        assert!(!service.is_live());

        a.set_running(true);
        assert!(service.is_live());
        assert!(!service.is_ready());

        b.set_running(true);
        assert!(service.is_ready());

        a.set_fatal_error("boom".to_string());
        assert!(!service.is_ready());
        assert!(service.is_live());
    }
}
