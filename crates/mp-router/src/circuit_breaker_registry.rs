//! Per-endpoint circuit breaker registry, used by the Dispatcher to trip
//! delivery to one chat endpoint without affecting others, and by the
//! Monitoring & Health component to report `circuit_open_count`.
//!
//! Ported from the teacher's per-endpoint registry (lazy creation keyed by
//! endpoint, a rolling buffer of recent outcomes feeding the open/close
//! decision) with two behavioral additions: `mp_common::CircuitBreakerConfig`
//! carries `reset_timeout_ms` *and* `max_reset_timeout_ms`, so a breaker
//! that keeps re-tripping right after going half-open grows its reset
//! timeout exponentially (doubling, same shape as the ingest adapter's
//! reconnect backoff) instead of retrying at a fixed interval forever; and
//! half-open bounds its concurrent probes to `half_open_probe_calls`
//! instead of letting every in-flight caller through at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mp_common::CircuitBreakerConfig;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreakerStats {
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub failure_rate: f64,
    pub buffered_calls: u32,
}

const BUFFER_SIZE: usize = 20;

struct EndpointCircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitBreakerState>,
    recent_results: RwLock<Vec<bool>>,
    consecutive_successes: AtomicU32,
    trip_count: AtomicU32,
    in_flight_probes: AtomicU32,
    last_failure: RwLock<Option<Instant>>,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl EndpointCircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitBreakerState::Closed),
            recent_results: RwLock::new(Vec::with_capacity(BUFFER_SIZE)),
            consecutive_successes: AtomicU32::new(0),
            trip_count: AtomicU32::new(0),
            in_flight_probes: AtomicU32::new(0),
            last_failure: RwLock::new(None),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    /// Reset timeout for the Nth trip in a row: doubles per trip, capped at
    /// `max_reset_timeout_ms`.
    fn current_reset_timeout(&self) -> Duration {
        let trips = self.trip_count.load(Ordering::SeqCst).max(1);
        let ms = (self.config.reset_timeout_ms as f64 * 2f64.powi((trips - 1) as i32)) as u64;
        Duration::from_millis(ms.min(self.config.max_reset_timeout_ms))
    }

    fn allow_request(&self) -> bool {
        let state = *self.state.read();
        match state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::HalfOpen => self.try_start_probe(),
            CircuitBreakerState::Open => {
                let elapsed = self.last_failure.read().map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.current_reset_timeout() {
                    *self.state.write() = CircuitBreakerState::HalfOpen;
                    self.consecutive_successes.store(0, Ordering::SeqCst);
                    self.in_flight_probes.store(0, Ordering::SeqCst);
                    self.try_start_probe()
                } else {
                    false
                }
            }
        }
    }

    /// Reserves one of `half_open_probe_calls` concurrent half-open slots.
    /// The caller must report the result (`record_success`/`record_failure`)
    /// so the slot is released.
    fn try_start_probe(&self) -> bool {
        let probes = self.in_flight_probes.fetch_add(1, Ordering::SeqCst);
        if probes < self.config.half_open_probe_calls {
            true
        } else {
            self.in_flight_probes.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        self.push_result(true);

        if *self.state.read() == CircuitBreakerState::HalfOpen {
            self.in_flight_probes.fetch_sub(1, Ordering::SeqCst);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= self.config.success_threshold {
                *self.state.write() = CircuitBreakerState::Closed;
                self.trip_count.store(0, Ordering::SeqCst);
                self.in_flight_probes.store(0, Ordering::SeqCst);
            }
        }
    }

    fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        *self.last_failure.write() = Some(Instant::now());
        self.push_result(false);

        match *self.state.read() {
            CircuitBreakerState::HalfOpen => {
                self.in_flight_probes.fetch_sub(1, Ordering::SeqCst);
                self.trip();
            }
            CircuitBreakerState::Closed => {
                let failures = self.recent_results.read().iter().filter(|ok| !**ok).count() as u32;
                if failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            CircuitBreakerState::Open => {}
        }
    }

    fn record_rejected(&self) {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn trip(&self) {
        *self.state.write() = CircuitBreakerState::Open;
        self.trip_count.fetch_add(1, Ordering::SeqCst);
        self.in_flight_probes.store(0, Ordering::SeqCst);
        *self.last_failure.write() = Some(Instant::now());
    }

    fn push_result(&self, ok: bool) {
        let mut buf = self.recent_results.write();
        if buf.len() >= BUFFER_SIZE {
            buf.remove(0);
        }
        buf.push(ok);
    }

    fn stats(&self) -> CircuitBreakerStats {
        let recent = self.recent_results.read();
        let failures = recent.iter().filter(|ok| !**ok).count();
        let failure_rate = if recent.is_empty() {
            0.0
        } else {
            failures as f64 / recent.len() as f64
        };

        CircuitBreakerStats {
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            failure_rate,
            buffered_calls: recent.len() as u32,
        }
    }

    fn reset(&self) {
        *self.state.write() = CircuitBreakerState::Closed;
        self.trip_count.store(0, Ordering::SeqCst);
        self.consecutive_successes.store(0, Ordering::SeqCst);
        self.in_flight_probes.store(0, Ordering::SeqCst);
        self.recent_results.write().clear();
        *self.last_failure.write() = None;
    }
}

/// Registry of per-endpoint breakers, keyed by whatever identifies an
/// endpoint (the recipient id, for the chat client in this repository).
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<EndpointCircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn get_or_create(&self, endpoint: &str) -> Arc<EndpointCircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(endpoint) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(EndpointCircuitBreaker::new(self.config.clone()))),
        )
    }

    pub fn allow_request(&self, endpoint: &str) -> bool {
        let breaker = self.get_or_create(endpoint);
        let allowed = breaker.allow_request();
        if !allowed {
            breaker.record_rejected();
        }
        allowed
    }

    pub fn record_success(&self, endpoint: &str) {
        self.get_or_create(endpoint).record_success();
    }

    pub fn record_failure(&self, endpoint: &str) {
        self.get_or_create(endpoint).record_failure();
    }

    pub fn stats(&self, endpoint: &str) -> Option<CircuitBreakerStats> {
        self.breakers.read().get(endpoint).map(|b| b.stats())
    }

    pub fn all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers
            .read()
            .iter()
            .map(|(name, b)| (name.clone(), b.stats()))
            .collect()
    }

    pub fn state(&self, endpoint: &str) -> Option<CircuitBreakerState> {
        self.breakers.read().get(endpoint).map(|b| *b.state.read())
    }

    pub fn reset(&self, endpoint: &str) -> bool {
        if let Some(breaker) = self.breakers.read().get(endpoint) {
            breaker.reset();
            true
        } else {
            false
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .read()
            .values()
            .filter(|b| *b.state.read() == CircuitBreakerState::Open)
            .count()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            reset_timeout_ms: 10,
            max_reset_timeout_ms: 40,
            half_open_probe_calls: 1,
        }
    }

    #[test]
    fn trips_open_after_failure_threshold() {
        let registry = CircuitBreakerRegistry::new(config());
        let endpoint = "r1";
        assert!(registry.allow_request(endpoint));
        registry.record_failure(endpoint);
        assert!(registry.allow_request(endpoint));
        registry.record_failure(endpoint);
        assert!(!registry.allow_request(endpoint));
        assert_eq!(registry.state(endpoint), Some(CircuitBreakerState::Open));
    }

    #[test]
    fn half_open_then_closed_on_success() {
        let registry = CircuitBreakerRegistry::new(config());
        let endpoint = "r1";
        registry.record_failure(endpoint);
        registry.record_failure(endpoint);
        std::thread::sleep(Duration::from_millis(15));
        assert!(registry.allow_request(endpoint));
        assert_eq!(registry.state(endpoint), Some(CircuitBreakerState::HalfOpen));
        registry.record_success(endpoint);
        assert_eq!(registry.state(endpoint), Some(CircuitBreakerState::Closed));
    }

    #[test]
    fn reset_timeout_grows_on_repeated_trips() {
        let registry = CircuitBreakerRegistry::new(config());
        let breaker = registry.get_or_create("r1");
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.current_reset_timeout(), Duration::from_millis(10));

        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.current_reset_timeout(), Duration::from_millis(20));
    }

    #[test]
    fn reset_clears_state() {
        let registry = CircuitBreakerRegistry::default();
        let endpoint = "r1";
        for _ in 0..15 {
            registry.record_failure(endpoint);
        }
        assert_eq!(registry.state(endpoint), Some(CircuitBreakerState::Open));
        assert!(registry.reset(endpoint));
        assert_eq!(registry.state(endpoint), Some(CircuitBreakerState::Closed));
    }

    #[test]
    fn half_open_bounds_concurrent_probes() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            half_open_probe_calls: 2,
            ..config()
        });
        let endpoint = "r1";
        registry.record_failure(endpoint);
        registry.record_failure(endpoint);
        std::thread::sleep(Duration::from_millis(15));

        // First two probes proceed; a third, before any result is in, is
        // rejected even though the breaker is still half-open.
        assert!(registry.allow_request(endpoint));
        assert!(registry.allow_request(endpoint));
        assert!(!registry.allow_request(endpoint));

        registry.record_success(endpoint);
        assert!(registry.allow_request(endpoint));
    }

    #[test]
    fn open_count_reflects_only_open_breakers() {
        let registry = CircuitBreakerRegistry::new(config());
        registry.record_failure("r1");
        registry.record_failure("r1");
        registry.record_success("r2");
        assert_eq!(registry.open_count(), 1);
    }
}
