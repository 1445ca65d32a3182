//! Health Service — rolls up dispatch success rate, queue depths, ingest
//! connectivity, and active warnings into one `HealthReport`, the shape
//! behind `/health` and `/monitoring`.
//!
//! Keeps the teacher's rolling-window counter for the success rate
//! (`RollingCounter`, same 30-minute default window) but replaces the
//! per-pool/per-consumer bookkeeping with the queue-depth and
//! circuit-breaker signals this pipeline actually has.

use std::time::{Duration, Instant};

use mp_common::{HealthReport, HealthStatus, QueueDepths};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::warning::WarningService;

#[derive(Debug, Clone)]
pub struct HealthServiceConfig {
    pub healthy_threshold: f64,
    pub warning_threshold: f64,
    pub rolling_window: Duration,
    pub warning_age_minutes: i64,
}

impl Default for HealthServiceConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: 0.90,
            warning_threshold: 0.70,
            rolling_window: Duration::from_secs(30 * 60),
            warning_age_minutes: 30,
        }
    }
}

struct RollingCounter {
    window: Duration,
    events: RwLock<Vec<(Instant, bool)>>,
}

impl RollingCounter {
    fn new(window: Duration) -> Self {
        Self { window, events: RwLock::new(Vec::new()) }
    }

    fn record(&self, success: bool) {
        let mut events = self.events.write();
        events.push((Instant::now(), success));
        let cutoff = Instant::now() - self.window;
        events.retain(|(t, _)| *t > cutoff);
    }

    fn success_rate(&self) -> Option<f64> {
        let events = self.events.read();
        let cutoff = Instant::now() - self.window;
        let recent: Vec<_> = events.iter().filter(|(t, _)| *t > cutoff).collect();
        if recent.is_empty() {
            return None;
        }
        let successes = recent.iter().filter(|(_, s)| *s).count();
        Some(successes as f64 / recent.len() as f64)
    }
}

pub struct HealthService {
    config: HealthServiceConfig,
    warning_service: Arc<WarningService>,
    breakers: Arc<CircuitBreakerRegistry>,
    dispatch_results: RollingCounter,
    ingest_connected: std::sync::atomic::AtomicBool,
}

impl HealthService {
    pub fn new(config: HealthServiceConfig, warning_service: Arc<WarningService>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        let window = config.rolling_window;
        Self {
            config,
            warning_service,
            breakers,
            dispatch_results: RollingCounter::new(window),
            ingest_connected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn record_dispatch_result(&self, success: bool) {
        self.dispatch_results.record(success);
    }

    pub fn set_ingest_connected(&self, connected: bool) {
        self.ingest_connected.store(connected, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn dispatch_success_rate(&self) -> f64 {
        self.dispatch_results.success_rate().unwrap_or(1.0)
    }

    pub fn build_report(&self, depths: &QueueDepths) -> HealthReport {
        let mut issues = Vec::new();

        let ingest_connected = self.ingest_connected.load(std::sync::atomic::Ordering::Relaxed);
        if !ingest_connected {
            issues.push("event source not connected".to_string());
        }

        let success_rate = self.dispatch_success_rate();
        if success_rate < self.config.warning_threshold {
            issues.push(format!("dispatch success rate {:.1}%", success_rate * 100.0));
        }

        let circuit_open_count = self.breakers.open_count() as u32;
        if circuit_open_count > 0 {
            issues.push(format!("{circuit_open_count} circuit breaker(s) open"));
        }

        if depths.dead > 0 {
            issues.push(format!("{} notifications in the dead letter queue", depths.dead));
        }

        let active_warnings = self.warning_service.get_active_warnings(self.config.warning_age_minutes).len() as u32;
        let critical_warnings = self.warning_service.critical_count() as u32;
        if critical_warnings > 0 {
            issues.push(format!("{critical_warnings} critical warnings"));
        }

        let status = if !ingest_connected || critical_warnings > 0 || success_rate < self.config.warning_threshold {
            HealthStatus::Degraded
        } else if active_warnings > 0 || circuit_open_count > 0 || depths.dead > 0 || success_rate < self.config.healthy_threshold {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        let report = HealthReport {
            status,
            ingest_connected,
            queue_depth_ready: depths.ready,
            queue_depth_delayed: depths.delayed,
            queue_depth_inflight: depths.inflight,
            queue_depth_dead: depths.dead,
            dispatch_success_rate: success_rate,
            circuit_open_count,
            active_warnings,
            critical_warnings,
            issues,
        };

        if report.status != HealthStatus::Healthy {
            debug!(status = ?report.status, issues = ?report.issues, "health report generated");
        }
        report
    }

    pub fn is_healthy(&self, depths: &QueueDepths) -> bool {
        self.build_report(depths).status == HealthStatus::Healthy
    }

    /// Called on the Supervisor's metrics tick.
    pub fn cleanup(&self) {
        self.warning_service.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_common::CircuitBreakerConfig;

    fn service() -> HealthService {
        HealthService::new(
            HealthServiceConfig::default(),
            Arc::new(WarningService::default()),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 1,
                reset_timeout_ms: 1_000,
                max_reset_timeout_ms: 10_000,
                half_open_probe_calls: 1,
            })),
        )
    }

    fn empty_depths() -> QueueDepths {
        QueueDepths { ready: 0, delayed: 0, inflight: 0, dead: 0 }
    }

    #[test]
    fn healthy_when_connected_and_no_issues() {
        let svc = service();
        svc.set_ingest_connected(true);
        svc.record_dispatch_result(true);
        let report = svc.build_report(&empty_depths());
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn degraded_when_ingest_disconnected() {
        let svc = service();
        let report = svc.build_report(&empty_depths());
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.issues.iter().any(|i| i.contains("event source")));
    }

    #[test]
    fn warning_when_queue_has_dead_letters_only() {
        let svc = service();
        svc.set_ingest_connected(true);
        svc.record_dispatch_result(true);
        let depths = QueueDepths { ready: 0, delayed: 0, inflight: 0, dead: 3 };
        let report = svc.build_report(&depths);
        assert_eq!(report.queue_depth_dead, 3);
        assert_eq!(report.status, HealthStatus::Warning);
    }
}
