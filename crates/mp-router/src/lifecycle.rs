//! Supervisor — starts the pipeline's background ticks in order and
//! coordinates graceful shutdown.
//!
//! Startup order (per the component design): config and store connection
//! happen in the binary before this is constructed; from here, the
//! Queue Manager is already live, the Interest Index has been warmed up,
//! the Event Source Adapter and Dispatcher workers are handed to us
//! already running, and we spawn the recurring ticks — promoter, sweeper,
//! dispatch loop, metrics collector, dead-letter reaper, and (optionally)
//! the standby/leadership monitor — plus the two-phase graceful shutdown.
//!
//! Grounded on the teacher's `LifecycleManager` for the overall
//! tick-per-background-task shape and the broadcast shutdown channel;
//! the SQS-specific "visibility extension" task has no separate existence
//! here since `mp-queue`'s sweep already returns expired leases to ready.

use std::sync::Arc;
use std::time::Duration;

use mp_common::TimerConfig;
use mp_standby::LeaderElection;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::health::HealthService;
use crate::metrics::RouterMetrics;
use crate::queue_manager::QueueManager;
use crate::warning::WarningService;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub timers: TimerConfig,
    pub dead_letter_reap_interval: Duration,
    pub dispatch_batch_size: u32,
    pub dispatch_idle_backoff: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            timers: TimerConfig::default(),
            dead_letter_reap_interval: Duration::from_secs(3600),
            dispatch_batch_size: 50,
            dispatch_idle_backoff: Duration::from_millis(200),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    warning_service: Arc<WarningService>,
    health_service: Arc<HealthService>,
    shutdown_deadline: Duration,
    task_count: usize,
}

impl LifecycleManager {
    /// Spawns every background tick. `leader_election` is `None` when
    /// standby/HA is disabled, in which case this instance always
    /// processes.
    pub fn start(
        queue: Arc<QueueManager>,
        dispatcher: Arc<Dispatcher>,
        warning_service: Arc<WarningService>,
        health_service: Arc<HealthService>,
        config: LifecycleConfig,
        leader_election: Option<Arc<LeaderElection>>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_deadline = Duration::from_secs(config.timers.shutdown_deadline_secs);
        let is_leader = {
            let leader_election = leader_election.clone();
            move || leader_election.as_ref().map(|l| l.is_leader()).unwrap_or(true)
        };

        // Promoter: moves delayed items whose scheduled_for has arrived into ready.
        {
            let queue = queue.clone();
            let warning_service = warning_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = Duration::from_millis(config.timers.promote_tick_ms);
            let is_leader = is_leader.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !is_leader() { continue; }
                            if let Err(e) = queue.promote_due().await {
                                warn!(error = %e, "promote_due failed");
                                warning_service.add_warning(
                                    mp_common::WarningCategory::Queue,
                                    mp_common::WarningSeverity::Warn,
                                    format!("promote_due failed: {e}"),
                                    "lifecycle::promoter".to_string(),
                                );
                            }
                        }
                        _ = shutdown_rx.recv() => { info!("promoter shutting down"); break; }
                    }
                }
            });
        }

        // Sweeper: returns inflight items whose lease expired back to ready.
        {
            let queue = queue.clone();
            let warning_service = warning_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = Duration::from_millis(config.timers.sweep_tick_ms);
            let is_leader = is_leader.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !is_leader() { continue; }
                            if let Err(e) = queue.sweep_inflight().await {
                                warn!(error = %e, "sweep_inflight failed");
                                warning_service.add_warning(
                                    mp_common::WarningCategory::Queue,
                                    mp_common::WarningSeverity::Warn,
                                    format!("sweep_inflight failed: {e}"),
                                    "lifecycle::sweeper".to_string(),
                                );
                            }
                        }
                        _ = shutdown_rx.recv() => { info!("sweeper shutting down"); break; }
                    }
                }
            });
        }

        // Dispatch loop: drains ready work continuously, backing off when idle.
        {
            let health_service = health_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let batch_size = config.dispatch_batch_size;
            let idle_backoff = config.dispatch_idle_backoff;
            let is_leader = is_leader.clone();
            tokio::spawn(async move {
                loop {
                    if shutdown_rx.try_recv().is_ok() {
                        info!("dispatch loop shutting down");
                        break;
                    }
                    if !is_leader() {
                        tokio::time::sleep(idle_backoff).await;
                        continue;
                    }
                    match dispatcher.run_once(batch_size).await {
                        Ok(stats) => {
                            health_service.record_dispatch_result(stats.transient_failures == 0 && stats.permanent_failures == 0);
                            RouterMetrics::record_dispatch_outcome("sent");
                            if stats.sent == 0 && stats.transient_failures == 0 && stats.permanent_failures == 0 {
                                tokio::time::sleep(idle_backoff).await;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "dispatch pass failed");
                            tokio::time::sleep(idle_backoff).await;
                        }
                    }
                }
            });
        }

        // Metrics collector: rebuilds the health report and republishes gauges.
        {
            let queue = queue.clone();
            let health_service = health_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = Duration::from_millis(config.timers.metrics_tick_ms);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match queue.depths().await {
                                Ok(depths) => {
                                    let report = health_service.build_report(&depths);
                                    RouterMetrics::record_health_report(&report);
                                    if !report.issues.is_empty() {
                                        debug!(issues = ?report.issues, "health report");
                                    }
                                }
                                Err(e) => warn!(error = %e, "failed to read queue depths"),
                            }
                            health_service.cleanup();
                        }
                        _ = shutdown_rx.recv() => { info!("metrics collector shutting down"); break; }
                    }
                }
            });
        }

        // Dead-letter reaper.
        {
            let queue = queue.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.dead_letter_reap_interval;
            let is_leader = is_leader.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !is_leader() { continue; }
                            match queue.reap_dead().await {
                                Ok(n) if n > 0 => info!(reaped = n, "dead letter reaper ran"),
                                Ok(_) => {}
                                Err(e) => warn!(error = %e, "reap_dead failed"),
                            }
                        }
                        _ = shutdown_rx.recv() => { info!("dead letter reaper shutting down"); break; }
                    }
                }
            });
        }

        let mut task_count = 5;

        // Standby/leadership monitor.
        if let Some(election) = leader_election.clone() {
            let mut shutdown_rx = shutdown_tx.subscribe();
            let mut status_rx = election.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = status_rx.changed() => {
                            if changed.is_err() { break; }
                            info!(status = ?*status_rx.borrow(), "leadership status changed");
                        }
                        _ = shutdown_rx.recv() => { info!("leadership monitor shutting down"); break; }
                    }
                }
            });
            task_count += 1;
        }

        info!(tasks = task_count, "lifecycle manager started");

        Self {
            shutdown_tx,
            warning_service,
            health_service,
            shutdown_deadline,
            task_count,
        }
    }

    pub fn warning_service(&self) -> &Arc<WarningService> {
        &self.warning_service
    }

    pub fn health_service(&self) -> &Arc<HealthService> {
        &self.health_service
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Signals every background task to stop and waits up to
    /// `shutdown_deadline_secs` for them to notice; a task that hasn't
    /// reacted by then is left to be dropped with the process.
    pub async fn shutdown(&self) {
        info!(tasks = self.task_count, "lifecycle manager shutting down");
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(50).min(self.shutdown_deadline)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_timers() {
        let config = LifecycleConfig::default();
        assert!(config.timers.promote_tick_ms > 0);
        assert!(config.timers.sweep_tick_ms > 0);
    }
}
