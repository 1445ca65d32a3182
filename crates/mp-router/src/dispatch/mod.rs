//! Dispatcher — dequeues ready work from the Queue Manager, rate limits
//! and coalesces it per recipient, sends through a `ChatClient` guarded by
//! a per-recipient circuit breaker, and reports the outcome back to the
//! queue.
//!
//! One logical scheduler: concurrency is bounded by `DispatchPool`'s
//! semaphore, at most one in-flight send per recipient is enforced by the
//! same pool, and a coalesced batch above `coalesce_threshold` is sent as
//! a single digest message instead of one call per notification.

pub mod mediator;
pub mod pool;

use std::sync::Arc;

use mp_common::{PipelineError, Result, SendOutcome};
use tracing::{info, warn};

use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::queue_manager::QueueManager;
use mediator::ChatClient;
use pool::DispatchPool;

pub struct Dispatcher {
    queue: Arc<QueueManager>,
    pool: Arc<DispatchPool>,
    chat_client: Arc<dyn ChatClient>,
    breakers: Arc<CircuitBreakerRegistry>,
    lease_ms: u64,
}

/// Summary of one dispatch pass, surfaced to the metrics collector.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchPassStats {
    pub sent: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    pub circuit_rejected: u64,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<QueueManager>,
        pool: Arc<DispatchPool>,
        chat_client: Arc<dyn ChatClient>,
        breakers: Arc<CircuitBreakerRegistry>,
        lease_ms: u64,
    ) -> Self {
        Self { queue, pool, chat_client, breakers, lease_ms }
    }

    /// Dequeues one batch, coalesces it by recipient, and dispatches every
    /// group concurrently (bounded by the pool's semaphore). Called on the
    /// Supervisor's dispatch tick.
    pub async fn run_once(&self, limit: u32) -> Result<DispatchPassStats> {
        let batch = self
            .queue
            .dequeue_batch(limit, self.lease_ms)
            .await
            .map_err(|e| PipelineError::Queue(e.to_string()))?;
        if batch.is_empty() {
            return Ok(DispatchPassStats::default());
        }

        let groups = self.queue.coalesce(batch);
        let results = futures::future::join_all(groups.into_iter().map(|group| self.dispatch_group(group))).await;

        let mut stats = DispatchPassStats::default();
        for result in results {
            match result {
                Ok(GroupOutcome::Sent) => stats.sent += 1,
                Ok(GroupOutcome::Transient) => stats.transient_failures += 1,
                Ok(GroupOutcome::Permanent) => stats.permanent_failures += 1,
                Ok(GroupOutcome::CircuitRejected) => stats.circuit_rejected += 1,
                Err(e) => warn!(error = %e, "dispatch group failed"),
            }
        }
        Ok(stats)
    }

    async fn dispatch_group(&self, group: crate::queue_manager::CoalescedBatch) -> Result<GroupOutcome> {
        let recipient_id = group.recipient_id.clone();

        if !self.breakers.allow_request(&recipient_id) {
            for item in &group.items {
                self.queue
                    .fail(&item.notification.notif_id)
                    .await
                    .map_err(|e| PipelineError::Queue(e.to_string()))?;
            }
            return Ok(GroupOutcome::CircuitRejected);
        }
        if !self.pool.try_acquire_global() || !self.pool.try_acquire_recipient(&recipient_id) {
            // Rate limited this tick. This isn't a delivery failure, so
            // don't run it through the retry policy — instead shrink each
            // item's lease down to "now" so the next sweep tick (not the
            // full lease_ms) puts it back in ready for another attempt.
            for item in &group.items {
                if let Err(e) = self.queue.extend_lease(&item.notification.notif_id, 0).await {
                    warn!(error = %e, notif_id = %item.notification.notif_id, "failed to shrink lease after rate-limit rejection");
                }
            }
            return Ok(GroupOutcome::CircuitRejected);
        }

        let _permit = self.pool.acquire(&recipient_id).await;
        let title = group.title();
        let body = group.body();

        // Refresh the lease right before the network call so a slow send
        // can't have the sweeper reclaim the item mid-flight.
        for item in &group.items {
            if let Err(e) = self.queue.extend_lease(&item.notification.notif_id, self.lease_ms).await {
                warn!(error = %e, notif_id = %item.notification.notif_id, "failed to extend lease before send");
            }
        }

        let result = self.chat_client.send(&recipient_id, &title, &body).await?;
        match result.outcome {
            SendOutcome::Ok => {
                self.breakers.record_success(&recipient_id);
                for item in &group.items {
                    self.queue
                        .complete(&item.notification.notif_id)
                        .await
                        .map_err(|e| PipelineError::Queue(e.to_string()))?;
                }
                info!(recipient_id = %recipient_id, count = group.items.len(), "dispatched notification batch");
                Ok(GroupOutcome::Sent)
            }
            SendOutcome::Transient => {
                self.breakers.record_failure(&recipient_id);
                for item in &group.items {
                    self.queue
                        .fail(&item.notification.notif_id)
                        .await
                        .map_err(|e| PipelineError::Queue(e.to_string()))?;
                }
                Ok(GroupOutcome::Transient)
            }
            SendOutcome::Permanent => {
                self.breakers.record_failure(&recipient_id);
                for item in &group.items {
                    self.queue
                        .fail(&item.notification.notif_id)
                        .await
                        .map_err(|e| PipelineError::Queue(e.to_string()))?;
                }
                Ok(GroupOutcome::Permanent)
            }
        }
    }
}

enum GroupOutcome {
    Sent,
    Transient,
    Permanent,
    CircuitRejected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mp_common::{CircuitBreakerConfig, Correlation, DispatchResult, EventKind, Notification, Priority, QueueSettings, RateLimitConfig};
    use mp_queue::{RetryPolicy, SqliteQueueStore};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysOkClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatClient for AlwaysOkClient {
        async fn send(&self, _recipient_id: &str, _title: &str, _body: &str) -> Result<DispatchResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DispatchResult::ok())
        }
    }

    fn notif(id: &str, recipient: &str) -> Notification {
        Notification {
            notif_id: id.to_string(),
            recipient_id: recipient.to_string(),
            kind: EventKind::Transaction,
            priority: Priority::Medium,
            title: "t".to_string(),
            body: "b".to_string(),
            dedup_key: format!("d-{id}"),
            created_at: chrono::Utc::now(),
            scheduled_for: chrono::Utc::now(),
            attempts: 0,
            correlation: Correlation { event_id: "e1".to_string(), subject_wallet: None, subject_market: None },
        }
    }

    #[tokio::test]
    async fn run_once_sends_and_completes_ready_items() {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = SqliteQueueStore::new(pool, 100);
        store.init_schema().await.unwrap();
        let queue = Arc::new(QueueManager::new(
            Arc::new(store),
            RetryPolicy { base_delay_ms: 10, multiplier: 2.0, max_delay_ms: 100, max_attempts: 3 },
            QueueSettings::default(),
        ));
        queue.enqueue(notif("n1", "r1")).await.unwrap();

        let client = Arc::new(AlwaysOkClient { calls: AtomicUsize::new(0) });
        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::new(DispatchPool::new(RateLimitConfig::default(), 8)),
            client.clone(),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 1,
                reset_timeout_ms: 1_000,
                max_reset_timeout_ms: 10_000,
                half_open_probe_calls: 1,
            })),
            30_000,
        );

        let stats = dispatcher.run_once(10).await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        let depths = queue.depths().await.unwrap();
        assert_eq!(depths.ready, 0);
        assert_eq!(depths.inflight, 0);
    }

    #[tokio::test]
    async fn rate_limited_dispatch_shrinks_lease_for_fast_retry() {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = SqliteQueueStore::new(pool, 100);
        store.init_schema().await.unwrap();
        let queue = Arc::new(QueueManager::new(
            Arc::new(store),
            RetryPolicy { base_delay_ms: 10, multiplier: 2.0, max_delay_ms: 100, max_attempts: 3 },
            QueueSettings::default(),
        ));
        queue.enqueue(notif("n1", "r1")).await.unwrap();

        let client = Arc::new(AlwaysOkClient { calls: AtomicUsize::new(0) });
        let dispatch_pool = Arc::new(DispatchPool::new(
            RateLimitConfig { global_rps: 1, global_burst: 1, per_recipient_rps: 1, per_recipient_burst: 1 },
            8,
        ));
        // Exhaust the global bucket up front so this tick is rate limited.
        assert!(dispatch_pool.try_acquire_global());

        let dispatcher = Dispatcher::new(
            queue.clone(),
            dispatch_pool,
            client.clone(),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 1,
                reset_timeout_ms: 1_000,
                max_reset_timeout_ms: 10_000,
                half_open_probe_calls: 1,
            })),
            30_000,
        );

        let stats = dispatcher.run_once(10).await.unwrap();
        assert_eq!(stats.circuit_rejected, 1);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);

        // The lease was shrunk to "now" rather than the full 30s lease_ms,
        // so the very next sweep reclaims it instead of waiting it out.
        let reclaimed = queue.sweep_inflight().await.unwrap();
        assert_eq!(reclaimed, 1);
        let depths = queue.depths().await.unwrap();
        assert_eq!(depths.ready, 1);
    }
}
