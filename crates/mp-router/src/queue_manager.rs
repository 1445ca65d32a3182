//! Queue Manager facade — the single entry point the Dispatcher, the HTTP
//! API, and the Supervisor use to talk to the durable queue.
//!
//! `mp-queue::QueueStore` already owns enqueue/dequeue/retry/dedup; this
//! facade adds the one thing still missing: coalescing a dequeued batch
//! by recipient so the Dispatcher sends one chat message instead of
//! `coalesce_threshold`-or-more separate ones. Grounded on the teacher's
//! `QueueManager`, which played the same "one call site in front of the
//! queue" role, minus the SQS-specific receipt-handle/dedup-map
//! machinery that has no analogue over a store-backed queue.

use std::sync::Arc;

use mp_common::{QueueItem, QueueSettings};
use mp_queue::{QueueDepths, QueueStore, Result, RetryPolicy};

pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    retry_policy: RetryPolicy,
    settings: QueueSettings,
}

/// A recipient's dequeued items, combined into one send when there are
/// more than `coalesce_threshold` of them.
#[derive(Debug, Clone)]
pub struct CoalescedBatch {
    pub recipient_id: String,
    pub items: Vec<QueueItem>,
}

impl CoalescedBatch {
    /// Single delivery title: the highest-priority item's title if the
    /// batch wasn't coalesced, otherwise a digest header.
    pub fn title(&self) -> String {
        if self.items.len() == 1 {
            self.items[0].notification.title.clone()
        } else {
            format!("{} updates", self.items.len())
        }
    }

    /// Single delivery body: the one item's body, or every item's title
    /// joined into a digest.
    pub fn body(&self) -> String {
        if self.items.len() == 1 {
            self.items[0].notification.body.clone()
        } else {
            self.items
                .iter()
                .map(|i| format!("- {}", i.notification.title))
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

impl QueueManager {
    pub fn new(store: Arc<dyn QueueStore>, retry_policy: RetryPolicy, settings: QueueSettings) -> Self {
        Self {
            store,
            retry_policy,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub async fn enqueue(&self, notification: mp_common::Notification) -> Result<()> {
        self.store.enqueue(notification).await
    }

    pub async fn promote_due(&self) -> Result<u64> {
        self.store.promote_due().await
    }

    pub async fn dequeue_batch(&self, limit: u32, lease_ms: u64) -> Result<Vec<QueueItem>> {
        self.store.dequeue_batch(limit, lease_ms).await
    }

    pub async fn extend_lease(&self, notif_id: &str, lease_ms: u64) -> Result<()> {
        self.store.extend_lease(notif_id, lease_ms).await
    }

    pub async fn complete(&self, notif_id: &str) -> Result<()> {
        self.store.complete(notif_id).await
    }

    pub async fn fail(&self, notif_id: &str) -> Result<()> {
        self.store.fail(notif_id, self.retry_policy).await
    }

    pub async fn sweep_inflight(&self) -> Result<u64> {
        self.store.sweep_inflight().await
    }

    pub async fn reap_dead(&self) -> Result<u64> {
        self.store.reap_dead(self.settings.dead_letter_retention_hours).await
    }

    pub async fn depths(&self) -> Result<QueueDepths> {
        self.store.depths().await
    }

    /// Groups a dequeued batch by recipient, preserving per-recipient
    /// priority order, so the Dispatcher can decide whether to send
    /// separately or combine into one digest message.
    pub fn coalesce(&self, items: Vec<QueueItem>) -> Vec<CoalescedBatch> {
        let mut by_recipient: indexmap::IndexMap<String, Vec<QueueItem>> = indexmap::IndexMap::new();
        for item in items {
            by_recipient
                .entry(item.notification.recipient_id.clone())
                .or_default()
                .push(item);
        }

        by_recipient
            .into_iter()
            .map(|(recipient_id, items)| CoalescedBatch { recipient_id, items })
            .collect()
    }

    pub fn coalesce_threshold(&self) -> u32 {
        self.settings.coalesce_threshold
    }

    pub fn max_concurrent_dispatch(&self) -> u32 {
        self.settings.max_concurrent_dispatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_common::{Correlation, EventKind, Notification, Priority};
    use mp_queue::SqliteQueueStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn manager() -> QueueManager {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = SqliteQueueStore::new(pool, 100);
        store.init_schema().await.unwrap();
        QueueManager::new(
            Arc::new(store),
            RetryPolicy { base_delay_ms: 10, multiplier: 2.0, max_delay_ms: 100, max_attempts: 3 },
            QueueSettings::default(),
        )
    }

    fn notif(id: &str, recipient: &str) -> Notification {
        Notification {
            notif_id: id.to_string(),
            recipient_id: recipient.to_string(),
            kind: EventKind::Transaction,
            priority: Priority::Medium,
            title: format!("title-{id}"),
            body: "b".to_string(),
            dedup_key: format!("d-{id}"),
            created_at: chrono::Utc::now(),
            scheduled_for: chrono::Utc::now(),
            attempts: 0,
            correlation: Correlation { event_id: "e1".to_string(), subject_wallet: None, subject_market: None },
        }
    }

    #[tokio::test]
    async fn coalesces_by_recipient_preserving_order() {
        let mgr = manager().await;
        mgr.enqueue(notif("n1", "r1")).await.unwrap();
        mgr.enqueue(notif("n2", "r2")).await.unwrap();
        mgr.enqueue(notif("n3", "r1")).await.unwrap();

        let batch = mgr.dequeue_batch(10, 30_000).await.unwrap();
        let coalesced = mgr.coalesce(batch);

        assert_eq!(coalesced.len(), 2);
        let r1 = coalesced.iter().find(|b| b.recipient_id == "r1").unwrap();
        assert_eq!(r1.items.len(), 2);
        assert!(r1.body().contains("title-n1"));
        assert!(r1.body().contains("title-n3"));
    }
}
