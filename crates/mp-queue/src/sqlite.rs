use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mp_common::{Correlation, EventKind, Notification, Priority, QueueItem, QueueState};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, warn};

use crate::{QueueDepths, QueueError, QueueStore, Result, RetryPolicy};

/// SQLite-backed implementation of the durable priority queue.
///
/// One table holds every state (`ready`/`delayed`/`inflight`/`dead`) as a
/// `state` column rather than four physical tables, which keeps the
/// promote/dequeue/sweep transitions a single `UPDATE ... WHERE` each
/// instead of a cross-table move.
pub struct SqliteQueueStore {
    pool: Pool<Sqlite>,
    max_ready_capacity: u32,
}

fn score_of(priority: Priority, scheduled_for: DateTime<Utc>) -> i64 {
    scheduled_for.timestamp_millis() - priority.weight() * 1_000_000
}

fn kind_to_str(kind: EventKind) -> &'static str {
    kind.as_str()
}

fn kind_from_str(s: &str) -> EventKind {
    match s {
        "transaction" => EventKind::Transaction,
        "position_update" => EventKind::PositionUpdate,
        "resolution" => EventKind::Resolution,
        "price_update" => EventKind::PriceUpdate,
        _ => EventKind::VolumeUpdate,
    }
}

fn priority_to_str(p: Priority) -> &'static str {
    match p {
        Priority::Low => "low",
        Priority::Medium => "medium",
        Priority::High => "high",
        Priority::Urgent => "urgent",
    }
}

fn priority_from_str(s: &str) -> Priority {
    match s {
        "low" => Priority::Low,
        "medium" => Priority::Medium,
        "high" => Priority::High,
        _ => Priority::Urgent,
    }
}

fn state_to_str(s: QueueState) -> &'static str {
    match s {
        QueueState::Ready => "ready",
        QueueState::Delayed => "delayed",
        QueueState::Inflight => "inflight",
        QueueState::Dead => "dead",
    }
}

fn state_from_str(s: &str) -> QueueState {
    match s {
        "ready" => QueueState::Ready,
        "delayed" => QueueState::Delayed,
        "inflight" => QueueState::Inflight,
        _ => QueueState::Dead,
    }
}

fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl SqliteQueueStore {
    pub fn new(pool: Pool<Sqlite>, max_ready_capacity: u32) -> Self {
        Self {
            pool,
            max_ready_capacity,
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                notif_id TEXT PRIMARY KEY,
                recipient_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                priority TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                scheduled_for INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                correlation_event_id TEXT NOT NULL,
                correlation_wallet TEXT,
                correlation_market TEXT,
                state TEXT NOT NULL,
                last_attempt_at INTEGER,
                visible_at INTEGER NOT NULL,
                retry_delay_ms INTEGER NOT NULL DEFAULT 0,
                score INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_notif_ready ON notifications (state, visible_at, score)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_notif_delayed ON notifications (state, scheduled_for)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dedup_keys (
                recipient_id TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (recipient_id, dedup_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("queue store schema initialized");
        Ok(())
    }

    fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> QueueItem {
        let notification = Notification {
            notif_id: row.get("notif_id"),
            recipient_id: row.get("recipient_id"),
            kind: kind_from_str(row.get::<String, _>("kind").as_str()),
            priority: priority_from_str(row.get::<String, _>("priority").as_str()),
            title: row.get("title"),
            body: row.get("body"),
            dedup_key: row.get("dedup_key"),
            created_at: millis_to_dt(row.get("created_at")),
            scheduled_for: millis_to_dt(row.get("scheduled_for")),
            attempts: row.get::<i64, _>("attempts") as u32,
            correlation: Correlation {
                event_id: row.get("correlation_event_id"),
                subject_wallet: row.get("correlation_wallet"),
                subject_market: row.get("correlation_market"),
            },
        };

        QueueItem {
            notification,
            state: state_from_str(row.get::<String, _>("state").as_str()),
            last_attempt_at: row
                .get::<Option<i64>, _>("last_attempt_at")
                .map(millis_to_dt),
            visible_at: millis_to_dt(row.get("visible_at")),
            retry_delay_ms: row.get::<i64, _>("retry_delay_ms") as u64,
        }
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(&self, notification: Notification) -> Result<()> {
        let now = Utc::now();
        let state = if notification.scheduled_for <= now {
            QueueState::Ready
        } else {
            QueueState::Delayed
        };
        let score = score_of(notification.priority, notification.scheduled_for);

        if state == QueueState::Ready {
            let ready_count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE state = 'ready'")
                    .fetch_one(&self.pool)
                    .await?;

            if ready_count as u32 >= self.max_ready_capacity {
                // Evict the lowest-priority (highest score) ready item only
                // if the new item is strictly higher priority.
                let victim = sqlx::query(
                    "SELECT notif_id, score FROM notifications WHERE state = 'ready' ORDER BY score DESC LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await?;

                match victim {
                    Some(row) => {
                        let victim_score: i64 = row.get("score");
                        if score < victim_score {
                            let victim_id: String = row.get("notif_id");
                            sqlx::query("DELETE FROM notifications WHERE notif_id = ?")
                                .bind(&victim_id)
                                .execute(&self.pool)
                                .await?;
                            warn!(evicted = %victim_id, "ready queue at capacity, evicted lowest-priority item");
                        } else {
                            return Err(QueueError::Full);
                        }
                    }
                    None => return Err(QueueError::Full),
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO notifications (
                notif_id, recipient_id, kind, priority, title, body, dedup_key,
                created_at, scheduled_for, attempts, correlation_event_id,
                correlation_wallet, correlation_market, state, last_attempt_at,
                visible_at, retry_delay_ms, score
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, 0, ?)
            ON CONFLICT(notif_id) DO NOTHING
            "#,
        )
        .bind(&notification.notif_id)
        .bind(&notification.recipient_id)
        .bind(kind_to_str(notification.kind))
        .bind(priority_to_str(notification.priority))
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(&notification.dedup_key)
        .bind(notification.created_at.timestamp_millis())
        .bind(notification.scheduled_for.timestamp_millis())
        .bind(notification.attempts as i64)
        .bind(&notification.correlation.event_id)
        .bind(&notification.correlation.subject_wallet)
        .bind(&notification.correlation.subject_market)
        .bind(state_to_str(state))
        .bind(notification.scheduled_for.timestamp_millis())
        .bind(score)
        .execute(&self.pool)
        .await?;

        debug!(notif_id = %notification.notif_id, state = state_to_str(state), "enqueued notification");
        Ok(())
    }

    async fn promote_due(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE notifications SET state = 'ready' WHERE state = 'delayed' AND scheduled_for <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn dequeue_batch(&self, limit: u32, lease_ms: u64) -> Result<Vec<QueueItem>> {
        let now = Utc::now();
        let rows = sqlx::query(
            "SELECT * FROM notifications WHERE state = 'ready' AND visible_at <= ? ORDER BY score ASC LIMIT ?",
        )
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let new_visible_at = (now + chrono::Duration::milliseconds(lease_ms as i64)).timestamp_millis();
        let mut items = Vec::with_capacity(rows.len());

        for row in rows {
            let notif_id: String = row.get("notif_id");
            let updated = sqlx::query(
                "UPDATE notifications SET state = 'inflight', visible_at = ?, last_attempt_at = ? WHERE notif_id = ? AND state = 'ready'",
            )
            .bind(new_visible_at)
            .bind(now.timestamp_millis())
            .bind(&notif_id)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                continue;
            }

            let mut item = Self::row_to_item(&row);
            item.state = QueueState::Inflight;
            item.visible_at = millis_to_dt(new_visible_at);
            item.last_attempt_at = Some(now);
            items.push(item);
        }

        Ok(items)
    }

    async fn extend_lease(&self, notif_id: &str, lease_ms: u64) -> Result<()> {
        let new_visible_at =
            (Utc::now() + chrono::Duration::milliseconds(lease_ms as i64)).timestamp_millis();
        let result = sqlx::query(
            "UPDATE notifications SET visible_at = ? WHERE notif_id = ? AND state = 'inflight'",
        )
        .bind(new_visible_at)
        .bind(notif_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(notif_id.to_string()));
        }
        Ok(())
    }

    async fn complete(&self, notif_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM notifications WHERE notif_id = ?")
            .bind(notif_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(notif_id.to_string()));
        }
        Ok(())
    }

    async fn fail(&self, notif_id: &str, policy: RetryPolicy) -> Result<()> {
        let row = sqlx::query("SELECT attempts, priority FROM notifications WHERE notif_id = ?")
            .bind(notif_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| QueueError::NotFound(notif_id.to_string()))?;

        let attempts = row.get::<i64, _>("attempts") as u32 + 1;
        let priority = priority_from_str(row.get::<String, _>("priority").as_str());

        if attempts >= policy.max_attempts {
            sqlx::query("UPDATE notifications SET state = 'dead', attempts = ? WHERE notif_id = ?")
                .bind(attempts as i64)
                .bind(notif_id)
                .execute(&self.pool)
                .await?;
            warn!(notif_id, attempts, "notification exhausted retries, moved to dead letter");
            return Ok(());
        }

        let delay_ms = policy.delay_for_attempt(attempts);
        let scheduled_for = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
        let score = score_of(priority, scheduled_for);

        sqlx::query(
            r#"
            UPDATE notifications
            SET state = 'delayed', attempts = ?, scheduled_for = ?, retry_delay_ms = ?, score = ?
            WHERE notif_id = ?
            "#,
        )
        .bind(attempts as i64)
        .bind(scheduled_for.timestamp_millis())
        .bind(delay_ms as i64)
        .bind(score)
        .bind(notif_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn sweep_inflight(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE notifications SET state = 'ready' WHERE state = 'inflight' AND visible_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            warn!(count = result.rows_affected(), "reclaimed expired in-flight notifications");
        }
        Ok(result.rows_affected())
    }

    async fn reap_dead(&self, retention_hours: u64) -> Result<u64> {
        let cutoff =
            (Utc::now() - chrono::Duration::hours(retention_hours as i64)).timestamp_millis();
        let result = sqlx::query(
            "DELETE FROM notifications WHERE state = 'dead' AND last_attempt_at IS NOT NULL AND last_attempt_at <= ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn depths(&self) -> Result<QueueDepths> {
        let rows = sqlx::query("SELECT state, COUNT(*) as c FROM notifications GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut depths = QueueDepths::default();
        for row in rows {
            let state: String = row.get("state");
            let count: i64 = row.get("c");
            match state.as_str() {
                "ready" => depths.ready = count as u64,
                "delayed" => depths.delayed = count as u64,
                "inflight" => depths.inflight = count as u64,
                "dead" => depths.dead = count as u64,
                _ => {}
            }
        }
        Ok(depths)
    }

    async fn check_and_record_dedup(
        &self,
        recipient_id: &str,
        dedup_key: &str,
        ttl_seconds: u64,
    ) -> Result<bool> {
        let now = Utc::now();
        sqlx::query("DELETE FROM dedup_keys WHERE expires_at <= ?")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;

        let expires_at = (now + chrono::Duration::seconds(ttl_seconds as i64)).timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO dedup_keys (recipient_id, dedup_key, expires_at) VALUES (?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(recipient_id)
        .bind(dedup_key)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        // rows_affected == 0 means the key already existed: duplicate.
        Ok(result.rows_affected() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_common::Priority;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteQueueStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteQueueStore::new(pool, 100);
        store.init_schema().await.unwrap();
        store
    }

    fn notif(id: &str, priority: Priority) -> Notification {
        Notification {
            notif_id: id.to_string(),
            recipient_id: "r1".to_string(),
            kind: EventKind::Transaction,
            priority,
            title: "t".to_string(),
            body: "b".to_string(),
            dedup_key: format!("dedup-{id}"),
            created_at: Utc::now(),
            scheduled_for: Utc::now(),
            attempts: 0,
            correlation: Correlation {
                event_id: "e1".to_string(),
                subject_wallet: None,
                subject_market: None,
            },
        }
    }

    #[tokio::test]
    async fn enqueue_and_dequeue_priority_order() {
        let store = store().await;
        store.enqueue(notif("low", Priority::Low)).await.unwrap();
        store.enqueue(notif("urgent", Priority::Urgent)).await.unwrap();

        let batch = store.dequeue_batch(10, 30_000).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].notification.notif_id, "urgent");
        assert_eq!(batch[1].notification.notif_id, "low");
    }

    #[tokio::test]
    async fn fail_retries_then_dies() {
        let store = store().await;
        store.enqueue(notif("n1", Priority::Medium)).await.unwrap();
        let batch = store.dequeue_batch(10, 30_000).await.unwrap();
        assert_eq!(batch.len(), 1);

        let policy = RetryPolicy {
            base_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
            max_attempts: 2,
        };

        store.fail("n1", policy).await.unwrap();
        let depths = store.depths().await.unwrap();
        assert_eq!(depths.delayed, 1);

        store.fail("n1", policy).await.unwrap();
        let depths = store.depths().await.unwrap();
        assert_eq!(depths.dead, 1);
    }

    #[tokio::test]
    async fn dedup_rejects_second_insert() {
        let store = store().await;
        let first = store.check_and_record_dedup("r1", "k1", 60).await.unwrap();
        let second = store.check_and_record_dedup("r1", "k1", 60).await.unwrap();
        assert!(!first);
        assert!(second);
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_lease() {
        let store = store().await;
        store.enqueue(notif("n1", Priority::Medium)).await.unwrap();
        let batch = store.dequeue_batch(10, 0).await.unwrap();
        assert_eq!(batch.len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let reclaimed = store.sweep_inflight().await.unwrap();
        assert_eq!(reclaimed, 1);

        let depths = store.depths().await.unwrap();
        assert_eq!(depths.ready, 1);
    }
}
