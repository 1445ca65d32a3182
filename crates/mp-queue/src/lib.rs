use async_trait::async_trait;
use mp_common::{Notification, QueueItem};

pub mod error;
pub mod sqlite;

pub use error::QueueError;
pub use sqlite::SqliteQueueStore;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Depth of each of the four queue states, for monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDepths {
    pub ready: u64,
    pub delayed: u64,
    pub inflight: u64,
    pub dead: u64,
}

/// Retry policy applied by `fail()`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl From<mp_common::RetryConfig> for RetryPolicy {
    fn from(c: mp_common::RetryConfig) -> Self {
        Self {
            base_delay_ms: c.base_delay_ms,
            multiplier: c.multiplier,
            max_delay_ms: c.max_delay_ms,
            max_attempts: c.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// `min(base * multiplier^(attempts-1), max_delay)`
    pub fn delay_for_attempt(&self, attempts: u32) -> u64 {
        let exp = (attempts.saturating_sub(1)) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exp);
        (raw as u64).min(self.max_delay_ms)
    }
}

/// The durable priority/delayed/inflight/dead queue described by the
/// notification pipeline's Queue Manager component.
///
/// Exactly one of {ready, delayed, inflight, dead} holds any given item at
/// any instant; implementations must uphold that invariant even across a
/// crash between two operations (hence the SQL-transactional sqlite
/// implementation).
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new notification into `ready` (or `delayed`, if
    /// `scheduled_for` is in the future). Returns `Err(QueueError::Full)`
    /// if the ready lane is at capacity and no lower-priority item could be
    /// evicted to make room.
    async fn enqueue(&self, notification: Notification) -> Result<()>;

    /// Move due `delayed` items into `ready`. Returns the number promoted.
    async fn promote_due(&self) -> Result<u64>;

    /// Pop up to `limit` ready items (lowest score first) into `inflight`,
    /// each leased for `lease_ms`.
    async fn dequeue_batch(&self, limit: u32, lease_ms: u64) -> Result<Vec<QueueItem>>;

    /// Extend the lease of an in-flight item (used by the dispatcher on a
    /// long-running send so the sweeper does not reclaim it mid-flight).
    async fn extend_lease(&self, notif_id: &str, lease_ms: u64) -> Result<()>;

    /// Permanently remove a successfully delivered item.
    async fn complete(&self, notif_id: &str) -> Result<()>;

    /// Record a failed delivery attempt. Moves the item to `delayed` with
    /// the next backoff, or to `dead` once `max_attempts` is exhausted.
    async fn fail(&self, notif_id: &str, policy: RetryPolicy) -> Result<()>;

    /// Reclaim `inflight` items whose lease has expired back into `ready`
    /// (attempts unchanged — the dispatcher never got a result at all).
    async fn sweep_inflight(&self) -> Result<u64>;

    /// Expire `dead` items past their retention window.
    async fn reap_dead(&self, retention_hours: u64) -> Result<u64>;

    /// Current depth of each state, for health reporting.
    async fn depths(&self) -> Result<QueueDepths>;

    /// Whether `(recipient_id, dedup_key)` was already seen within its TTL.
    /// Recording and checking happen atomically so two concurrent enqueues
    /// of the same key cannot both pass.
    async fn check_and_record_dedup(
        &self,
        recipient_id: &str,
        dedup_key: &str,
        ttl_seconds: u64,
    ) -> Result<bool>;
}
