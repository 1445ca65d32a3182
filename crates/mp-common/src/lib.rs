use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use utoipa::ToSchema;

pub mod logging;

// ============================================================================
// Core Data Model — Event
// ============================================================================

/// A single market-activity event ingested from the upstream source.
///
/// Immutable once constructed; `ingest_seq` is assigned by the adapter and
/// only used for diagnostics, never for ordering guarantees across
/// recipients.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub subject_wallet: Option<String>,
    #[serde(default)]
    pub subject_market: Option<String>,
    pub ingest_seq: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Transaction,
    PositionUpdate,
    Resolution,
    PriceUpdate,
    VolumeUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Transaction => "transaction",
            EventKind::PositionUpdate => "position_update",
            EventKind::Resolution => "resolution",
            EventKind::PriceUpdate => "price_update",
            EventKind::VolumeUpdate => "volume_update",
        }
    }
}

// ============================================================================
// Core Data Model — RecipientProfile
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KindPreferences {
    #[serde(default = "default_true")]
    pub transaction: bool,
    #[serde(default = "default_true")]
    pub position_update: bool,
    #[serde(default = "default_true")]
    pub resolution: bool,
    #[serde(default = "default_true")]
    pub price_update: bool,
    #[serde(default = "default_true")]
    pub volume_update: bool,
}

fn default_true() -> bool {
    true
}

impl KindPreferences {
    pub fn enabled_for(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Transaction => self.transaction,
            EventKind::PositionUpdate => self.position_update,
            EventKind::Resolution => self.resolution,
            EventKind::PriceUpdate => self.price_update,
            EventKind::VolumeUpdate => self.volume_update,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    #[serde(default)]
    pub min_transaction_amount: Option<f64>,
    #[serde(default)]
    pub min_position_size: Option<f64>,
    #[serde(default)]
    pub min_price_change_pct: Option<f64>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_transaction_amount: None,
            min_position_size: None,
            min_price_change_pct: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuietHours {
    pub enabled: bool,
    /// Minutes since midnight, in `time_zone`.
    pub start_minute: u16,
    pub end_minute: u16,
    pub time_zone: String,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start_minute: 0,
            end_minute: 0,
            time_zone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecipientProfile {
    pub recipient_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub kinds: KindPreferences,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub quiet_hours: QuietHours,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub tracked_wallets: Vec<String>,
    #[serde(default)]
    pub tracked_markets: Vec<String>,
    /// Max notifications per rolling minute, per the frequency-limit stage.
    #[serde(default = "default_frequency_limit")]
    pub max_per_minute: u32,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Monotonic record version, bumped on every mutating API call.
    #[serde(default)]
    pub schema_version: u16,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_frequency_limit() -> u32 {
    20
}

impl RecipientProfile {
    pub fn new(recipient_id: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            enabled: true,
            kinds: KindPreferences::default(),
            thresholds: Thresholds::default(),
            quiet_hours: QuietHours::default(),
            language: default_language(),
            tracked_wallets: Vec::new(),
            tracked_markets: Vec::new(),
            max_per_minute: default_frequency_limit(),
            updated_at: Utc::now(),
            schema_version: 1,
        }
    }
}

// ============================================================================
// Core Data Model — Notification & Priority
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Weight used in the queue's score formula; higher priority sorts first.
    pub fn weight(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }
}

/// A notification produced by the template selector for one recipient.
///
/// Immutable once produced; `attempts` and `scheduled_for` are the only
/// fields the queue manager mutates in place as it moves the item between
/// ready, delayed, inflight and dead.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub notif_id: String,
    pub recipient_id: String,
    pub kind: EventKind,
    pub priority: Priority,
    pub title: String,
    pub body: String,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    pub correlation: Correlation,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    pub event_id: String,
    #[serde(default)]
    pub subject_wallet: Option<String>,
    #[serde(default)]
    pub subject_market: Option<String>,
}

/// State a queue item currently occupies; exactly one at any instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Ready,
    Delayed,
    Inflight,
    Dead,
}

/// A notification plus the queue's own bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    #[serde(flatten)]
    pub notification: Notification,
    pub state: QueueState,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub visible_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_delay_ms: u64,
}

// ============================================================================
// Dispatch Outcome
// ============================================================================

/// Classification of a single dispatch attempt's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    Transient,
    Permanent,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub outcome: SendOutcome,
    pub status_code: Option<u16>,
    pub retry_after: Option<std::time::Duration>,
    pub error_message: Option<String>,
}

impl DispatchResult {
    pub fn ok() -> Self {
        Self {
            outcome: SendOutcome::Ok,
            status_code: Some(200),
            retry_after: None,
            error_message: None,
        }
    }

    pub fn transient(message: String, retry_after: Option<std::time::Duration>) -> Self {
        Self {
            outcome: SendOutcome::Transient,
            status_code: None,
            retry_after,
            error_message: Some(message),
        }
    }

    pub fn permanent(status_code: Option<u16>, message: String) -> Self {
        Self {
            outcome: SendOutcome::Permanent,
            status_code,
            retry_after: None,
            error_message: Some(message),
        }
    }
}

// ============================================================================
// In-Flight Tracking
// ============================================================================

/// Tracks a notification currently owned by a dispatch worker.
#[derive(Debug, Clone)]
pub struct InFlightNotification {
    pub notif_id: String,
    pub recipient_id: String,
    pub dedup_key: String,
    pub started_at: Instant,
}

impl InFlightNotification {
    pub fn new(notification: &Notification) -> Self {
        Self {
            notif_id: notification.notif_id.clone(),
            recipient_id: notification.recipient_id.clone(),
            dedup_key: notification.dedup_key.clone(),
            started_at: Instant::now(),
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Token-bucket rate limit config: a rate plus a burst capacity, both for
/// the global bucket and for each per-recipient bucket. Rate and burst are
/// independent knobs — burst bounds how many tokens can accumulate while
/// idle, rate bounds the steady-state refill.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitConfig {
    pub global_rps: u32,
    pub global_burst: u32,
    pub per_recipient_rps: u32,
    pub per_recipient_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rps: 50,
            global_burst: 100,
            per_recipient_rps: 2,
            per_recipient_burst: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueueSettings {
    pub max_ready_capacity: u32,
    pub max_concurrent_dispatch: u32,
    pub coalesce_threshold: u32,
    pub dead_letter_retention_hours: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_ready_capacity: 100_000,
            max_concurrent_dispatch: 64,
            coalesce_threshold: 5,
            dead_letter_retention_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
    pub max_reset_timeout_ms: u64,
    /// Max concurrent probe dispatches allowed while half-open; bounds how
    /// many requests race ahead of the first probe's result.
    pub half_open_probe_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 5_000,
            max_reset_timeout_ms: 120_000,
            half_open_probe_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DedupConfig {
    pub ttl_seconds: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { ttl_seconds: 3_600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TimerConfig {
    pub promote_tick_ms: u64,
    pub sweep_tick_ms: u64,
    pub metrics_tick_ms: u64,
    pub shutdown_deadline_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            promote_tick_ms: 100,
            sweep_tick_ms: 1_000,
            metrics_tick_ms: 10_000,
            shutdown_deadline_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TargetsConfig {
    pub chat_webhook_url: String,
    pub chat_signing_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PipelineConfig {
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub timers: TimerConfig,
    pub targets: TargetsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandbyConfig {
    pub enabled: bool,
    pub redis_url: String,
    pub lock_key: String,
    pub instance_id: String,
    pub lock_ttl_seconds: u64,
    pub refresh_interval_seconds: u64,
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_key: "market-pulse:leader".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            lock_ttl_seconds: 30,
            refresh_interval_seconds: 10,
        }
    }
}

// ============================================================================
// Warning / Alerting Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum WarningCategory {
    Ingestion,
    Routing,
    Queue,
    Dispatch,
    RateLimiting,
    CircuitBreaker,
    Configuration,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub ingest_connected: bool,
    pub queue_depth_ready: u64,
    pub queue_depth_delayed: u64,
    pub queue_depth_inflight: u64,
    pub queue_depth_dead: u64,
    pub dispatch_success_rate: f64,
    pub circuit_open_count: u32,
    pub active_warnings: u32,
    pub critical_warnings: u32,
    pub issues: Vec<String>,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("queue error: {0}")]
    Queue(String),

    #[error("ingest error: {0}")]
    Ingest(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("redis error: {0}")]
    Redis(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
