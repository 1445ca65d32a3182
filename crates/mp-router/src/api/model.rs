use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use mp_common::{HealthReport, Priority, QuietHours, Thresholds};

/// Request body for creating or replacing a recipient profile.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PutRecipientRequest {
    pub enabled: Option<bool>,
    pub thresholds: Option<Thresholds>,
    pub quiet_hours: Option<QuietHours>,
    pub language: Option<String>,
    pub max_per_minute: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TrackWalletRequest {
    pub wallet: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TrackMarketRequest {
    pub market: String,
}

/// Manual notification enqueue, bypassing event ingestion.
#[derive(Debug, Deserialize, ToSchema)]
pub struct EnqueueNotificationRequest {
    pub recipient_id: String,
    pub title: String,
    pub body: String,
    pub priority: Option<Priority>,
    pub dedup_key: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EnqueueNotificationResponse {
    pub notif_id: String,
    pub status: String,
}

/// Publishes one event to every interested recipient, subject to quiet
/// hours and deduplication like any other event.
#[derive(Debug, Deserialize, ToSchema)]
pub struct BroadcastRequest {
    pub kind: mp_common::EventKind,
    pub payload: serde_json::Value,
    pub subject_wallet: Option<String>,
    pub subject_market: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BroadcastResponse {
    pub recipients_considered: usize,
    pub notifications_enqueued: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MonitoringResponse {
    pub health_report: HealthReport,
    pub active_warnings: u32,
    pub critical_warnings: u32,
    pub circuit_breakers_open: u32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub instance_id: String,
    pub is_leader: bool,
    pub standby_enabled: bool,
    pub recipients_tracked: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProbeResponse {
    pub status: String,
}

#[derive(Debug, Deserialize, Default, ToSchema)]
pub struct WarningsQuery {
    pub severity: Option<String>,
    pub category: Option<String>,
}
