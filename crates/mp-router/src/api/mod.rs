//! HTTP API surface: health/liveness/readiness probes, monitoring and
//! Prometheus metrics, recipient profile CRUD, manual notification
//! enqueue, event broadcast, instance status, and delivery history.
//!
//! Kept in the teacher's shape (one `AppState`, one `create_router`,
//! handlers grouped by concern, `utoipa` annotations for the generated
//! OpenAPI doc) with the dashboard-compat/test/seed endpoints dropped —
//! this pipeline's HTTP surface is an operational control plane for one
//! system, not a Java-dashboard-compatible facade.

pub mod auth;
pub mod model;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use mp_common::{Correlation, Notification, Priority, RecipientProfile, Result};
use mp_standby::LeaderElection;
use tracing::{info, warn};
use uuid::Uuid;
use utoipa::OpenApi;

use crate::health::HealthService;
use crate::interest::InterestIndex;
use crate::prefs::{FilterVerdict, PreferenceFilter};
use crate::queue_manager::QueueManager;
use crate::store::{HistorySink, ProfileStore};
use crate::warning::WarningService;
use crate::{templates, CircuitBreakerRegistry};

use model::{
    BroadcastRequest, BroadcastResponse, EnqueueNotificationRequest, EnqueueNotificationResponse, MonitoringResponse, ProbeResponse,
    PutRecipientRequest, StatusResponse, TrackMarketRequest, TrackWalletRequest,
};

#[derive(Clone)]
pub struct AppState {
    pub profile_store: Arc<dyn ProfileStore>,
    pub interest_index: Arc<InterestIndex>,
    pub preference_filter: Arc<PreferenceFilter>,
    pub queue_manager: Arc<QueueManager>,
    pub warning_service: Arc<WarningService>,
    pub health_service: Arc<HealthService>,
    pub circuit_breaker_registry: Arc<CircuitBreakerRegistry>,
    pub history_sink: Arc<dyn HistorySink>,
    pub leader_election: Option<Arc<LeaderElection>>,
    pub instance_id: String,
    pub prometheus_handle: PrometheusHandle,
}

#[derive(OpenApi)]
#[openapi(paths(health_handler, monitoring_handler, status_handler))]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/monitoring", get(monitoring_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/recipients/:id", get(get_recipient).put(put_recipient).delete(delete_recipient))
        .route("/recipients/:id/wallets", post(track_wallet))
        .route("/recipients/:id/markets", post(track_market))
        .route("/recipients/:id/history", get(get_recipient_history))
        .route("/notifications", post(enqueue_notification))
        .route("/broadcast", post(broadcast_event))
        .with_state(state)
}

#[utoipa::path(get, path = "/health", responses((status = 200, body = ProbeResponse)))]
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let depths = state.queue_manager.depths().await.unwrap_or(mp_queue::QueueDepths { ready: 0, delayed: 0, inflight: 0, dead: 0 });
    let status = if state.health_service.is_healthy(&depths) { "UP" } else { "DEGRADED" };
    Json(ProbeResponse { status: status.to_string() })
}

async fn liveness_handler() -> impl IntoResponse {
    Json(ProbeResponse { status: "LIVE".to_string() })
}

async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.queue_manager.depths().await {
        Ok(_) => Json(ProbeResponse { status: "READY".to_string() }).into_response(),
        Err(e) => {
            warn!(error = %e, "readiness check failed: store unreachable");
            (StatusCode::SERVICE_UNAVAILABLE, Json(ProbeResponse { status: "NOT_READY".to_string() })).into_response()
        }
    }
}

#[utoipa::path(get, path = "/monitoring", responses((status = 200, body = MonitoringResponse)))]
async fn monitoring_handler(State(state): State<AppState>) -> impl IntoResponse {
    let depths = match state.queue_manager.depths().await {
        Ok(d) => d,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let health_report = state.health_service.build_report(&depths);
    let response = MonitoringResponse {
        active_warnings: health_report.active_warnings,
        critical_warnings: health_report.critical_warnings,
        circuit_breakers_open: state.circuit_breaker_registry.open_count() as u32,
        health_report,
    };
    Json(response).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus_handle.render()
}

#[utoipa::path(get, path = "/status", responses((status = 200, body = StatusResponse)))]
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let is_leader = state.leader_election.as_ref().map(|l| l.is_leader()).unwrap_or(true);
    Json(StatusResponse {
        instance_id: state.instance_id.clone(),
        is_leader,
        standby_enabled: state.leader_election.is_some(),
        recipients_tracked: state.interest_index.wallet_count() + state.interest_index.market_count(),
    })
}

async fn get_recipient(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.profile_store.get(&id).await {
        Ok(Some(profile)) => Json(profile).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Creates the profile if absent, otherwise applies the given fields on
/// top of the existing one. Invalidates the recipient's cached interest
/// entries so the next event sees the change immediately.
async fn put_recipient(State(state): State<AppState>, Path(id): Path<String>, Json(req): Json<PutRecipientRequest>) -> impl IntoResponse {
    let mut profile = match state.profile_store.get(&id).await {
        Ok(Some(existing)) => existing,
        Ok(None) => RecipientProfile::new(&id),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    if let Some(enabled) = req.enabled {
        profile.enabled = enabled;
    }
    if let Some(thresholds) = req.thresholds {
        profile.thresholds = thresholds;
    }
    if let Some(quiet_hours) = req.quiet_hours {
        profile.quiet_hours = quiet_hours;
    }
    if let Some(language) = req.language {
        profile.language = language;
    }
    if let Some(max_per_minute) = req.max_per_minute {
        profile.max_per_minute = max_per_minute;
    }
    profile.updated_at = Utc::now();

    if let Err(e) = state.profile_store.put(profile.clone()).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    state.interest_index.remove(&id);
    state.interest_index.add(&id, &profile.tracked_wallets, &profile.tracked_markets);
    if profile.tracked_wallets.is_empty() && profile.tracked_markets.is_empty() {
        state.interest_index.add_global(&id);
    }

    Json(profile).into_response()
}

async fn delete_recipient(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.profile_store.delete(&id).await {
        Ok(true) => {
            state.interest_index.remove(&id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn track_wallet(State(state): State<AppState>, Path(id): Path<String>, Json(req): Json<TrackWalletRequest>) -> impl IntoResponse {
    let mut profile = match load_or_404(&state, &id).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if !profile.tracked_wallets.contains(&req.wallet) {
        profile.tracked_wallets.push(req.wallet.clone());
    }
    if let Err(e) = state.profile_store.put(profile.clone()).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    state.interest_index.add(&id, &[req.wallet], &[]);
    Json(profile).into_response()
}

async fn track_market(State(state): State<AppState>, Path(id): Path<String>, Json(req): Json<TrackMarketRequest>) -> impl IntoResponse {
    let mut profile = match load_or_404(&state, &id).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if !profile.tracked_markets.contains(&req.market) {
        profile.tracked_markets.push(req.market.clone());
    }
    if let Err(e) = state.profile_store.put(profile.clone()).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    state.interest_index.add(&id, &[], &[req.market]);
    Json(profile).into_response()
}

async fn load_or_404(state: &AppState, id: &str) -> std::result::Result<RecipientProfile, axum::response::Response> {
    match state.profile_store.get(id).await {
        Ok(Some(p)) => Ok(p),
        Ok(None) => Err(StatusCode::NOT_FOUND.into_response()),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()),
    }
}

async fn get_recipient_history(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.history_sink.list(&id, 100).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn enqueue_notification(State(state): State<AppState>, Json(req): Json<EnqueueNotificationRequest>) -> impl IntoResponse {
    let notif_id = Uuid::new_v4().to_string();
    let notification = Notification {
        notif_id: notif_id.clone(),
        recipient_id: req.recipient_id,
        kind: mp_common::EventKind::Transaction,
        priority: req.priority.unwrap_or(Priority::Medium),
        title: req.title,
        body: req.body,
        dedup_key: req.dedup_key.unwrap_or_else(|| notif_id.clone()),
        created_at: Utc::now(),
        scheduled_for: Utc::now(),
        attempts: 0,
        correlation: Correlation { event_id: notif_id.clone(), subject_wallet: None, subject_market: None },
    };

    match state.queue_manager.enqueue(notification).await {
        Ok(()) => {
            info!(notif_id = %notif_id, "manual notification enqueued");
            Json(EnqueueNotificationResponse { notif_id, status: "ACCEPTED".to_string() }).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Builds an `Event` from the request and walks it through the same
/// select -> filter -> enqueue path as an ingested event, over every
/// recipient the Interest Index considers relevant (including global
/// subscribers) — it participates in quiet hours and deduplication like
/// any other delivery.
async fn broadcast_event(State(state): State<AppState>, Json(req): Json<BroadcastRequest>) -> impl IntoResponse {
    let event = mp_common::Event {
        event_id: Uuid::new_v4().to_string(),
        kind: req.kind,
        occurred_at: Utc::now(),
        payload: req.payload,
        subject_wallet: req.subject_wallet,
        subject_market: req.subject_market,
        ingest_seq: 0,
    };

    let recipients = state.interest_index.interested(&event);
    let mut enqueued = 0usize;

    for recipient_id in &recipients {
        let profile = match state.profile_store.get(recipient_id).await {
            Ok(Some(p)) => p,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, recipient_id, "failed to load recipient profile during broadcast");
                continue;
            }
        };

        let Some(notification) = templates::select(&event, &profile) else { continue };
        let verdict = match state.preference_filter.evaluate(&notification, &profile, &event, Utc::now()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, recipient_id, "preference filter failed during broadcast");
                continue;
            }
        };

        if verdict == FilterVerdict::Pass {
            if let Err(e) = state.queue_manager.enqueue(notification).await {
                warn!(error = %e, recipient_id, "failed to enqueue broadcast notification");
                continue;
            }
            enqueued += 1;
        }
    }

    Json(BroadcastResponse { recipients_considered: recipients.len(), notifications_enqueued: enqueued })
}

#[allow(dead_code)]
fn api_doc() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}
