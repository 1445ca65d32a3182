//! Market Pulse notification pipeline — production binary.
//!
//! Wires configuration, the durable SQLite-backed queue, the event source
//! adapter, the dispatcher, the Supervisor's background ticks, and the HTTP
//! API together, then runs until a shutdown signal arrives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusBuilder;
use mp_common::{Event, EventKind};
use mp_config::AppConfig;
use mp_ingest::{AdapterConfig, FrameParser, HttpEventSource, IngestAdapter, RawFrame};
use mp_queue::{QueueStore, RetryPolicy, SqliteQueueStore};
use mp_router::api::auth::AuthConfig as ApiAuthConfig;
use mp_router::api::{create_router, AppState};
use mp_router::{
    CircuitBreakerRegistry, DispatchPool, Dispatcher, HealthService, HealthServiceConfig, InMemoryProfileStore, InterestIndex,
    LifecycleConfig, LifecycleManager, NoOpAlertSink, NoOpHistorySink, PreferenceFilter, ProfileStore, QueueManager, WarningService,
    WarningServiceConfig, WebhookChatClient,
};
use mp_standby::{LeaderElection, LeaderElectionConfig};
use serde::Deserialize;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::{net::TcpListener, signal, sync::mpsc};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    mp_common::logging::init_logging("mp-router");

    let config = AppConfig::load().context("failed to load configuration")?;
    info!(dev_mode = config.dev_mode, data_dir = %config.data_dir, "starting market pulse router");

    let prometheus_handle = PrometheusBuilder::new().install_recorder().context("failed to install prometheus recorder")?;

    let pool = SqlitePoolOptions::new()
        .max_connections(config.store.max_connections)
        .connect(&config.store.database_url)
        .await
        .context("failed to connect to queue store")?;
    let queue_store = SqliteQueueStore::new(pool, config.pipeline.queue.max_ready_capacity);
    queue_store.init_schema().await.context("failed to initialize queue schema")?;
    let queue_store: Arc<dyn QueueStore> = Arc::new(queue_store);

    let profile_store: Arc<dyn ProfileStore> = Arc::new(InMemoryProfileStore::new());

    let instance_id = std::env::var("MP_INSTANCE_ID")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

    let leader_election = if config.standby.enabled {
        let election_config = LeaderElectionConfig {
            lock_ttl_seconds: config.standby.lock_ttl_seconds,
            heartbeat_interval_seconds: config.standby.heartbeat_interval_seconds,
            ..LeaderElectionConfig::new(config.standby.redis_url.clone())
                .with_lock_key(config.standby.lock_key.clone())
                .with_instance_id(instance_id.clone())
        };
        let election = Arc::new(LeaderElection::new(election_config).await.context("failed to initialize leader election")?);
        election.clone().start().await.context("failed to start leader election")?;
        info!(instance_id = %instance_id, "active/standby leader election enabled");
        Some(election)
    } else {
        info!("standby mode disabled, this instance always processes");
        None
    };

    let interest_index = Arc::new(InterestIndex::new());
    warm_interest_index(&profile_store, &interest_index).await;

    let alert_sink = Arc::new(NoOpAlertSink);
    let warning_service = Arc::new(WarningService::with_alert_sink(WarningServiceConfig::default(), alert_sink));
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.pipeline.circuit_breaker.clone()));
    let health_service = Arc::new(HealthService::new(HealthServiceConfig::default(), warning_service.clone(), breakers.clone()));

    let queue_manager = Arc::new(QueueManager::new(
        queue_store.clone(),
        RetryPolicy::from(config.pipeline.retry.clone()),
        config.pipeline.queue.clone(),
    ));
    let preference_filter = Arc::new(PreferenceFilter::new(queue_store.clone(), config.pipeline.dedup.ttl_seconds));

    let dispatch_pool = Arc::new(DispatchPool::new(config.pipeline.rate_limits.clone(), config.pipeline.queue.max_concurrent_dispatch));
    let chat_client = Arc::new(WebhookChatClient::new(
        config.pipeline.targets.chat_webhook_url.clone(),
        config.pipeline.targets.chat_signing_secret.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(queue_manager.clone(), dispatch_pool, chat_client, breakers.clone(), 30_000));

    let lifecycle = LifecycleManager::start(
        queue_manager.clone(),
        dispatcher,
        warning_service.clone(),
        health_service.clone(),
        LifecycleConfig {
            timers: config.pipeline.timers.clone(),
            ..LifecycleConfig::default()
        },
        leader_election.clone(),
    );

    let ingest_handle = start_ingest(
        &config,
        interest_index.clone(),
        profile_store.clone(),
        preference_filter.clone(),
        queue_manager.clone(),
        health_service.clone(),
    );

    let auth_config = Arc::new(match config.auth.mode.as_str() {
        "bearer" => ApiAuthConfig::bearer(config.auth.bearer_token.clone()),
        _ => ApiAuthConfig::default(),
    });

    let state = AppState {
        profile_store,
        interest_index,
        preference_filter,
        queue_manager: queue_manager.clone(),
        warning_service,
        health_service,
        circuit_breaker_registry: breakers,
        history_sink: Arc::new(NoOpHistorySink),
        leader_election,
        instance_id,
        prometheus_handle,
    };

    let cors = if config.http.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(AllowOrigin::any()).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
    } else {
        let origins: Vec<_> = config.http.cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(origins).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
    };

    let app = create_router(state)
        .layer(axum::middleware::from_fn_with_state(auth_config, mp_router::api::auth::auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP API listening");
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "HTTP server exited with error");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining");

    lifecycle.shutdown().await;
    ingest_handle.abort();
    server_task.abort();

    info!("market pulse router shutdown complete");
    Ok(())
}

/// Loads every stored recipient profile into the Interest Index so the
/// first event after startup is routed correctly, without waiting on a
/// `PUT /recipients/{id}` to repopulate it.
async fn warm_interest_index(profile_store: &Arc<dyn ProfileStore>, interest_index: &Arc<InterestIndex>) {
    match profile_store.list().await {
        Ok(profiles) => {
            let count = profiles.len();
            for profile in profiles {
                interest_index.add(&profile.recipient_id, &profile.tracked_wallets, &profile.tracked_markets);
                if profile.tracked_wallets.is_empty() && profile.tracked_markets.is_empty() {
                    interest_index.add_global(&profile.recipient_id);
                }
            }
            info!(recipients = count, "interest index warmed from profile store");
        }
        Err(e) => {
            warn!(error = %e, "failed to warm interest index from profile store");
            interest_index.record_read_error();
        }
    }
}

/// JSON shape of one upstream frame, missing only the sequence number the
/// adapter assigns on ingest.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingEvent {
    event_id: String,
    kind: EventKind,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
    #[serde(default)]
    subject_wallet: Option<String>,
    #[serde(default)]
    subject_market: Option<String>,
}

/// Starts the reconnecting event source adapter and the routing loop that
/// turns each ingested event into queued notifications. Returns the join
/// handle for the routing task; the adapter itself is supervised from
/// within (it owns its own reconnect loop).
fn start_ingest(
    config: &AppConfig,
    interest_index: Arc<InterestIndex>,
    profile_store: Arc<dyn ProfileStore>,
    preference_filter: Arc<PreferenceFilter>,
    queue_manager: Arc<QueueManager>,
    health_service: Arc<HealthService>,
) -> tokio::task::JoinHandle<()> {
    let seq = Arc::new(AtomicU64::new(0));
    let parser: Arc<dyn FrameParser> = Arc::new(move |frame: &RawFrame| {
        let incoming: IncomingEvent = serde_json::from_slice(frame).map_err(|e| mp_ingest::IngestError::Parse(e.to_string()))?;
        Ok(Event {
            event_id: incoming.event_id,
            kind: incoming.kind,
            occurred_at: incoming.occurred_at,
            payload: incoming.payload,
            subject_wallet: incoming.subject_wallet,
            subject_market: incoming.subject_market,
            ingest_seq: seq.fetch_add(1, Ordering::SeqCst),
        })
    });

    let adapter_config = AdapterConfig {
        source_url: config.ingest.source_url.clone(),
        initial_backoff_ms: config.ingest.initial_backoff_ms,
        max_backoff_ms: config.ingest.max_backoff_ms,
        backoff_multiplier: config.ingest.backoff_multiplier,
        heartbeat_interval_ms: config.ingest.heartbeat_interval_ms,
        healthy_window_secs: config.ingest.healthy_window_secs,
        parse_error_ratio_threshold: config.ingest.parse_error_ratio_threshold,
        parse_error_window: config.ingest.parse_error_window as usize,
        circuit_breaker_reset_ms: config.ingest.circuit_breaker_reset_ms,
    };

    let source = Arc::new(HttpEventSource::new(config.ingest.source_url.clone()));
    let (tx, mut rx) = mpsc::channel::<Event>(1024);
    let adapter = Arc::new(IngestAdapter::new("market-feed", adapter_config, source, parser, tx));

    tokio::spawn({
        let adapter = adapter.clone();
        async move {
            if let Err(e) = adapter.start().await {
                warn!(error = %e, "event source adapter exited");
            }
        }
    });

    tokio::spawn({
        let adapter = adapter.clone();
        let health_service = health_service.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                health_service.set_ingest_connected(adapter.health().is_healthy());
            }
        }
    });

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            route_event(&event, &interest_index, &profile_store, &preference_filter, &queue_manager).await;
        }
    })
}

/// Routes one ingested event to every interested recipient, running each
/// candidate notification through template selection and the preference
/// filter before enqueueing (or deferring, on a quiet-hours/frequency hit).
async fn route_event(
    event: &Event,
    interest_index: &Arc<InterestIndex>,
    profile_store: &Arc<dyn ProfileStore>,
    preference_filter: &Arc<PreferenceFilter>,
    queue_manager: &Arc<QueueManager>,
) {
    mp_router::RouterMetrics::record_event_ingested(event.kind.as_str());

    let recipients = interest_index.interested(event);
    mp_router::RouterMetrics::record_interest_match(recipients.len());

    for recipient_id in recipients {
        let profile = match profile_store.get(&recipient_id).await {
            Ok(Some(p)) => p,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, recipient_id = %recipient_id, "failed to load recipient profile");
                continue;
            }
        };

        let Some(mut notification) = mp_router::templates::select(event, &profile) else { continue };

        let verdict = match preference_filter.evaluate(&notification, &profile, event, Utc::now()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, recipient_id = %recipient_id, "preference filter failed");
                continue;
            }
        };

        match verdict {
            mp_router::FilterVerdict::Pass => {
                if let Err(e) = queue_manager.enqueue(notification).await {
                    warn!(error = %e, recipient_id = %recipient_id, "failed to enqueue notification");
                }
            }
            mp_router::FilterVerdict::Defer(until) => {
                notification.scheduled_for = until;
                mp_router::RouterMetrics::record_filter_defer();
                if let Err(e) = queue_manager.enqueue(notification).await {
                    warn!(error = %e, recipient_id = %recipient_id, "failed to enqueue deferred notification");
                }
            }
            mp_router::FilterVerdict::Drop(reason) => {
                mp_router::RouterMetrics::record_filter_drop(&format!("{reason:?}"));
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to install signal handler").recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
