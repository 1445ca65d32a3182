//! Routing and delivery pipeline between the ingest boundary and the
//! chat/webhook delivery boundary:
//! - `interest`: who should ever hear about a wallet, a market, or everything
//! - `store`: recipient profile persistence
//! - `templates`: event -> candidate notification
//! - `prefs`: the preference/threshold/quiet-hours/dedup/frequency filter chain
//! - `queue_manager`: facade over the durable queue plus per-recipient coalescing
//! - `dispatch`: rate limiting, circuit breaking, and sending
//! - `circuit_breaker_registry`: per-endpoint breaker state, shared by dispatch and health
//! - `warning`: in-memory warning storage feeding monitoring and alerting
//! - `alert`: the outbound alerting boundary
//! - `health`: rolled-up health reporting
//! - `metrics`: Prometheus metric emission
//! - `lifecycle`: the Supervisor — startup order, background ticks, shutdown
//! - `api`: the HTTP surface

pub mod alert;
pub mod api;
pub mod circuit_breaker_registry;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod interest;
pub mod lifecycle;
pub mod metrics;
pub mod prefs;
pub mod queue_manager;
pub mod store;
pub mod templates;
pub mod warning;

pub use alert::{AlertSink, BatchingAlertSink, NoOpAlertSink, WebhookAlertSink};
pub use circuit_breaker_registry::{CircuitBreakerRegistry, CircuitBreakerState, CircuitBreakerStats};
pub use dispatch::mediator::{ChatClient, WebhookChatClient};
pub use dispatch::pool::DispatchPool;
pub use dispatch::{DispatchPassStats, Dispatcher};
pub use health::{HealthService, HealthServiceConfig};
pub use interest::InterestIndex;
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use metrics::RouterMetrics;
pub use prefs::{DropReason, FilterVerdict, PreferenceFilter};
pub use queue_manager::{CoalescedBatch, QueueManager};
pub use store::{HistoryRecord, HistorySink, InMemoryProfileStore, NoOpHistorySink, ProfileStore};
pub use warning::{WarningService, WarningServiceConfig};

pub use mp_common::{PipelineError, Result};
